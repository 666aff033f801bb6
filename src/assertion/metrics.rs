use std::fmt;
use std::sync::Arc;

use itertools::Itertools;

use super::response::Logic;
use crate::metrics::MetricsSnapshot;

/// A predicate over an aggregate metrics snapshot.
#[derive(Clone)]
pub enum MetricsAssertion {
    /// Throughput is at least this many requests per second.
    ThroughputAtLeast(f64),
    /// Average response time is at most this many milliseconds.
    AvgResponseTimeUnder(f64),
    /// Maximum response time is at most this many milliseconds.
    MaxResponseTimeUnder(f64),
    /// Error rate is at most this percentage.
    ErrorRateBelow(f64),
    /// Success rate is at least this percentage.
    SuccessRateAtLeast(f64),
    /// At least this many requests were processed.
    TotalRequestsAtLeast(u64),
    Custom { check: Arc<dyn Fn(&MetricsSnapshot) -> bool + Send + Sync>, message: String },
}

impl fmt::Debug for MetricsAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ThroughputAtLeast(rps) => write!(f, "ThroughputAtLeast({rps})"),
            Self::AvgResponseTimeUnder(ms) => write!(f, "AvgResponseTimeUnder({ms}ms)"),
            Self::MaxResponseTimeUnder(ms) => write!(f, "MaxResponseTimeUnder({ms}ms)"),
            Self::ErrorRateBelow(pct) => write!(f, "ErrorRateBelow({pct}%)"),
            Self::SuccessRateAtLeast(pct) => write!(f, "SuccessRateAtLeast({pct}%)"),
            Self::TotalRequestsAtLeast(n) => write!(f, "TotalRequestsAtLeast({n})"),
            Self::Custom { message, .. } => write!(f, "Custom({message:?})"),
        }
    }
}

pub fn throughput_at_least(min_rps: f64) -> MetricsAssertion {
    MetricsAssertion::ThroughputAtLeast(min_rps)
}

pub fn avg_response_time_under(max_ms: f64) -> MetricsAssertion {
    MetricsAssertion::AvgResponseTimeUnder(max_ms)
}

pub fn max_response_time_under(max_ms: f64) -> MetricsAssertion {
    MetricsAssertion::MaxResponseTimeUnder(max_ms)
}

pub fn error_rate_below(max_pct: f64) -> MetricsAssertion {
    MetricsAssertion::ErrorRateBelow(max_pct)
}

pub fn success_rate_at_least(min_pct: f64) -> MetricsAssertion {
    MetricsAssertion::SuccessRateAtLeast(min_pct)
}

pub fn total_requests_at_least(min: u64) -> MetricsAssertion {
    MetricsAssertion::TotalRequestsAtLeast(min)
}

pub fn custom_metrics(
    check: impl Fn(&MetricsSnapshot) -> bool + Send + Sync + 'static,
    message: impl Into<String>,
) -> MetricsAssertion {
    MetricsAssertion::Custom { check: Arc::new(check), message: message.into() }
}

impl MetricsAssertion {
    pub fn check(&self, snapshot: &MetricsSnapshot) -> bool {
        match self {
            Self::ThroughputAtLeast(min_rps) => snapshot.requests_per_second >= *min_rps,
            Self::AvgResponseTimeUnder(max_ms) => snapshot.avg_response_time_ms <= *max_ms,
            Self::MaxResponseTimeUnder(max_ms) => {
                snapshot.max_response_time_us as f64 / 1000.0 <= *max_ms
            }
            Self::ErrorRateBelow(max_pct) => snapshot.error_rate() <= *max_pct,
            Self::SuccessRateAtLeast(min_pct) => snapshot.success_rate() >= *min_pct,
            Self::TotalRequestsAtLeast(min) => snapshot.total_requests >= *min,
            Self::Custom { check, .. } => check(snapshot),
        }
    }

    pub fn failure_message(&self, snapshot: &MetricsSnapshot) -> String {
        match self {
            Self::ThroughputAtLeast(min_rps) => format!(
                "throughput {:.2} rps is below minimum {min_rps} rps",
                snapshot.requests_per_second
            ),
            Self::AvgResponseTimeUnder(max_ms) => format!(
                "average response time {:.2}ms exceeds limit {max_ms}ms",
                snapshot.avg_response_time_ms
            ),
            Self::MaxResponseTimeUnder(max_ms) => format!(
                "maximum response time {:.2}ms exceeds limit {max_ms}ms",
                snapshot.max_response_time_us as f64 / 1000.0
            ),
            Self::ErrorRateBelow(max_pct) => {
                format!("error rate {:.2}% exceeds limit {max_pct}%", snapshot.error_rate())
            }
            Self::SuccessRateAtLeast(min_pct) => format!(
                "success rate {:.2}% is below minimum {min_pct}%",
                snapshot.success_rate()
            ),
            Self::TotalRequestsAtLeast(min) => {
                format!("total requests {} is below minimum {min}", snapshot.total_requests)
            }
            Self::Custom { message, .. } => {
                if message.is_empty() {
                    "custom metrics assertion failed".into()
                } else {
                    message.clone()
                }
            }
        }
    }
}

/// Combines aggregate predicates with AND/OR logic.
#[derive(Debug, Clone, Default)]
pub struct MetricsAssertionGroup {
    pub logic: Logic,
    assertions: Vec<MetricsAssertion>,
}

impl MetricsAssertionGroup {
    pub fn all() -> Self {
        Self { logic: Logic::And, assertions: Vec::new() }
    }

    pub fn any() -> Self {
        Self { logic: Logic::Or, assertions: Vec::new() }
    }

    pub fn add(mut self, assertion: MetricsAssertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn check_all(&self, snapshot: &MetricsSnapshot) -> super::GroupOutcome {
        let mut failures = Vec::new();
        let mut passed_count = 0usize;
        for assertion in &self.assertions {
            if assertion.check(snapshot) {
                passed_count += 1;
            } else {
                failures.push(assertion.failure_message(snapshot));
            }
        }
        let passed = match self.logic {
            Logic::And => failures.is_empty(),
            Logic::Or => passed_count > 0 || self.assertions.is_empty(),
        };
        super::GroupOutcome { passed, logic: self.logic, failures }
    }

    pub fn report(&self, snapshot: &MetricsSnapshot) -> String {
        let outcome = self.check_all(snapshot);
        if outcome.passed {
            return String::new();
        }
        std::iter::once("performance assertion group failed:".to_owned())
            .chain(outcome.failures.iter().enumerate().map(|(i, m)| format!("  {}. {m}", i + 1)))
            .join("\n")
    }
}

/// Run aggregate predicates, collecting failure messages. With `fail_fast`
/// the first failure stops evaluation.
pub fn run_metrics_assertions(
    snapshot: &MetricsSnapshot,
    assertions: &[MetricsAssertion],
    fail_fast: bool,
) -> (bool, Vec<String>) {
    let mut failures = Vec::new();
    for assertion in assertions {
        if !assertion.check(snapshot) {
            failures.push(assertion.failure_message(snapshot));
            if fail_fast {
                break;
            }
        }
    }
    (failures.is_empty(), failures)
}
