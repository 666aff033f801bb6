//! Shared metrics aggregation.
//!
//! The aggregator is the single sink every executed request reports into.
//! It holds one mutex; [`Metrics::record`], [`Metrics::snapshot`] and
//! [`Metrics::reset`] are all safe under concurrent callers, and a snapshot
//! is a consistent copy taken under the lock, never a live view.

use hdrhistogram::Histogram;
use parking_lot::Mutex;

/// Latency percentiles carried alongside the counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize)]
pub struct LatencyPercentiles {
    pub p50_us: u64,
    pub p90_us: u64,
    pub p99_us: u64,
}

/// A consistent copy of the aggregator state.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_us: u64,
    /// Zero means "no samples yet"; the first sample overrides it.
    pub min_response_time_us: u64,
    pub max_response_time_us: u64,
    /// Throughput per aggregated worker-second:
    /// `successful / (total_response_time_us / 1e6 / worker_count)`.
    ///
    /// This is the accounting the engine has always used; a driver that
    /// records wall-clock start/end times can compute wall-clock RPS from
    /// `total_requests` instead.
    pub requests_per_second: f64,
    pub avg_response_time_ms: f64,
    pub latency: LatencyPercentiles,
}

impl MetricsSnapshot {
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64 * 100.0
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 100.0;
        }
        self.successful_requests as f64 / self.total_requests as f64 * 100.0
    }
}

struct Inner {
    total: u64,
    succeeded: u64,
    failed: u64,
    sum_us: u64,
    min_us: u64,
    max_us: u64,
    hist: Histogram<u64>,
}

impl Inner {
    fn new() -> Self {
        Self {
            total: 0,
            succeeded: 0,
            failed: 0,
            sum_us: 0,
            min_us: 0,
            max_us: 0,
            hist: Histogram::new(3).expect("create histogram"),
        }
    }
}

pub struct Metrics {
    inner: Mutex<Inner>,
}

impl Metrics {
    pub fn new() -> Self {
        Self { inner: Mutex::new(Inner::new()) }
    }

    /// Credit one executed request. Exactly one of the success/failure
    /// counters advances per call.
    pub fn record(&self, response_time_us: u64, success: bool) {
        let mut m = self.inner.lock();
        m.total += 1;
        if success {
            m.succeeded += 1;
        } else {
            m.failed += 1;
        }
        m.sum_us += response_time_us;
        if m.min_us == 0 || response_time_us < m.min_us {
            m.min_us = response_time_us;
        }
        if response_time_us > m.max_us {
            m.max_us = response_time_us;
        }
        m.hist.saturating_record(response_time_us);
    }

    /// Take a consistent copy, computing the derived fields under the lock.
    pub fn snapshot(&self, worker_count: usize) -> MetricsSnapshot {
        let m = self.inner.lock();
        let mut snap = MetricsSnapshot {
            total_requests: m.total,
            successful_requests: m.succeeded,
            failed_requests: m.failed,
            total_response_time_us: m.sum_us,
            min_response_time_us: m.min_us,
            max_response_time_us: m.max_us,
            ..MetricsSnapshot::default()
        };
        if m.total > 0 {
            snap.avg_response_time_ms = m.sum_us as f64 / m.total as f64 / 1000.0;
            let worker_seconds = m.sum_us as f64 / 1_000_000.0 / worker_count.max(1) as f64;
            if worker_seconds > 0.0 {
                snap.requests_per_second = m.succeeded as f64 / worker_seconds;
            }
            snap.latency = LatencyPercentiles {
                p50_us: m.hist.value_at_quantile(0.50),
                p90_us: m.hist.value_at_quantile(0.90),
                p99_us: m.hist.value_at_quantile(0.99),
            };
        }
        snap
    }

    pub fn reset(&self) {
        *self.inner.lock() = Inner::new();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_accounting() {
        let m = Metrics::new();
        m.record(1_000, true);
        m.record(3_000, false);
        m.record(2_000, true);

        let s = m.snapshot(1);
        assert_eq!(s.total_requests, 3);
        assert_eq!(s.successful_requests, 2);
        assert_eq!(s.failed_requests, 1);
        assert_eq!(s.total_response_time_us, 6_000);
        assert_eq!(s.min_response_time_us, 1_000);
        assert_eq!(s.max_response_time_us, 3_000);
    }

    #[test]
    fn test_avg_between_min_and_max() {
        let m = Metrics::new();
        for us in [120, 480, 950, 10_000] {
            m.record(us, true);
        }
        let s = m.snapshot(1);
        let avg_us = s.avg_response_time_ms * 1000.0;
        assert!(s.min_response_time_us as f64 <= avg_us);
        assert!(avg_us <= s.max_response_time_us as f64);

        let expected = s.total_response_time_us as f64 / s.total_requests as f64 / 1000.0;
        assert!((s.avg_response_time_ms - expected).abs() < f64::EPSILON);
    }

    #[test]
    fn test_min_sentinel_first_sample_overrides() {
        let m = Metrics::new();
        assert_eq!(m.snapshot(1).min_response_time_us, 0);
        m.record(5_000, true);
        assert_eq!(m.snapshot(1).min_response_time_us, 5_000);
        m.record(7_000, true);
        assert_eq!(m.snapshot(1).min_response_time_us, 5_000);
    }

    #[test]
    fn test_per_worker_throughput() {
        let m = Metrics::new();
        // 4 successes, each taking 1s of worker time, spread over 2 workers:
        // 4 / (4s / 2) = 2 rps.
        for _ in 0..4 {
            m.record(1_000_000, true);
        }
        let s = m.snapshot(2);
        assert!((s.requests_per_second - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_snapshot_is_copy_and_reset() {
        let m = Metrics::new();
        m.record(1_000, true);
        let before = m.snapshot(1);
        m.record(1_000, false);
        assert_eq!(before.total_requests, 1, "snapshot must not be a live view");

        m.reset();
        let s = m.snapshot(1);
        assert_eq!(s, MetricsSnapshot::default());
    }

    #[test]
    fn test_concurrent_record() {
        use std::sync::Arc;
        let m = Arc::new(Metrics::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let m = Arc::clone(&m);
            handles.push(std::thread::spawn(move || {
                for i in 0..1_000 {
                    m.record(i + 1, i % 2 == 0);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let s = m.snapshot(8);
        assert_eq!(s.total_requests, 8_000);
        assert_eq!(s.successful_requests + s.failed_requests, 8_000);
    }
}
