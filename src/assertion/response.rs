use std::fmt;
use std::sync::Arc;

use itertools::Itertools;
use serde_json::Value;

use crate::response::Response;
use crate::session::json_path;

/// A predicate over a single response.
#[derive(Clone)]
pub enum ResponseAssertion {
    StatusIs(u16),
    StatusIn(Vec<u16>),
    /// Response time is at most this many milliseconds.
    ResponseTimeUnder(u64),
    BodyContains { text: String, case_sensitive: bool },
    BodyMatches(regex::Regex),
    JsonPathExists(String),
    JsonPathEquals { path: String, expected: Value },
    HeaderExists(String),
    HeaderEquals { name: String, expected: String },
    Custom { check: Arc<dyn Fn(&Response) -> bool + Send + Sync>, message: String },
}

impl fmt::Debug for ResponseAssertion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StatusIs(code) => write!(f, "StatusIs({code})"),
            Self::StatusIn(codes) => write!(f, "StatusIn({codes:?})"),
            Self::ResponseTimeUnder(ms) => write!(f, "ResponseTimeUnder({ms}ms)"),
            Self::BodyContains { text, .. } => write!(f, "BodyContains({text:?})"),
            Self::BodyMatches(re) => write!(f, "BodyMatches({:?})", re.as_str()),
            Self::JsonPathExists(path) => write!(f, "JsonPathExists({path:?})"),
            Self::JsonPathEquals { path, expected } => {
                write!(f, "JsonPathEquals({path:?}, {expected})")
            }
            Self::HeaderExists(name) => write!(f, "HeaderExists({name:?})"),
            Self::HeaderEquals { name, expected } => write!(f, "HeaderEquals({name:?}, {expected:?})"),
            Self::Custom { message, .. } => write!(f, "Custom({message:?})"),
        }
    }
}

pub fn status_is(code: u16) -> ResponseAssertion {
    ResponseAssertion::StatusIs(code)
}

pub fn status_in(codes: impl Into<Vec<u16>>) -> ResponseAssertion {
    ResponseAssertion::StatusIn(codes.into())
}

pub fn response_time_under(max_ms: u64) -> ResponseAssertion {
    ResponseAssertion::ResponseTimeUnder(max_ms)
}

pub fn body_contains(text: impl Into<String>) -> ResponseAssertion {
    ResponseAssertion::BodyContains { text: text.into(), case_sensitive: true }
}

pub fn body_contains_any_case(text: impl Into<String>) -> ResponseAssertion {
    ResponseAssertion::BodyContains { text: text.into(), case_sensitive: false }
}

pub fn body_matches(pattern: &str) -> Result<ResponseAssertion, regex::Error> {
    Ok(ResponseAssertion::BodyMatches(regex::Regex::new(pattern)?))
}

pub fn json_path_exists(path: impl Into<String>) -> ResponseAssertion {
    ResponseAssertion::JsonPathExists(path.into())
}

pub fn json_path_equals(path: impl Into<String>, expected: impl Into<Value>) -> ResponseAssertion {
    ResponseAssertion::JsonPathEquals { path: path.into(), expected: expected.into() }
}

pub fn header_exists(name: impl Into<String>) -> ResponseAssertion {
    ResponseAssertion::HeaderExists(name.into())
}

pub fn header_equals(name: impl Into<String>, expected: impl Into<String>) -> ResponseAssertion {
    ResponseAssertion::HeaderEquals { name: name.into(), expected: expected.into() }
}

pub fn custom(
    check: impl Fn(&Response) -> bool + Send + Sync + 'static,
    message: impl Into<String>,
) -> ResponseAssertion {
    ResponseAssertion::Custom { check: Arc::new(check), message: message.into() }
}

/// Numeric JSON values compare by magnitude, so `7`, `7.0` and `7u64` are
/// all equal to each other.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => (x - y).abs() <= f64::EPSILON * x.abs().max(y.abs()).max(1.0),
        _ => a == b,
    }
}

impl ResponseAssertion {
    pub fn check(&self, response: &Response) -> bool {
        match self {
            Self::StatusIs(code) => response.status_code == *code,
            Self::StatusIn(codes) => codes.contains(&response.status_code),
            Self::ResponseTimeUnder(max_ms) => response.response_time_ms() <= *max_ms as f64,
            Self::BodyContains { text, case_sensitive } => {
                if *case_sensitive {
                    response.body.contains(text)
                } else {
                    response.body.to_lowercase().contains(&text.to_lowercase())
                }
            }
            Self::BodyMatches(re) => re.is_match(&response.body),
            Self::JsonPathExists(path) => serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|v| json_path(&v, path).cloned())
                .is_some(),
            Self::JsonPathEquals { path, expected } => serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|v| json_path(&v, path).cloned())
                .is_some_and(|actual| json_eq(&actual, expected)),
            Self::HeaderExists(name) => response.header(name).is_some(),
            Self::HeaderEquals { name, expected } => {
                response.header(name).is_some_and(|v| v == expected)
            }
            Self::Custom { check, .. } => check(response),
        }
    }

    pub fn failure_message(&self, response: &Response) -> String {
        match self {
            Self::StatusIs(code) => {
                format!("expected {code}, got {}", response.status_code)
            }
            Self::StatusIn(codes) => {
                format!("expected status in {codes:?}, got {}", response.status_code)
            }
            Self::ResponseTimeUnder(max_ms) => format!(
                "response time {:.2}ms exceeded limit {max_ms}ms",
                response.response_time_ms()
            ),
            Self::BodyContains { text, .. } => {
                format!("response body does not contain {text:?}")
            }
            Self::BodyMatches(re) => {
                format!("response body does not match pattern {:?}", re.as_str())
            }
            Self::JsonPathExists(path) => format!("JSON path {path:?} does not exist"),
            Self::JsonPathEquals { path, expected } => {
                format!("JSON path {path:?} expected {expected}")
            }
            Self::HeaderExists(name) => format!("header {name:?} does not exist"),
            Self::HeaderEquals { name, expected } => {
                format!("header {name:?} expected {expected:?}")
            }
            Self::Custom { message, .. } => {
                if message.is_empty() {
                    "custom assertion failed".into()
                } else {
                    message.clone()
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Logic {
    #[default]
    And,
    Or,
}

/// Outcome of checking a group: overall verdict plus every individual
/// failure message.
#[derive(Debug, Clone)]
pub struct GroupOutcome {
    pub passed: bool,
    pub logic: Logic,
    pub failures: Vec<String>,
}

impl GroupOutcome {
    pub fn report(&self) -> String {
        if self.passed {
            return String::new();
        }
        let header = format!(
            "assertion group ({}) failed:",
            match self.logic {
                Logic::And => "AND",
                Logic::Or => "OR",
            }
        );
        std::iter::once(header)
            .chain(self.failures.iter().enumerate().map(|(i, m)| format!("  {}. {m}", i + 1)))
            .join("\n")
    }
}

/// Combines predicates: AND succeeds iff all succeed, OR iff any does.
#[derive(Debug, Clone, Default)]
pub struct AssertionGroup {
    pub logic: Logic,
    assertions: Vec<ResponseAssertion>,
}

impl AssertionGroup {
    pub fn all() -> Self {
        Self { logic: Logic::And, assertions: Vec::new() }
    }

    pub fn any() -> Self {
        Self { logic: Logic::Or, assertions: Vec::new() }
    }

    pub fn add(mut self, assertion: ResponseAssertion) -> Self {
        self.assertions.push(assertion);
        self
    }

    pub fn check_all(&self, response: &Response) -> GroupOutcome {
        let mut failures = Vec::new();
        let mut passed_count = 0usize;
        for assertion in &self.assertions {
            if assertion.check(response) {
                passed_count += 1;
            } else {
                failures.push(assertion.failure_message(response));
            }
        }
        let passed = match self.logic {
            Logic::And => failures.is_empty(),
            Logic::Or => passed_count > 0 || self.assertions.is_empty(),
        };
        GroupOutcome { passed, logic: self.logic, failures }
    }
}

/// Run predicates in order, collecting failure messages. With `fail_fast`
/// the first failure stops evaluation.
pub fn run_assertions(
    response: &Response,
    assertions: &[ResponseAssertion],
    fail_fast: bool,
) -> (bool, Vec<String>) {
    let mut failures = Vec::new();
    for assertion in assertions {
        if !assertion.check(response) {
            failures.push(assertion.failure_message(response));
            if fail_fast {
                break;
            }
        }
    }
    (failures.is_empty(), failures)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Protocol;

    fn sample_response() -> Response {
        let mut resp = Response::new(Protocol::Http);
        resp.status_code = 201;
        resp.body = r#"{"user":{"id":7}}"#.into();
        resp.headers = "Content-Type: application/json".into();
        resp.response_time_us = 120_000;
        resp.success = true;
        resp
    }

    #[test]
    fn test_assertion_batch_passes() {
        let resp = sample_response();
        let assertions = vec![
            status_is(201),
            json_path_equals("user.id", 7),
            response_time_under(500),
        ];
        let (ok, failures) = run_assertions(&resp, &assertions, false);
        assert!(ok, "{failures:?}");
    }

    #[test]
    fn test_assertion_batch_reports_status_failure() {
        let mut resp = sample_response();
        resp.status_code = 500;
        let assertions = vec![
            status_is(201),
            json_path_equals("user.id", 7),
            response_time_under(500),
        ];
        let (ok, failures) = run_assertions(&resp, &assertions, false);
        assert!(!ok);
        assert_eq!(failures.len(), 1);
        assert!(failures[0].contains("expected 201, got 500"));
    }

    #[test]
    fn test_fail_fast_stops_early() {
        let mut resp = sample_response();
        resp.status_code = 500;
        resp.body = "not json".into();
        let assertions = vec![status_is(201), json_path_exists("user.id")];
        let (_, failures) = run_assertions(&resp, &assertions, true);
        assert_eq!(failures.len(), 1);
    }

    #[test]
    fn test_numeric_tolerant_json_equality() {
        let resp = sample_response();
        assert!(json_path_equals("user.id", 7.0).check(&resp));
        assert!(json_path_equals("user.id", 7u64).check(&resp));
        assert!(!json_path_equals("user.id", 8).check(&resp));
    }

    #[test]
    fn test_body_and_header_predicates() {
        let resp = sample_response();
        assert!(body_contains(r#""id":7"#).check(&resp));
        assert!(!body_contains(r#""ID":7"#).check(&resp));
        assert!(body_contains_any_case(r#""ID":7"#).check(&resp));
        assert!(body_matches(r#""id":\d+"#).unwrap().check(&resp));
        assert!(header_exists("content-type").check(&resp));
        assert!(header_equals("Content-Type", "application/json").check(&resp));
        assert!(!header_equals("Content-Type", "text/html").check(&resp));
        assert!(status_in([200, 201]).check(&resp));
    }

    #[test]
    fn test_group_and_or() {
        let resp = sample_response();
        let and = AssertionGroup::all().add(status_is(201)).add(status_is(500));
        let outcome = and.check_all(&resp);
        assert!(!outcome.passed);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.report().contains("assertion group (AND) failed"));

        let or = AssertionGroup::any().add(status_is(201)).add(status_is(500));
        assert!(or.check_all(&resp).passed);

        let or_none = AssertionGroup::any().add(status_is(404)).add(status_is(500));
        assert!(!or_none.check_all(&resp).passed);
    }

    #[test]
    fn test_custom_assertion() {
        let resp = sample_response();
        assert!(custom(|r| r.success, "must succeed").check(&resp));
        let failing = custom(|r| r.status_code == 418, "expected teapot");
        assert!(!failing.check(&resp));
        assert_eq!(failing.failure_message(&resp), "expected teapot");
    }
}
