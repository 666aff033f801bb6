//! Response-level and aggregate-level predicates.
//!
//! Predicates never abort a run: they evaluate to pass/fail and carry a
//! failure message for the report. Groups combine predicates with AND/OR
//! logic and render an aggregated failure report.

mod metrics;
mod response;

pub use metrics::{
    avg_response_time_under, custom_metrics, error_rate_below, max_response_time_under,
    run_metrics_assertions, success_rate_at_least, throughput_at_least, total_requests_at_least,
    MetricsAssertion, MetricsAssertionGroup,
};
pub use response::{
    body_contains, body_contains_any_case, body_matches, custom, header_equals, header_exists,
    json_path_equals, json_path_exists, response_time_under, run_assertions, status_in, status_is,
    AssertionGroup, GroupOutcome, Logic, ResponseAssertion,
};
