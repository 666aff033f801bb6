//! Scenarios: ordered request steps with validators and correlation rules.
//!
//! To the engine a scenario is nothing more than a list of steps; within one
//! virtual user the steps run in declared order and the session store
//! reflects step *i*'s effects before step *i + 1* begins. `${var}` markers
//! in a step's URL, headers and body are substituted from the user's session
//! right before execution, so values extracted in an earlier step feed later
//! ones.

use crate::assertion::ResponseAssertion;
use crate::request::Request;
use crate::response::Response;
use crate::session::ExtractRule;

#[derive(Debug, Clone, Default)]
pub struct Scenario {
    pub name: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone)]
pub struct Step {
    pub request: Request,
    pub assertions: Vec<ResponseAssertion>,
    pub extract_rules: Vec<ExtractRule>,
}

impl Step {
    pub fn new(request: Request) -> Self {
        Self { request, assertions: Vec::new(), extract_rules: Vec::new() }
    }
}

impl Scenario {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), steps: Vec::new() }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn request(self, request: Request) -> Self {
        self.step(Step::new(request))
    }

    pub fn get(self, url: impl Into<String>) -> Self {
        self.request(Request::get(url))
    }

    pub fn post(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.request(Request::post(url, body))
    }

    pub fn put(self, url: impl Into<String>, body: impl Into<String>) -> Self {
        self.request(Request::put(url, body))
    }

    pub fn delete(self, url: impl Into<String>) -> Self {
        self.request(Request::delete(url))
    }

    /// Attach a validator to the most recently added step.
    pub fn assert(mut self, assertion: ResponseAssertion) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.assertions.push(assertion);
        }
        self
    }

    /// Attach an extraction rule to the most recently added step.
    pub fn extract(mut self, rule: ExtractRule) -> Self {
        if let Some(step) = self.steps.last_mut() {
            step.extract_rules.push(rule);
        }
        self
    }
}

/// One executed step: the response plus its validator verdicts.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub response: Response,
    pub passed: bool,
    pub failures: Vec<String>,
}

/// Outcome of a closed-loop scenario run for one virtual user.
#[derive(Debug, Clone, Default)]
pub struct ScenarioReport {
    pub name: String,
    pub steps: Vec<StepReport>,
}

impl ScenarioReport {
    /// True when every step's validators passed.
    pub fn passed(&self) -> bool {
        self.steps.iter().all(|s| s.passed)
    }

    pub fn failure_count(&self) -> usize {
        self.steps.iter().map(|s| s.failures.len()).sum()
    }

    pub fn failures(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().flat_map(|s| s.failures.iter().map(String::as_str))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assertion::status_is;
    use crate::session::ExtractRule;

    #[test]
    fn test_builder_attaches_to_last_step() {
        let scenario = Scenario::new("login")
            .post("http://app.test/login", "{}")
            .assert(status_is(200))
            .extract(ExtractRule::json_path("access_token", "tok"))
            .get("http://app.test/profile")
            .assert(status_is(200));

        assert_eq!(scenario.steps.len(), 2);
        assert_eq!(scenario.steps[0].assertions.len(), 1);
        assert_eq!(scenario.steps[0].extract_rules.len(), 1);
        assert_eq!(scenario.steps[1].assertions.len(), 1);
        assert!(scenario.steps[1].extract_rules.is_empty());
        assert_eq!(scenario.steps[0].request.method, "POST");
    }
}
