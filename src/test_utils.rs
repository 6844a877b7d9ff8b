use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    fs,
    io::Write as _,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::anyhow;

use crate::{
    output::Capture,
    runner::{RunError, TestRunner},
    test::{Status, TestName, TestResult},
    xunit::{report_path, DUMMY_REPORT},
};

// What a StubRunner does when asked to run a test.
#[derive(Debug, Clone)]
pub enum Outcome {
    Status(Status),
    Result(TestResult),
    // Fail with an internal error of this name.
    Internal(&'static str),
    Timeout(Duration),
}

// Fake runner that records the order it was called in. Each run prints
// "running <test>" to the test's stdout.
pub struct StubRunner {
    outcomes: HashMap<TestName, Outcome>,
    // Tests that leave a valid xUnit report in reports_dir.
    reports: HashSet<TestName>,
    reports_dir: Option<PathBuf>,
    calls: RefCell<Vec<TestName>>,
}

impl StubRunner {
    pub fn new(outcomes: impl IntoIterator<Item = (&'static str, Outcome)>) -> Self {
        Self {
            outcomes: outcomes
                .into_iter()
                .map(|(name, outcome)| (name.into(), outcome))
                .collect(),
            reports: HashSet::new(),
            reports_dir: None,
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn passing(tests: &[&'static str]) -> Self {
        Self::new(tests.iter().map(|&t| (t, Outcome::Status(Status::Passed))))
    }

    pub fn writing_reports(mut self, dir: &Path, tests: &[&str]) -> Self {
        self.reports_dir = Some(dir.to_owned());
        self.reports = tests.iter().map(|&t| t.into()).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|t| t.to_string()).collect()
    }
}

impl TestRunner for StubRunner {
    fn knows(&self, test: &TestName) -> bool {
        self.outcomes.contains_key(test)
    }

    async fn run(&self, test: &TestName, capture: &mut Capture<'_>) -> Result<TestResult, RunError> {
        self.calls.borrow_mut().push(test.clone());
        writeln!(capture.stdout(), "running {test}").unwrap();
        if let (Some(dir), true) = (&self.reports_dir, self.reports.contains(test)) {
            fs::write(report_path(dir, test), DUMMY_REPORT).unwrap();
        }
        match self.outcomes.get(test).cloned() {
            Some(Outcome::Status(status)) => Ok(TestResult::new(status)),
            Some(Outcome::Result(result)) => Ok(result),
            Some(Outcome::Internal(name)) => Err(RunError::internal(name, anyhow!("stub failure"))),
            Some(Outcome::Timeout(d)) => Err(RunError::Timeout(d)),
            None => panic!("StubRunner asked to run unknown test {test}"),
        }
    }
}
