use std::{
    collections::HashSet,
    io::{self, Write},
    path::PathBuf,
    time::Duration,
};

#[allow(unused_imports)]
use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    dag::TestGraph,
    output::Capture,
    report::ReportWriter,
    runner::{RunError, TestRunner},
    test::{ResultSet, Status, TestName, TestResult},
    xunit::{self, ErrorDescription},
};

// Timeout assumed for a test that reports it timed out without saying after
// how long.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("test {0} does not exist")]
    UnknownTest(TestName),
    // No pending test could be run or skipped. This can't happen for an
    // acyclic graph so it means the scheduling logic is broken.
    #[error("erroneous test running logic, stuck with pending tests: {pending}")]
    Stalled { pending: String },
    #[error("writing test artifacts")]
    Artifacts(#[source] anyhow::Error),
    #[error("writing to console")]
    Console(#[source] io::Error),
}

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    // Where to write the aggregate `output` and `results` files. None means
    // don't write them.
    pub output_dir: Option<PathBuf>,
    // Where tests leave their xUnit reports.
    pub reports_dir: PathBuf,
    pub default_timeout: Duration,
    // Tests whose reports aren't checked, and that are recorded as Passed
    // even when the runner fails. Meant for tests that aggregate the results
    // of other CI runs.
    pub report_exempt: HashSet<TestName>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            output_dir: None,
            reports_dir: PathBuf::from("."),
            default_timeout: DEFAULT_TIMEOUT,
            report_exempt: HashSet::new(),
        }
    }
}

enum Readiness<'a> {
    Ready,
    // Some dependency hasn't finished yet.
    Blocked,
    // This dependency finished without passing.
    Skip(&'a TestName),
}

// Runs tests one at a time, writing their output live to `stdout`/`stderr`.
pub struct Scheduler<O, E> {
    options: SchedulerOptions,
    stdout: O,
    stderr: E,
}

impl<O: Write, E: Write> Scheduler<O, E> {
    pub fn new(options: SchedulerOptions, stdout: O, stderr: E) -> Self {
        Self {
            options,
            stdout,
            stderr,
        }
    }

    // Run every test in the graph, never starting a test before all its
    // dependencies have passed. Tests depending on anything that didn't pass
    // are skipped without being run.
    pub async fn run_graph<R: TestRunner>(
        &mut self,
        graph: &TestGraph,
        runner: &R,
    ) -> Result<ResultSet, SchedulerError> {
        check_known(graph.tests(), runner)?;
        let mut results = ResultSet::pending(graph.tests());
        let mut report = ReportWriter::create(self.options.output_dir.as_deref())
            .map_err(SchedulerError::Artifacts)?;

        // Every iteration takes exactly one test out of Pending, so N
        // iterations are enough.
        'iteration: for _ in 0..graph.len() {
            for test in graph.tests() {
                if results.status(test.as_str()) != Status::Pending {
                    continue;
                }
                match readiness(graph, &results, test) {
                    Readiness::Blocked => continue,
                    Readiness::Skip(dep) => {
                        info!(
                            "{test}: skipping, dependency {dep} is {}",
                            results.status(dep.as_str())
                        );
                        results.set(test, TestResult::new(Status::Skipped));
                    }
                    Readiness::Ready => {
                        let result = self.run_one(test, runner, &mut report).await?;
                        if result.status != Status::Passed {
                            let dependents: Vec<&str> = graph
                                .dependents_of(test.as_str())
                                .into_iter()
                                .map(|t| t.as_str())
                                .collect();
                            if !dependents.is_empty() {
                                info!(
                                    "{test}: {}, will skip {}",
                                    result.status,
                                    dependents.join(", ")
                                );
                            }
                        }
                        results.set(test, result);
                    }
                }
                continue 'iteration;
            }
            let pending: Vec<&str> = results
                .iter()
                .filter(|(_, r)| r.status == Status::Pending)
                .map(|(t, _)| t.as_str())
                .collect();
            return Err(SchedulerError::Stalled {
                pending: pending.join(", "),
            });
        }

        report.finish(&results).map_err(SchedulerError::Artifacts)?;
        Ok(results)
    }

    // Run the given tests in the given order, ignoring dependencies.
    pub async fn run_tests<R: TestRunner>(
        &mut self,
        tests: &[TestName],
        runner: &R,
    ) -> Result<ResultSet, SchedulerError> {
        check_known(tests, runner)?;
        let mut results = ResultSet::pending(tests);
        let mut report = ReportWriter::create(self.options.output_dir.as_deref())
            .map_err(SchedulerError::Artifacts)?;
        for test in tests {
            let result = self.run_one(test, runner, &mut report).await?;
            results.set(test, result);
        }
        report.finish(&results).map_err(SchedulerError::Artifacts)?;
        Ok(results)
    }

    // Run a single test and sort out its xUnit report. Problems with the
    // test's machinery or its report are recorded in the report and the
    // result, only failing to write our own artifacts is an error.
    async fn run_one<R: TestRunner>(
        &mut self,
        test: &TestName,
        runner: &R,
        report: &mut ReportWriter,
    ) -> Result<TestResult, SchedulerError> {
        let Self {
            options,
            stdout,
            stderr,
        } = self;
        writeln!(stdout, "##### Running test {:?} #####", test.as_str())
            .map_err(SchedulerError::Console)?;
        let exempt = options.report_exempt.contains(test);

        let mut capture = Capture::new(&mut *stdout, &mut *stderr);
        let mut outcome = runner.run(test, &mut capture).await;
        if let Ok(result) = &outcome {
            if result.status == Status::TimedOut {
                let timeout = result.timeout_value.unwrap_or(options.default_timeout);
                if let Err(e) = xunit::write_timeout_report(&options.reports_dir, test, timeout)
                {
                    writeln!(capture.stderr(), "{e:#}").map_err(SchedulerError::Console)?;
                }
            }
        }
        if outcome.is_ok() && !exempt {
            if let Err(e) = xunit::check_report(&options.reports_dir, test) {
                outcome = Err(RunError::internal("Internal Error", e));
            }
        }

        let result = match outcome {
            Ok(result) => result,
            Err(err) => {
                writeln!(capture.stderr(), "{err}").map_err(SchedulerError::Console)?;
                if exempt {
                    TestResult::new(Status::Passed)
                } else {
                    classify_error(options, test, &err, capture.output())?
                }
            }
        };

        report
            .append_output(capture.output())
            .map_err(SchedulerError::Artifacts)?;
        drop(capture);
        writeln!(stdout, "##### {} #####", result.status).map_err(SchedulerError::Console)?;
        Ok(result)
    }
}

fn check_known<R: TestRunner>(tests: &[TestName], runner: &R) -> Result<(), SchedulerError> {
    match tests.iter().find(|t| !runner.knows(t)) {
        Some(test) => Err(SchedulerError::UnknownTest(test.clone())),
        None => Ok(()),
    }
}

// A failed dependency means a skip even if some other dependency is still
// pending.
fn readiness<'a>(graph: &'a TestGraph, results: &ResultSet, test: &TestName) -> Readiness<'a> {
    let mut ready = true;
    for dep in graph.dependencies(test.as_str()).into_iter().flatten() {
        match results.status(dep.as_str()) {
            s if s.skips_dependents() => return Readiness::Skip(dep),
            Status::Pending => ready = false,
            _ => {}
        }
    }
    if ready {
        Readiness::Ready
    } else {
        Readiness::Blocked
    }
}

fn classify_error(
    options: &SchedulerOptions,
    test: &TestName,
    err: &RunError,
    output: &[u8],
) -> Result<TestResult, SchedulerError> {
    let (kind, message) = match err {
        RunError::Internal { name, error } => (name.as_str(), format!("{error:#}")),
        RunError::Timeout(_) => ("Internal Error", err.to_string()),
    };
    let desc = ErrorDescription {
        kind,
        message: &message,
        timed_out: err.is_timeout(),
    };
    let output = String::from_utf8_lossy(output);
    let status = xunit::report_for_error(&options.reports_dir, test, &desc, &output)
        .map_err(SchedulerError::Artifacts)?;
    let mut result = TestResult::new(status);
    if let (Status::TimedOut, RunError::Timeout(d)) = (status, err) {
        result.timeout_value = Some(*d);
    }
    Ok(result)
}
