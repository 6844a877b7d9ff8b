use std::{
    collections::HashMap,
    ffi::OsString,
    io::Write as _,
    path::PathBuf,
    pin::pin,
    process::Stdio,
    time::Duration,
};

use anyhow::{anyhow, Context as _};
#[allow(unused_imports)]
use log::{debug, info};
use thiserror::Error;
use tokio::{io::AsyncReadExt as _, process::Command, select, time::sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    output::Capture,
    process::{ChildExt as _, ExitStatusExt as _},
    test::{Status, TestName, TestResult},
    xunit,
};

// Something went wrong with the machinery for running a test, as opposed to
// the test itself failing.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("timed out after {}", humantime::format_duration(*.0))]
    Timeout(Duration),
    // `name` is a short description of the kind of problem, used to label it
    // in reports.
    #[error("{name}: {error:#}")]
    Internal { name: String, error: anyhow::Error },
}

impl RunError {
    pub fn internal(name: impl Into<String>, error: anyhow::Error) -> Self {
        Self::Internal {
            name: name.into(),
            error,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

// Runs individual tests by name. The scheduler doesn't know anything about
// what a test actually is.
pub trait TestRunner {
    fn knows(&self, test: &TestName) -> bool;

    // Run the test to completion, writing its output to `capture`. A test
    // that ran but failed is Ok with a non-Passed status.
    async fn run(&self, test: &TestName, capture: &mut Capture<'_>) -> Result<TestResult, RunError>;
}

// How to run one test as a subprocess.
#[derive(Debug, Clone)]
pub struct TestCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    // None means use the runner's default.
    pub timeout: Option<Duration>,
    // When the test times out it's SIGTERMed, then SIGKILLed if it's still
    // alive after this long.
    pub shutdown_grace_period: Duration,
    pub merge_conflict_exit_code: Option<i32>,
    pub tools_build_failure_exit_code: Option<i32>,
}

impl TestCommand {
    fn status_for_code(&self, code: i32) -> Status {
        match code {
            0 => Status::Passed,
            c if Some(c) == self.merge_conflict_exit_code => Status::MergeConflict,
            c if Some(c) == self.tools_build_failure_exit_code => Status::ToolsBuildFailure,
            _ => Status::Failed,
        }
    }
}

// Runs tests by spawning the command registered for them.
pub struct CommandRunner {
    commands: HashMap<TestName, TestCommand>,
    work_dir: PathBuf,
    reports_dir: PathBuf,
    default_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl CommandRunner {
    pub fn new(
        commands: impl IntoIterator<Item = (TestName, TestCommand)>,
        work_dir: PathBuf,
        reports_dir: PathBuf,
        default_timeout: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            commands: commands.into_iter().collect(),
            work_dir,
            reports_dir,
            default_timeout,
            cancellation_token,
        }
    }
}

impl TestRunner for CommandRunner {
    fn knows(&self, test: &TestName) -> bool {
        self.commands.contains_key(test)
    }

    async fn run(&self, test: &TestName, capture: &mut Capture<'_>) -> Result<TestResult, RunError> {
        let command = self.commands.get(test).ok_or_else(|| {
            RunError::internal("Unknown Test", anyhow!("no command registered for {test}"))
        })?;
        if self.cancellation_token.is_cancelled() {
            return Err(RunError::internal(
                "Cancelled",
                anyhow!("test run was interrupted before {test} started"),
            ));
        }
        debug!("{test}: running {:?} {:?}", command.program, command.args);
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.work_dir)
            .env("XUNIT_REPORT", xunit::report_path(&self.reports_dir, test))
            .env("CI_TEST_NAME", test.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so that the whole test can be terminated and
            // terminal interrupts are left to us.
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("couldn't run {:?}", command.program))
            .map_err(|e| RunError::internal("Spawn Failure", e))?;
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(RunError::internal(
                "Spawn Failure",
                anyhow!("child output wasn't piped"),
            ));
        };

        let timeout = command.timeout.unwrap_or(self.default_timeout);
        let mut deadline = pin!(sleep(timeout));
        let mut out_buf = [0u8; 8192];
        let mut err_buf = [0u8; 8192];
        let (mut out_open, mut err_open) = (true, true);
        let pipe_error = |e: std::io::Error| RunError::internal("Output Failure", e.into());
        let exit_status = loop {
            select! {
                n = stdout.read(&mut out_buf), if out_open => match n.map_err(pipe_error)? {
                    0 => out_open = false,
                    n => capture.stdout().write_all(&out_buf[..n]).map_err(pipe_error)?,
                },
                n = stderr.read(&mut err_buf), if err_open => match n.map_err(pipe_error)? {
                    0 => err_open = false,
                    n => capture.stderr().write_all(&err_buf[..n]).map_err(pipe_error)?,
                },
                status = child.wait(), if !out_open && !err_open => {
                    break status.context("couldn't wait for child").map_err(|e| RunError::internal("Wait Failure", e))?;
                },
                _ = &mut deadline => {
                    info!("{test}: timed out after {timeout:?}, terminating");
                    child
                        .terminate(command.shutdown_grace_period)
                        .await
                        .map_err(|e| RunError::internal("Termination Failure", e))?;
                    return Ok(TestResult::timed_out(timeout));
                },
                _ = self.cancellation_token.cancelled() => {
                    info!("{test}: cancelled, terminating");
                    child
                        .terminate(command.shutdown_grace_period)
                        .await
                        .map_err(|e| RunError::internal("Termination Failure", e))?;
                    return Err(RunError::internal("Cancelled", anyhow!("test run was interrupted")));
                },
            }
        };

        let code = exit_status
            .code_not_killed()
            .map_err(|e| RunError::internal("Killed", e))?;
        let status = command.status_for_code(code);
        debug!("{test}: exit code {code} -> {status}");
        let mut result = TestResult::new(status);
        // The detail for these is whatever the test printed last.
        let last_line = || {
            String::from_utf8_lossy(capture.output())
                .trim_end()
                .lines()
                .last()
                .map(str::to_owned)
        };
        match status {
            Status::MergeConflict => result.merge_conflict_cl = last_line(),
            Status::ToolsBuildFailure => result.tools_build_failure_msg = last_line(),
            _ => {}
        }
        Ok(result)
    }
}
