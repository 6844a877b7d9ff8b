// xUnit reports. Every test is expected to leave one of these behind at
// report_path(), CI dashboards display them. When a test doesn't produce a
// usable one we write a substitute, so the dashboards always have something to
// show.

use std::{
    fs::{self, File},
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context as _;
use indoc::indoc;
#[allow(unused_imports)]
use log::{debug, warn};
use quick_junit::{NonSuccessKind, Report, TestCase, TestCaseStatus, TestSuite};
use serde::Deserialize;

use crate::{
    output::tail_lines,
    test::{Status, TestName},
};

// Number of lines of console output to embed in the report for a test that
// failed with an internal error.
const NUM_LINES_TO_OUTPUT: usize = 50;

// Written when a test produced no report at all.
pub const DUMMY_REPORT: &str = indoc! {r#"
    <?xml version="1.0" encoding="utf-8"?>
    <!--
      This file will be used to generate a dummy test results file
      in case the presubmit tests produce no test result files.
    -->
    <testsuites>
      <testsuite name="NO_TESTS" tests="1" errors="0" failures="0" skip="0">
        <testcase classname="NO_TESTS" name="NO_TESTS" time="0">
        </testcase>
      </testsuite>
    </testsuites>
"#};

pub const DUMMY_REPORT_FILENAME: &str = "tests_dummy.xml";

pub fn report_path(dir: &Path, test: &TestName) -> PathBuf {
    dir.join(format!("tests_{}.xml", test.as_str().replace('-', "_")))
}

// The parts of a report that we look at.
#[derive(Deserialize, Debug, Default)]
pub struct ReportSummary {
    #[serde(rename = "testsuite", default)]
    pub suites: Vec<SuiteSummary>,
}

#[derive(Deserialize, Debug)]
pub struct SuiteSummary {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@failures", default)]
    pub failures: usize,
    #[serde(rename = "@errors", default)]
    pub errors: usize,
    #[serde(rename = "testcase", default)]
    pub cases: Vec<CaseSummary>,
}

#[derive(Deserialize, Debug)]
pub struct CaseSummary {
    #[serde(rename = "@name", default)]
    pub name: String,
    #[serde(rename = "@classname", default)]
    pub classname: String,
}

impl ReportSummary {
    pub fn parse(xml: &[u8]) -> anyhow::Result<Self> {
        let xml = std::str::from_utf8(xml).context("report isn't UTF-8")?;
        quick_xml::de::from_str(xml).context("couldn't parse xUnit XML")
    }

    pub fn num_cases(&self) -> usize {
        self.suites.iter().map(|s| s.cases.len()).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.suites.iter().any(|s| s.failures > 0 || s.errors > 0)
    }

    // Renders as suite/class.case, for logging.
    pub fn case_names(&self) -> Vec<String> {
        self.suites
            .iter()
            .flat_map(|s| {
                s.cases
                    .iter()
                    .map(move |c| format!("{}/{}.{}", s.name, c.classname, c.name))
            })
            .collect()
    }
}

// Write a report for `test` containing a single failed test case.
pub fn create_failure_report(
    dir: &Path,
    test: &TestName,
    class_name: &str,
    case_name: &str,
    message: &str,
    output: &str,
) -> anyhow::Result<()> {
    let mut status = TestCaseStatus::non_success(NonSuccessKind::Failure);
    status.set_message(message).set_description(output);
    let mut case = TestCase::new(case_name, status);
    case.set_classname(class_name);
    let mut suite = TestSuite::new(class_name);
    suite.add_test_case(case);
    let mut report = Report::new(test.as_str());
    report.add_test_suite(suite);

    fs::create_dir_all(dir)
        .with_context(|| format!("creating report dir {}", dir.display()))?;
    let path = report_path(dir, test);
    let f = File::create(&path).with_context(|| format!("creating {}", path.display()))?;
    report
        .serialize(f)
        .with_context(|| format!("writing xUnit report {}", path.display()))
}

pub fn write_timeout_report(dir: &Path, test: &TestName, timeout: Duration) -> anyhow::Result<()> {
    let msg = format!(
        "The test timed out after {}.",
        humantime::format_duration(timeout)
    );
    create_failure_report(dir, test, test.as_str(), "Timeout", &msg, &msg)
}

// Check that `test` left a report that parses and has at least one test case.
// If it didn't, write a substitute. Only fails for I/O errors, a broken report
// isn't an error.
pub fn check_report(dir: &Path, test: &TestName) -> anyhow::Result<()> {
    let path = report_path(dir, test);
    let content = match fs::read(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{test}: no report at {}, writing dummy", path.display());
            fs::create_dir_all(dir)
                .with_context(|| format!("creating report dir {}", dir.display()))?;
            let dummy = dir.join(DUMMY_REPORT_FILENAME);
            return fs::write(&dummy, DUMMY_REPORT)
                .with_context(|| format!("writing {}", dummy.display()));
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let (case_name, detail) = match ReportSummary::parse(&content) {
        Err(e) => ("Invalid xUnit Report", format!("{e:#}")),
        Ok(summary) if summary.num_cases() == 0 => ("No Test Cases", String::new()),
        Ok(summary) => {
            debug!("{test}: report has {}", summary.case_names().join(", "));
            return Ok(());
        }
    };
    warn!("{test}: replacing report {}: {case_name}", path.display());
    fs::remove_file(&path).with_context(|| format!("removing {}", path.display()))?;
    create_failure_report(dir, test, test.as_str(), case_name, case_name, &detail)
}

// Describes an error that stopped a test from running normally.
pub struct ErrorDescription<'a> {
    // Short name of the kind of error, becomes the test case name.
    pub kind: &'a str,
    pub message: &'a str,
    pub timed_out: bool,
}

// Record an internal error in the report for `test` and decide the status it
// should get. A report that already shows failures is left alone since it's
// likely more informative than ours, in that case the test is just Failed.
pub fn report_for_error(
    dir: &Path,
    test: &TestName,
    error: &ErrorDescription,
    output: &str,
) -> anyhow::Result<Status> {
    let path = report_path(dir, test);
    let replace = match fs::read(&path) {
        Err(e) if e.kind() == ErrorKind::NotFound => true,
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        Ok(content) => ReportSummary::parse(&content).map_or(true, |s| !s.has_failures()),
    };
    if !replace {
        return Ok(Status::Failed);
    }

    let msg = format!(
        "Error message:\n{}:\n{}\n\n\nConsole output:\n{}\n",
        error.kind,
        error.message,
        tail_lines(output, NUM_LINES_TO_OUTPUT)
    );
    create_failure_report(dir, test, test.as_str(), error.kind, error.kind, &msg)?;
    Ok(if error.timed_out {
        Status::TimedOut
    } else {
        Status::Failed
    })
}
