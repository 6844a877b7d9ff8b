use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    ffi::OsString,
    fs,
    path::Path,
    time::Duration,
};

use anyhow::{bail, Context as _};
#[allow(unused_imports)]
use log::debug;
use serde::Deserialize;

use crate::{
    runner::TestCommand,
    scheduler::DEFAULT_TIMEOUT,
    test::TestName,
};

// Where tests, groups and projects come from. Groups are named lists of
// tests, projects are named lists of tests and groups.
pub trait ConfigProvider {
    fn dependencies_of(&self, test: &TestName) -> Vec<TestName>;
    fn tests_for_group(&self, group: &str) -> Vec<TestName>;
    fn tests_for_project(&self, project: &str) -> Vec<TestName>;

    fn tests_for_groups(&self, groups: &[String]) -> Vec<TestName> {
        union(groups.iter().map(|g| self.tests_for_group(g)))
    }

    fn tests_for_projects(&self, projects: &[String]) -> Vec<TestName> {
        union(projects.iter().map(|p| self.tests_for_project(p)))
    }
}

fn union(lists: impl Iterator<Item = Vec<TestName>>) -> Vec<TestName> {
    lists
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum Command {
    Shell(String),
    Raw(Vec<String>),
}

impl Command {
    fn program_and_args(&self) -> anyhow::Result<(OsString, Vec<OsString>)> {
        match self {
            Self::Shell(cmd) => Ok(("bash".into(), vec!["-c".into(), cmd.into()])),
            Self::Raw(args) => {
                let Some((program, args)) = args.split_first() else {
                    bail!("empty command");
                };
                Ok((program.into(), args.iter().map(|a| a.into()).collect()))
            }
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Test {
    name: TestName,
    command: Command,
    #[serde(default)]
    depends_on: Vec<TestName>,
    timeout_s: Option<u64>,
    // Set to false for tests that don't produce an xUnit report of their own,
    // like ones that just collect the results of other runs.
    #[serde(default = "default_check_report")]
    check_report: bool,
    #[serde(default = "default_shutdown_grace_period")]
    /// When a test times out it's SIGTERMed. If it doesn't respond (by dying)
    /// after this duration it will then be SIGKILLed.
    shutdown_grace_period_s: u64,
    merge_conflict_exit_code: Option<i32>,
    tools_build_failure_exit_code: Option<i32>,
}

fn default_check_report() -> bool {
    true
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Test {
    fn parse(&self) -> anyhow::Result<TestCommand> {
        let (program, args) = self.command.program_and_args()?;
        let exit_codes = [self.merge_conflict_exit_code, self.tools_build_failure_exit_code];
        if exit_codes.contains(&Some(0)) {
            bail!("exit code 0 always means the test passed");
        }
        if exit_codes[0].is_some() && exit_codes[0] == exit_codes[1] {
            bail!("merge conflict and tools build failure exit codes must differ");
        }
        Ok(TestCommand {
            program,
            args,
            timeout: self.timeout_s.map(Duration::from_secs),
            shutdown_grace_period: Duration::from_secs(self.shutdown_grace_period_s),
            merge_conflict_exit_code: self.merge_conflict_exit_code,
            tools_build_failure_exit_code: self.tools_build_failure_exit_code,
        })
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    default_timeout_s: Option<u64>,
    #[serde(default)]
    tests: Vec<Test>,
    #[serde(default)]
    groups: BTreeMap<String, Vec<TestName>>,
    // Entries name either a test or a group.
    #[serde(default)]
    projects: BTreeMap<String, Vec<String>>,
}

// Validated config, ready to hand to the scheduler and runner.
#[derive(Debug)]
pub struct ParsedConfig {
    pub default_timeout: Duration,
    pub commands: HashMap<TestName, TestCommand>,
    pub report_exempt: HashSet<TestName>,
    dependencies: HashMap<TestName, Vec<TestName>>,
    groups: BTreeMap<String, Vec<TestName>>,
    projects: BTreeMap<String, Vec<String>>,
}

impl ParsedConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("couldn't read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("bad config {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content).context("couldn't parse config")?;
        Self::try_from(config)
    }

    // Every test the config knows about, sorted.
    pub fn list_tests(&self) -> Vec<TestName> {
        let mut tests: Vec<TestName> = self.commands.keys().cloned().collect();
        tests.sort();
        tests
    }
}

impl TryFrom<Config> for ParsedConfig {
    type Error = anyhow::Error;

    fn try_from(config: Config) -> anyhow::Result<Self> {
        let mut commands = HashMap::new();
        let mut dependencies = HashMap::new();
        let mut report_exempt = HashSet::new();
        for test in &config.tests {
            let command = test
                .parse()
                .with_context(|| format!("invalid test {:?}", test.name.as_str()))?;
            if commands.insert(test.name.clone(), command).is_some() {
                bail!("duplicate test {:?}", test.name.as_str());
            }
            dependencies.insert(test.name.clone(), test.depends_on.clone());
            if !test.check_report {
                report_exempt.insert(test.name.clone());
            }
        }

        // Dependencies can be left out of a run, but they have to exist.
        for test in &config.tests {
            for dep in &test.depends_on {
                if !commands.contains_key(dep) {
                    bail!(
                        "undefined test {:?} in dependencies of {:?}",
                        dep.as_str(),
                        test.name.as_str()
                    );
                }
            }
        }
        for (group, tests) in &config.groups {
            if let Some(test) = tests.iter().find(|t| !commands.contains_key(*t)) {
                bail!("undefined test {:?} in group {group:?}", test.as_str());
            }
        }
        for (project, entries) in &config.projects {
            for entry in entries {
                if !commands.contains_key(entry.as_str()) && !config.groups.contains_key(entry) {
                    bail!("undefined test or group {entry:?} in project {project:?}");
                }
            }
        }

        Ok(Self {
            default_timeout: config
                .default_timeout_s
                .map_or(DEFAULT_TIMEOUT, Duration::from_secs),
            commands,
            report_exempt,
            dependencies,
            groups: config.groups,
            projects: config.projects,
        })
    }
}

impl ConfigProvider for ParsedConfig {
    fn dependencies_of(&self, test: &TestName) -> Vec<TestName> {
        self.dependencies.get(test).cloned().unwrap_or_default()
    }

    fn tests_for_group(&self, group: &str) -> Vec<TestName> {
        self.groups.get(group).cloned().unwrap_or_default()
    }

    // Groups in the project are expanded. A name that's both a test and a
    // group means the test.
    fn tests_for_project(&self, project: &str) -> Vec<TestName> {
        let Some(entries) = self.projects.get(project) else {
            debug!("no tests for project {project:?}");
            return Vec::new();
        };
        union(entries.iter().map(|entry| {
            if self.commands.contains_key(entry.as_str()) {
                vec![TestName::from(entry.as_str())]
            } else {
                self.tests_for_group(entry)
            }
        }))
    }
}
