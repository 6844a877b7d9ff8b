use std::{
    env,
    io::{self, Write as _},
    path::PathBuf,
    process::ExitCode,
    time::Duration,
};

use anyhow::{bail, Context as _};
use clap::{Parser as _, Subcommand};
use colored::Colorize as _;
use config::{ConfigProvider as _, ParsedConfig};
use dag::TestGraph;
#[allow(unused_imports)]
use log::{debug, info};
use runner::CommandRunner;
use scheduler::{Scheduler, SchedulerOptions};
use test::{ResultSet, Status, TestName};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

mod config;
mod dag;
mod output;
mod process;
mod report;
mod runner;
mod scheduler;
mod xunit;

#[cfg(test)]
mod test_utils;

// Exit code when everything worked but some tests didn't pass.
const FAILED_EXIT_CODE: u8 = 3;

#[derive(clap::Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to TOML config file. Default is $CI_TEST_CONFIG if non-empty,
    /// or ./ci-test.toml if it exists, or ./.ci-test.toml if it exists
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Directory to write the aggregate "output" and "results" files to. If
    /// unset they aren't written.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Directory where tests write their xUnit reports. Default is $WORKSPACE
    /// if set, otherwise the current directory.
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    /// Directory to run tests in.
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
    /// Timeout for tests that don't set their own, overrides the config file.
    #[arg(long)]
    default_timeout_s: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Tests to run, per the "name" field in the config file. Dependencies
    /// among them are respected, dependencies on tests not listed are ignored.
    #[arg(required = true)]
    tests: Vec<String>,
    /// Run the tests in the order given, ignoring dependencies entirely.
    #[arg(long, default_value_t = false)]
    no_deps: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the named tests.
    Run(RunArgs),
    /// Run all the tests of the named projects.
    Project {
        #[arg(required = true)]
        projects: Vec<String>,
    },
    /// Run all the tests of the named groups.
    Group {
        #[arg(required = true)]
        groups: Vec<String>,
    },
    /// List the tests defined in the config file.
    List,
}

// Returns the path we should look for the config. Although this is
// influenced by the existence of files, it doesn't guarantee that the returned
// file exists.
fn find_config(config_arg: &Option<PathBuf>) -> anyhow::Result<PathBuf> {
    if let Some(path) = config_arg {
        return Ok(path.clone());
    }
    if let Some(path) = env::var_os("CI_TEST_CONFIG").filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    for candidate in ["./ci-test.toml", "./.ci-test.toml"] {
        let path = PathBuf::from(candidate);
        if path.exists() {
            return Ok(path);
        }
    }
    bail!("Neither --config nor $CI_TEST_CONFIG were set. No ./ci-test.toml or ./.ci-test.toml found");
}

fn default_reports_dir() -> PathBuf {
    env::var_os("WORKSPACE")
        .filter(|w| !w.is_empty())
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
}

fn print_summary(results: &ResultSet) -> anyhow::Result<()> {
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "Summary:")?;
    for (test, result) in results.iter() {
        let status = result.status.to_string();
        let status = match result.status {
            Status::Passed => status.green(),
            Status::Skipped | Status::Pending => status.yellow(),
            _ => status.red(),
        };
        write!(stdout, "  {test}: {status}")?;
        if let Some(timeout) = result.timeout_value {
            write!(stdout, " (after {})", humantime::format_duration(timeout))?;
        }
        if let Some(msg) = &result.tools_build_failure_msg {
            write!(stdout, " ({msg})")?;
        }
        writeln!(stdout)?;
    }
    Ok(())
}

async fn run(
    config: &ParsedConfig,
    args: &Args,
    tests: Vec<TestName>,
    ordered: bool,
    cancellation_token: CancellationToken,
) -> anyhow::Result<ExitCode> {
    if tests.is_empty() {
        eprintln!("No tests to run");
        return Ok(ExitCode::SUCCESS);
    }
    let default_timeout = args
        .default_timeout_s
        .map_or(config.default_timeout, Duration::from_secs);
    let reports_dir = args.reports_dir.clone().unwrap_or_else(default_reports_dir);
    let runner = CommandRunner::new(
        config.commands.clone(),
        args.work_dir.clone(),
        reports_dir.clone(),
        default_timeout,
        cancellation_token,
    );
    let options = SchedulerOptions {
        output_dir: args.output_dir.clone(),
        reports_dir,
        default_timeout,
        report_exempt: config.report_exempt.clone(),
    };
    let mut scheduler = Scheduler::new(options, io::stdout(), io::stderr());

    let results = if ordered {
        scheduler.run_tests(&tests, &runner).await?
    } else {
        let graph = TestGraph::new(tests, |t| config.dependencies_of(t))?;
        debug!("dependency graph: {graph}");
        scheduler.run_graph(&graph, &runner).await?
    };

    print_summary(&results)?;
    Ok(if results.all_passed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(FAILED_EXIT_CODE)
    })
}

fn load_config(args: &Args) -> anyhow::Result<ParsedConfig> {
    let path = find_config(&args.config)?;
    debug!("loading config from {}", path.display());
    ParsedConfig::load(&path)
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    env_logger::init();

    // Set up shutdown first, to ensure we correctly handle early signals.
    // Cancelling terminates the running test and fails the ones that haven't
    // started yet.
    let cancellation_token = CancellationToken::new();
    let mut sigint = signal(SignalKind::interrupt()).context("registering SIGINT handler")?;
    let token = cancellation_token.clone();
    tokio::spawn(async move {
        sigint.recv().await;
        info!("Got interrupt, terminating running test");
        token.cancel()
    });

    let args = Args::parse();
    debug!("args: {:?}", &args);
    let config = load_config(&args)?;

    let (tests, ordered) = match &args.command {
        Command::List => {
            for test in config.list_tests() {
                println!("{test}");
            }
            return Ok(ExitCode::SUCCESS);
        }
        Command::Run(run_args) => (
            run_args.tests.iter().map(|t| TestName::from(t.as_str())).collect(),
            run_args.no_deps,
        ),
        Command::Project { projects } => (config.tests_for_projects(projects), false),
        Command::Group { groups } => (config.tests_for_groups(groups), false),
    };
    run(&config, &args, tests, ordered, cancellation_token).await
}
