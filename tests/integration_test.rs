use std::{fs, path::Path, process::Output};

use indoc::indoc;
use tempfile::TempDir;
use test_bin::get_test_bin;

// Runs the binary in `dir` with `config` as ./ci-test.toml.
fn run_ci_test(dir: &Path, config: &str, args: &[&str]) -> Output {
    fs::write(dir.join("ci-test.toml"), config).unwrap();
    get_test_bin("ci-test")
        .args(args)
        .current_dir(dir)
        .env_remove("CI_TEST_CONFIG")
        .env_remove("WORKSPACE")
        .env("NO_COLOR", "1")
        .output()
        .expect("couldn't run ci-test binary")
}

fn results(dir: &Path) -> serde_json::Value {
    serde_json::from_slice(&fs::read(dir.join("out").join("results")).unwrap()).unwrap()
}

const CONFIG: &str = indoc! {r#"
    [[tests]]
    name = "build"
    command = "echo building; exit 1"

    [[tests]]
    name = "unit"
    command = "echo unit"
    depends_on = ["build"]

    [[tests]]
    name = "lint"
    command = "echo linting"

    [groups]
    all = ["build", "unit", "lint"]
"#};

#[test_log::test]
fn test_failure_skips_dependents() {
    let dir = TempDir::new().unwrap();
    let output = run_ci_test(
        dir.path(),
        CONFIG,
        &["--output-dir", "out", "--reports-dir", "reports", "group", "all"],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(output.status.code(), Some(3), "{stdout}");

    let results = results(dir.path());
    assert_eq!(results["build"]["Status"], 3);
    assert_eq!(results["unit"]["Status"], 1);
    assert_eq!(results["lint"]["Status"], 2);

    assert!(stdout.contains("##### Running test \"build\" #####"), "{stdout}");
    assert!(!stdout.contains("##### Running test \"unit\" #####"), "{stdout}");
    let output_log = fs::read_to_string(dir.path().join("out").join("output")).unwrap();
    assert_eq!(output_log, "building\nlinting\n");
    // Neither test wrote a report, so a placeholder is left behind.
    assert!(dir.path().join("reports").join("tests_dummy.xml").exists());
}

#[test_log::test]
fn test_all_pass() {
    let dir = TempDir::new().unwrap();
    let output = run_ci_test(
        dir.path(),
        indoc! {r#"
            [[tests]]
            name = "a"
            command = ["bash", "-c", "echo a"]
            depends_on = ["b"]

            [[tests]]
            name = "b"
            command = "echo b"
        "#},
        &["run", "a", "b"],
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "{stdout}");
    let b = stdout.find("Running test \"b\"").unwrap();
    let a = stdout.find("Running test \"a\"").unwrap();
    assert!(b < a, "{stdout}");
}

#[test_log::test]
fn test_cycle() {
    let dir = TempDir::new().unwrap();
    let output = run_ci_test(
        dir.path(),
        indoc! {r#"
            [[tests]]
            name = "a"
            command = "touch ran-a"
            depends_on = ["b"]

            [[tests]]
            name = "b"
            command = "touch ran-b"
            depends_on = ["a"]
        "#},
        &["run", "a", "b"],
    );
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("dependency loop"), "{stderr}");
    assert!(!dir.path().join("ran-a").exists());
    assert!(!dir.path().join("ran-b").exists());
}

#[test_log::test]
fn test_unknown_test() {
    let dir = TempDir::new().unwrap();
    let output = run_ci_test(dir.path(), CONFIG, &["run", "lint", "nonexistent"]);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(1), "{stderr}");
    assert!(stderr.contains("test nonexistent does not exist"), "{stderr}");
}

#[test_log::test]
fn test_list() {
    let dir = TempDir::new().unwrap();
    let output = run_ci_test(dir.path(), CONFIG, &["list"]);
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "build\nlint\nunit\n");
}
