//! Integration tests driving the compiled `orch` binary end to end,
//! exercising the scenarios from the engine's testable-properties section.

use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::process::Command;
use tempfile::TempDir;

fn orch_bin() -> Command {
    Command::cargo_bin("orch").expect("binary exists")
}

fn home_dir() -> (TempDir, std::path::PathBuf) {
    let tmp = TempDir::new().expect("create temp dir");
    let home = tmp.path().join(".orch");
    (tmp, home)
}

fn write_plan(dir: &std::path::Path, name: &str, yaml: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, yaml).unwrap();
    path
}

#[test]
fn dry_run_prints_topological_order() {
    let (tmp, home) = home_dir();
    let plan = write_plan(
        tmp.path(),
        "plan.yaml",
        r#"
tasks:
  - id: a
    cmd: "true"
  - id: b
    cmd: "true"
    depends_on: [a]
  - id: c
    cmd: "true"
    depends_on: [a]
  - id: d
    cmd: "true"
    depends_on: [b, c]
"#,
    );

    let output = orch_bin()
        .args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap(), "--dry-run"])
        .output()
        .expect("run orch");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let order: Vec<&str> = stdout.lines().collect();
    let pos = |id: &str| order.iter().position(|x| *x == id).unwrap();
    assert!(pos("a") < pos("b"));
    assert!(pos("a") < pos("c"));
    assert!(pos("b") < pos("d"));
    assert!(pos("c") < pos("d"));
}

#[test]
fn failing_task_skips_its_dependent_and_exits_three() {
    let (tmp, home) = home_dir();
    let plan = write_plan(
        tmp.path(),
        "plan.yaml",
        r#"
tasks:
  - id: fail
    cmd: "false"
  - id: skipped
    cmd: "true"
    depends_on: [fail]
"#,
    );

    orch_bin()
        .args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap()])
        .assert()
        .code(3);
}

#[test]
fn serial_max_parallel_never_overlaps() {
    let (tmp, home) = home_dir();
    let plan = write_plan(
        tmp.path(),
        "plan.yaml",
        r#"
tasks:
  - id: one
    cmd: "true"
  - id: two
    cmd: "true"
"#,
    );

    orch_bin()
        .args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap(), "--max-parallel", "1"])
        .assert()
        .success();
}

#[test]
fn resume_failed_only_reruns_just_the_failed_branch() {
    let (tmp, home) = home_dir();
    let gate = tmp.path().join("gate");
    let plan = write_plan(
        tmp.path(),
        "plan.yaml",
        &format!(
            r#"
tasks:
  - id: root
    cmd: "true"
  - id: flaky
    cmd: "test -f {}"
    depends_on: [root]
"#,
            gate.display()
        ),
    );

    let first = orch_bin().args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap()]).output().unwrap();
    assert_eq!(first.status.code(), Some(3));
    let stdout = String::from_utf8_lossy(&first.stdout);
    let run_id = stdout.split_whitespace().nth(1).unwrap().trim_end_matches(':').to_string();

    std::fs::write(&gate, b"ready").unwrap();

    let resumed = orch_bin().args(["--home", home.to_str().unwrap(), "resume", &run_id, "--failed-only"]).output().unwrap();
    assert_eq!(resumed.status.code(), Some(0));
    let resumed_stdout = String::from_utf8_lossy(&resumed.stdout);
    assert!(resumed_stdout.contains("Success"), "resumed run should reach a terminal SUCCESS status, got: {resumed_stdout}");

    orch_bin()
        .args(["--home", home.to_str().unwrap(), "status", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("run").and(predicate::str::contains("Success")))
        .stdout(predicate::str::contains("Running").not());
}

#[test]
fn status_command_reports_after_run() {
    let (tmp, home) = home_dir();
    let plan = write_plan(
        tmp.path(),
        "plan.yaml",
        r#"
tasks:
  - id: only
    cmd: "true"
"#,
    );

    let output = orch_bin().args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap()]).output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let run_id = stdout.split_whitespace().nth(1).unwrap().trim_end_matches(':').to_string();

    orch_bin()
        .args(["--home", home.to_str().unwrap(), "status", &run_id])
        .assert()
        .success()
        .stdout(predicate::str::contains("Success"));
}

#[test]
fn missing_run_reports_plan_error_and_exits_two() {
    let (_tmp, home) = home_dir();
    orch_bin().args(["--home", home.to_str().unwrap(), "status", "20000101_000000_000000"]).assert().code(2);
}
