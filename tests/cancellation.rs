//! Cancellation and artifact-collection scenarios driven against the
//! compiled `orch` binary.

use assert_cmd::prelude::*;
use std::process::Command;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn orch_bin() -> Command {
    Command::cargo_bin("orch").expect("binary exists")
}

fn latest_run_id(home: &std::path::Path) -> Option<String> {
    let runs_dir = home.join("runs");
    let mut entries: Vec<_> = std::fs::read_dir(&runs_dir).ok()?.filter_map(|e| e.ok()).collect();
    entries.sort_by_key(|e| e.file_name());
    entries.last().map(|e| e.file_name().to_string_lossy().into_owned())
}

#[test]
fn cancel_mid_run_stops_dependents_and_exits_four() {
    let tmp = TempDir::new().unwrap();
    let home = tmp.path().join(".orch");
    let plan = tmp.path().join("plan.yaml");
    std::fs::write(
        &plan,
        r#"
tasks:
  - id: long
    cmd: "sleep 10"
  - id: next
    cmd: "true"
    depends_on: [long]
"#,
    )
    .unwrap();

    let mut child = orch_bin().args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap()]).spawn().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let run_id = loop {
        if let Some(id) = latest_run_id(&home) {
            break id;
        }
        assert!(Instant::now() < deadline, "run directory never appeared");
        std::thread::sleep(Duration::from_millis(50));
    };

    std::thread::sleep(Duration::from_millis(300));
    orch_bin().args(["--home", home.to_str().unwrap(), "cancel", &run_id]).assert().success();

    let status = child.wait().unwrap();
    assert_eq!(status.code(), Some(4));
}

#[test]
fn artifact_collection_records_sanitized_relative_paths() {
    let tmp = TempDir::new().unwrap();
    let home = tmp.path().join(".orch");
    let plan = tmp.path().join("plan.yaml");
    std::fs::write(
        &plan,
        r#"
tasks:
  - id: publish
    cmd: "sh -c 'mkdir -p out/sub && echo a > out/sub/a.txt && echo b > out/b.txt'"
    outputs: ["out/**/*.txt"]
"#,
    )
    .unwrap();

    let output = orch_bin().args(["--home", home.to_str().unwrap(), "run", plan.to_str().unwrap(), "--workdir", tmp.path().to_str().unwrap()]).output().unwrap();
    assert!(output.status.success());

    let run_id = latest_run_id(&home).unwrap();
    let artifacts_dir = home.join("runs").join(&run_id).join("artifacts").join("publish");
    assert!(artifacts_dir.join("out/b.txt").exists());
    assert!(artifacts_dir.join("out/sub/a.txt").exists());
}
