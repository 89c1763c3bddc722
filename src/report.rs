//! Report summarizer and Markdown renderer (§4.10).
//!
//! Ported from `orch/report/summarize.py` and `orch/report/render_md.py`.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{OrchError, OrchResult};
use crate::paths::{report_path, task_log_paths};
use crate::state::{RunState, SkipReason, TaskStatus};

const STDERR_TAIL_LINES: usize = 50;

pub struct TaskRow {
    pub id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub duration_sec: Option<f64>,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout_path: String,
    pub stderr_path: String,
}

pub struct Problem {
    pub id: String,
    pub status: TaskStatus,
    pub skip_reason: Option<String>,
    pub stderr_tail: Vec<String>,
}

pub struct Summary {
    pub run_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: String,
    pub goal: Option<String>,
    pub workdir: String,
    pub max_parallel: u32,
    pub fail_fast: bool,
    pub rows: Vec<TaskRow>,
    pub problems: Vec<Problem>,
    pub artifacts: Vec<String>,
}

pub fn build_summary(run_dir: &Path, state: &RunState) -> Summary {
    let mut rows = Vec::new();
    let mut problems = Vec::new();
    let mut artifacts = Vec::new();

    for (id, task) in &state.tasks {
        rows.push(TaskRow {
            id: id.clone(),
            status: task.status,
            attempts: task.attempts,
            duration_sec: task.duration_sec,
            exit_code: task.exit_code,
            timed_out: task.timed_out,
            stdout_path: task.stdout_path.clone(),
            stderr_path: task.stderr_path.clone(),
        });

        if matches!(task.status, TaskStatus::Failed | TaskStatus::Skipped | TaskStatus::Canceled) {
            let (_, stderr_path) = task_log_paths(run_dir, id);
            let tail = tail_lines(&stderr_path, STDERR_TAIL_LINES);
            problems.push(Problem {
                id: id.clone(),
                status: task.status,
                skip_reason: task.skip_reason.map(skip_reason_label),
                stderr_tail: tail,
            });
        }

        artifacts.extend(task.artifact_paths.iter().cloned());
    }

    rows.sort_by(|a, b| a.id.cmp(&b.id));
    problems.sort_by(|a, b| a.id.cmp(&b.id));
    artifacts.sort();
    artifacts.dedup();

    Summary {
        run_id: state.run_id.clone(),
        created_at: state.created_at.clone(),
        updated_at: state.updated_at.clone(),
        status: format!("{:?}", state.status).to_uppercase(),
        goal: state.goal.clone(),
        workdir: state.workdir.clone(),
        max_parallel: state.max_parallel,
        fail_fast: state.fail_fast,
        rows,
        problems,
        artifacts,
    }
}

/// Render a `SkipReason` the same way it is persisted in `state.json`
/// (`#[serde(rename_all = "snake_case")]`) rather than its Debug form.
fn skip_reason_label(reason: SkipReason) -> String {
    match reason {
        SkipReason::DependencyNotSuccess => "dependency_not_success",
        SkipReason::RunCanceled => "run_canceled",
        SkipReason::FailFast => "fail_fast",
        SkipReason::UnresolvableDependencies => "unresolvable_dependencies",
        SkipReason::PreviousRunInterrupted => "previous_run_interrupted",
        SkipReason::ProcessStartFailed => "process_start_failed",
        SkipReason::RunnerException => "runner_exception",
    }
    .to_string()
}

fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].iter().map(|s| s.to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}

pub fn render_markdown(summary: &Summary) -> String {
    let mut out = String::new();

    writeln!(out, "# Run {}", summary.run_id).unwrap();
    writeln!(out).unwrap();
    writeln!(out, "- status: {}", summary.status).unwrap();
    writeln!(out, "- created: {}", summary.created_at).unwrap();
    writeln!(out, "- updated: {}", summary.updated_at).unwrap();
    if let Some(goal) = &summary.goal {
        writeln!(out, "- goal: {goal}").unwrap();
    }
    writeln!(out, "- workdir: {}", summary.workdir).unwrap();
    writeln!(out, "- max_parallel: {}", summary.max_parallel).unwrap();
    writeln!(out, "- fail_fast: {}", summary.fail_fast).unwrap();
    writeln!(out).unwrap();

    writeln!(out, "## Tasks").unwrap();
    writeln!(out).unwrap();
    writeln!(out, "| id | status | attempts | duration_sec | exit_code | timed_out |").unwrap();
    writeln!(out, "|---|---|---|---|---|---|").unwrap();
    for row in &summary.rows {
        writeln!(
            out,
            "| {} | {:?} | {} | {} | {} | {} |",
            row.id,
            row.status,
            row.attempts,
            row.duration_sec.map(|d| format!("{d:.3}")).unwrap_or_else(|| "-".to_string()),
            row.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            row.timed_out,
        )
        .unwrap();
    }
    writeln!(out).unwrap();

    if !summary.problems.is_empty() {
        writeln!(out, "## Problems").unwrap();
        writeln!(out).unwrap();
        for problem in &summary.problems {
            writeln!(out, "### {} ({:?})", problem.id, problem.status).unwrap();
            if let Some(reason) = &problem.skip_reason {
                writeln!(out, "skip_reason: {reason}").unwrap();
            }
            if !problem.stderr_tail.is_empty() {
                writeln!(out, "```").unwrap();
                for line in &problem.stderr_tail {
                    writeln!(out, "{line}").unwrap();
                }
                writeln!(out, "```").unwrap();
            }
            writeln!(out).unwrap();
        }
    }

    writeln!(out, "## Artifacts").unwrap();
    writeln!(out).unwrap();
    if summary.artifacts.is_empty() {
        writeln!(out, "(none)").unwrap();
    } else {
        for artifact in &summary.artifacts {
            writeln!(out, "- {artifact}").unwrap();
        }
    }

    out
}

pub fn write_report(run_dir: &Path, state: &RunState) -> OrchResult<()> {
    let summary = build_summary(run_dir, state);
    let markdown = render_markdown(&summary);
    fs::write(report_path(run_dir), markdown).map_err(|e| OrchError::os(format!("cannot write report: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn task() -> crate::state::TaskState {
        crate::state::TaskState {
            status: TaskStatus::Success,
            depends_on: vec![],
            cmd: vec!["true".into()],
            cwd: None,
            env: None,
            timeout_sec: None,
            retries: 0,
            retry_backoff_sec: vec![],
            outputs: vec![],
            attempts: 1,
            started_at: Some("2026-07-26T10:00:00+00:00".into()),
            ended_at: Some("2026-07-26T10:00:01+00:00".into()),
            duration_sec: Some(1.0),
            exit_code: Some(0),
            timed_out: false,
            canceled: false,
            skip_reason: None,
            stdout_path: "logs/t.out.log".into(),
            stderr_path: "logs/t.err.log".into(),
            artifact_paths: vec!["artifacts/t/a.txt".into()],
        }
    }

    #[test]
    fn renders_markdown_with_trailing_content() {
        let tmp = TempDir::new().unwrap();
        let mut tasks = BTreeMap::new();
        tasks.insert("t".to_string(), task());
        let state = RunState {
            run_id: "r".into(),
            created_at: "2026-07-26T10:00:00+00:00".into(),
            updated_at: "2026-07-26T10:00:01+00:00".into(),
            status: crate::state::RunStatus::Success,
            goal: Some("demo".into()),
            plan_relpath: "plan.yaml".into(),
            home: tmp.path().to_string_lossy().into_owned(),
            workdir: tmp.path().to_string_lossy().into_owned(),
            max_parallel: 4,
            fail_fast: false,
            tasks,
        };
        let summary = build_summary(tmp.path(), &state);
        let md = render_markdown(&summary);
        assert!(md.contains("# Run r"));
        assert!(md.contains("artifacts/t/a.txt"));
    }
}
