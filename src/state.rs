//! Run/task state model and the strict validating codec (§3).
//!
//! Ported from `orch/state/model.py`. The source decodes a loosely-typed
//! `dict` and walks it by hand; the idiomatic Rust equivalent is a typed
//! struct with `#[serde(deny_unknown_fields)]` plus a post-deserialize
//! `validate()` pass that re-checks every cross-field invariant spec.md §3
//! describes. `load_state` (src/store.rs) calls `validate()` after decoding.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::TaskSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Ready,
    Running,
    Success,
    Failed,
    Skipped,
    Canceled,
}

/// The closed skip-reason set (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    DependencyNotSuccess,
    RunCanceled,
    FailFast,
    UnresolvableDependencies,
    PreviousRunInterrupted,
    ProcessStartFailed,
    RunnerException,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskState {
    pub status: TaskStatus,
    pub depends_on: Vec<String>,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub timeout_sec: Option<f64>,
    pub retries: u32,
    pub retry_backoff_sec: Vec<f64>,
    pub outputs: Vec<String>,

    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub duration_sec: Option<f64>,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub canceled: bool,
    pub skip_reason: Option<SkipReason>,
    pub stdout_path: String,
    pub stderr_path: String,
    #[serde(default)]
    pub artifact_paths: Vec<String>,
}

impl TaskState {
    pub fn fresh(id: &str, spec: &TaskSpec) -> Self {
        TaskState {
            status: TaskStatus::Pending,
            depends_on: spec.depends_on.clone(),
            cmd: spec.cmd.clone(),
            cwd: spec.cwd.clone(),
            env: spec.env.clone(),
            timeout_sec: spec.timeout_sec,
            retries: spec.retries,
            retry_backoff_sec: spec.retry_backoff_sec.clone(),
            outputs: spec.outputs.clone(),
            attempts: 0,
            started_at: None,
            ended_at: None,
            duration_sec: None,
            exit_code: None,
            timed_out: false,
            canceled: false,
            skip_reason: None,
            stdout_path: format!("logs/{id}.out.log"),
            stderr_path: format!("logs/{id}.err.log"),
            artifact_paths: Vec::new(),
        }
    }

    /// Reset runtime fields for a rerun (`_reset_for_rerun`): status goes
    /// back to PENDING, runtime fields clear, artifacts empty. The plan
    /// fields (cmd/depends_on/…) and `attempts` are left untouched — retry
    /// headroom is tracked across the lifetime of a run, not per resume.
    pub fn reset_for_rerun(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
        self.ended_at = None;
        self.duration_sec = None;
        self.exit_code = None;
        self.timed_out = false;
        self.canceled = false;
        self.skip_reason = None;
        self.artifact_paths.clear();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunState {
    pub run_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub status: RunStatus,
    pub goal: Option<String>,
    pub plan_relpath: String,
    pub home: String,
    pub workdir: String,
    pub max_parallel: u32,
    pub fail_fast: bool,
    pub tasks: BTreeMap<String, TaskState>,
}

/// A state invariant violation, naming the first field that failed so the
/// store can render `invalid state field: <field>` (§4.2/§6).
#[derive(Debug)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid state field: {}", self.0)
    }
}

fn fail(field: impl Into<String>) -> ValidationError {
    ValidationError(field.into())
}

pub fn validate_run_state(state: &RunState) -> Result<(), ValidationError> {
    if state.updated_at < state.created_at {
        return Err(fail("updated_at"));
    }
    if state.plan_relpath.split('/').any(|seg| seg == "..") || state.plan_relpath.starts_with('/') {
        return Err(fail("plan_relpath"));
    }
    if state.max_parallel < 1 {
        return Err(fail("max_parallel"));
    }

    for (id, task) in &state.tasks {
        validate_task_state(id, task)?;
    }

    let mut success = 0usize;
    let mut failed_or_skipped = 0usize;
    let mut canceled = 0usize;
    for task in state.tasks.values() {
        match task.status {
            TaskStatus::Success => success += 1,
            TaskStatus::Failed | TaskStatus::Skipped => failed_or_skipped += 1,
            TaskStatus::Canceled => canceled += 1,
            _ => {}
        }
    }
    let expected = if canceled > 0 {
        RunStatus::Canceled
    } else if success == state.tasks.len() {
        RunStatus::Success
    } else if failed_or_skipped > 0 {
        RunStatus::Failed
    } else {
        state.status
    };
    if matches!(state.status, RunStatus::Success | RunStatus::Failed | RunStatus::Canceled) && state.status != expected {
        return Err(fail("status"));
    }

    Ok(())
}

fn validate_task_state(id: &str, task: &TaskState) -> Result<(), ValidationError> {
    let field = |name: &str| format!("tasks.{id}.{name}");

    if task.attempts > task.retries + 1 {
        return Err(fail(field("attempts")));
    }
    if !task.artifact_paths.iter().all(|p| p.starts_with(&format!("artifacts/{id}/"))) {
        return Err(fail(field("artifact_paths")));
    }
    {
        let mut lowered: Vec<String> = task.artifact_paths.iter().map(|p| p.to_lowercase()).collect();
        let before = lowered.len();
        lowered.sort();
        lowered.dedup();
        if lowered.len() != before {
            return Err(fail(field("artifact_paths")));
        }
    }
    if task.stdout_path != format!("logs/{id}.out.log") || task.stderr_path != format!("logs/{id}.err.log") {
        return Err(fail(field("stdout_path")));
    }

    match task.status {
        TaskStatus::Success => {
            if task.attempts < 1
                || task.started_at.is_none()
                || task.ended_at.is_none()
                || task.duration_sec.is_none()
                || task.exit_code != Some(0)
                || task.timed_out
                || task.canceled
                || task.skip_reason.is_some()
            {
                return Err(fail(field("status")));
            }
        }
        TaskStatus::Failed => {
            if task.attempts < 1 || task.started_at.is_none() || task.ended_at.is_none() || task.canceled {
                return Err(fail(field("status")));
            }
            // Either the attempt timed out, or it ended with a non-zero/absent
            // exit code (absent covers a start failure); a clean exit_code==0
            // with no timeout can never justify FAILED.
            let bad_exit = task.exit_code.map(|c| c != 0).unwrap_or(true);
            if !task.timed_out && !bad_exit {
                return Err(fail(field("status")));
            }
        }
        TaskStatus::Skipped => {
            if task.attempts != 0 || task.started_at.is_some() || task.ended_at.is_none() || task.skip_reason.is_none() || !task.artifact_paths.is_empty() {
                return Err(fail(field("status")));
            }
        }
        TaskStatus::Canceled => {
            if !task.canceled || task.skip_reason != Some(SkipReason::RunCanceled) || !task.artifact_paths.is_empty() {
                return Err(fail(field("status")));
            }
        }
        TaskStatus::Running => {
            if task.started_at.is_none() || task.ended_at.is_some() || task.exit_code.is_some() || task.attempts < 1 || !task.artifact_paths.is_empty() {
                return Err(fail(field("status")));
            }
        }
        TaskStatus::Ready | TaskStatus::Pending => {
            if task.attempts > 0 && task.attempts > task.retries {
                return Err(fail(field("attempts")));
            }
        }
    }

    Ok(())
}
