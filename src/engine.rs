//! Run engine: the concurrency-bounded scheduler loop (§4.9).
//!
//! Ported from `orch/exec/runner.py::run_plan`, the central ~400-line
//! reference for this module. The source drives an asyncio event loop; here
//! the same contract — single-threaded decision making, concurrent runners
//! reporting back through a completion channel — is met with
//! `std::thread::spawn` per in-flight task and an `mpsc` channel, generalizing
//! a single-worker reader-thread pattern to N concurrent task threads.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use chrono::Utc;

use crate::artifacts::collect_artifacts;
use crate::cancel::cancel_requested as cancel_file_requested;
use crate::dag::build_adjacency;
use crate::error::OrchResult;
use crate::plan::Plan;
use crate::paths::{cancel_request_path, task_log_paths};
use crate::retry::{backoff_for_attempt, should_retry, Outcome};
use crate::runner::{run_attempt, RunSpec};
use crate::state::{RunState, RunStatus, SkipReason, TaskStatus};
use crate::store::save_state_atomic;

const IDLE_NAP: Duration = Duration::from_millis(50);

pub struct EngineOptions {
    pub max_parallel: u32,
    pub fail_fast: bool,
    pub resume: bool,
}

struct Completion {
    id: String,
    result: crate::runner::TaskResult,
}

/// Drive one run to completion, persisting state after every observable
/// transition. `state` is the freshly-initialized or freshly-loaded
/// RunState; `plan` supplies the task specs.
pub fn run(run_dir: &Path, plan: &Plan, mut state: RunState, opts: EngineOptions) -> OrchResult<RunState> {
    state.max_parallel = opts.max_parallel;
    state.fail_fast = opts.fail_fast;

    let adj = build_adjacency(plan);
    let specs: BTreeMap<String, &crate::plan::TaskSpec> = plan.tasks.iter().map(|t| (t.id.clone(), t)).collect();

    let active = compute_active_set(&state, opts.resume);

    let mut dep_remaining: BTreeMap<String, usize> = BTreeMap::new();
    for id in &active {
        let task = specs.get(id).expect("task id in plan");
        let unresolved = task.depends_on.iter().filter(|dep| active.contains(*dep)).count();
        dep_remaining.insert(id.clone(), unresolved);
    }

    let mut ready: VecDeque<String> = dep_remaining.iter().filter(|(_, n)| **n == 0).map(|(id, _)| id.clone()).collect();
    let mut active: BTreeSet<String> = active;

    let mut running: BTreeMap<String, thread::JoinHandle<()>> = BTreeMap::new();
    let (tx, rx) = mpsc::channel::<Completion>();

    let mut cancel_mode = false;
    let mut fail_fast_mode = false;
    let cancel_path = cancel_request_path(run_dir);

    save_state_atomic(run_dir, &state)?;

    while !active.is_empty() || !running.is_empty() {
        if !cancel_mode && cancel_file_requested(&cancel_path) {
            cancel_mode = true;
            let to_cancel: Vec<String> = active.iter().filter(|id| !running.contains_key(*id)).cloned().collect();
            for id in to_cancel {
                mark_terminal(&mut state, &mut active, &mut dep_remaining, &mut ready, &adj, &id, TaskStatus::Canceled, Some(SkipReason::RunCanceled));
            }
            save_state_atomic(run_dir, &state)?;
        }

        while !cancel_mode && !ready.is_empty() && running.len() < opts.max_parallel as usize {
            let id = ready.pop_front().unwrap();
            let task = specs.get(&id).expect("task id in plan");

            let dep_not_success = task.depends_on.iter().any(|dep| final_status(&state, dep).map(|s| s != TaskStatus::Success).unwrap_or(false));
            if dep_not_success {
                mark_terminal(&mut state, &mut active, &mut dep_remaining, &mut ready, &adj, &id, TaskStatus::Skipped, Some(SkipReason::DependencyNotSuccess));
                save_state_atomic(run_dir, &state)?;
                continue;
            }
            if fail_fast_mode {
                mark_terminal(&mut state, &mut active, &mut dep_remaining, &mut ready, &adj, &id, TaskStatus::Skipped, Some(SkipReason::FailFast));
                save_state_atomic(run_dir, &state)?;
                continue;
            }

            let ts = state.tasks.get_mut(&id).expect("task state exists");
            ts.status = TaskStatus::Running;
            ts.started_at = Some(Utc::now().to_rfc3339());
            ts.attempts += 1;
            save_state_atomic(run_dir, &state)?;

            let cwd = resolve_cwd(&state.workdir, ts.cwd.as_deref());
            let (stdout_path, stderr_path) = task_log_paths(run_dir, &id);
            let cmd = ts.cmd.clone();
            let env = ts.env.clone();
            let timeout_sec = ts.timeout_sec;
            let attempt = ts.attempts;
            let total_attempts = ts.retries + 1;
            let cancel_path_clone = cancel_path.clone();
            let tx_clone = tx.clone();
            let id_clone = id.clone();

            let handle = thread::spawn(move || {
                let spec = RunSpec {
                    cmd: &cmd,
                    cwd: &cwd,
                    env: env.as_ref(),
                    timeout_sec,
                    attempt,
                    total_attempts,
                    stdout_path: &stdout_path,
                    stderr_path: &stderr_path,
                };
                let result = run_attempt(&spec, || cancel_file_requested(&cancel_path_clone)).unwrap_or_else(|_| crate::runner::TaskResult {
                    exit_code: Some(70),
                    timed_out: false,
                    canceled: false,
                    start_failed: false,
                    started_at: Utc::now(),
                    ended_at: Utc::now(),
                    duration_sec: 0.0,
                });
                let _ = tx_clone.send(Completion { id: id_clone, result });
            });
            running.insert(id, handle);
        }

        if running.is_empty() && ready.is_empty() && !active.is_empty() {
            let remaining: Vec<String> = active.iter().cloned().collect();
            for id in remaining {
                mark_terminal(&mut state, &mut active, &mut dep_remaining, &mut ready, &adj, &id, TaskStatus::Skipped, Some(SkipReason::UnresolvableDependencies));
            }
            save_state_atomic(run_dir, &state)?;
            break;
        }

        if running.is_empty() && ready.is_empty() {
            continue;
        }
        if running.is_empty() {
            thread::sleep(IDLE_NAP);
            continue;
        }

        let completion = match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(c) => c,
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        };
        if let Some(handle) = running.remove(&completion.id) {
            let _ = handle.join();
        }

        let id = completion.id;
        let result = completion.result;
        let (attempts, retries, retry_backoff_sec) = {
            let ts = state.tasks.get_mut(&id).expect("task state exists");
            ts.ended_at = Some(result.ended_at.to_rfc3339());
            ts.duration_sec = Some(result.duration_sec);
            ts.exit_code = result.exit_code;
            ts.timed_out = result.timed_out;
            ts.canceled = result.canceled;
            if result.start_failed {
                ts.skip_reason = None;
            }
            (ts.attempts, ts.retries, ts.retry_backoff_sec.clone())
        };

        let outcome = Outcome {
            attempts,
            retries,
            timed_out: result.timed_out,
            exit_code: result.exit_code,
            canceled: result.canceled,
            start_failed: result.start_failed,
        };

        if should_retry(&outcome) {
            state.tasks.get_mut(&id).expect("task state exists").status = TaskStatus::Ready;
            save_state_atomic(run_dir, &state)?;
            let backoff = backoff_for_attempt(attempts - 1, &retry_backoff_sec);
            thread::sleep(Duration::from_secs_f64(backoff));
            state.tasks.get_mut(&id).expect("task state exists").status = TaskStatus::Pending;
            ready.push_back(id.clone());
            save_state_atomic(run_dir, &state)?;
            continue;
        }

        if result.canceled {
            cancel_mode = true;
            let ts = state.tasks.get_mut(&id).unwrap();
            ts.skip_reason = Some(SkipReason::RunCanceled);
            ts.status = TaskStatus::Canceled;
            finish_task(&mut active, &mut dep_remaining, &mut ready, &adj, &id);
            save_state_atomic(run_dir, &state)?;
            continue;
        }

        let success = result.exit_code == Some(0) && !result.timed_out;
        if success {
            let cwd = resolve_cwd(&state.workdir, state.tasks[&id].cwd.as_deref());
            let artifacts_dir = plan.artifacts_dir.as_deref().map(|dir| resolve_cwd(&state.workdir, Some(dir)));
            let artifact_paths = collect_artifacts(run_dir, &id, &cwd, &state.tasks[&id].outputs, artifacts_dir.as_deref());
            let ts = state.tasks.get_mut(&id).unwrap();
            ts.artifact_paths = artifact_paths;
            ts.status = TaskStatus::Success;
            finish_task(&mut active, &mut dep_remaining, &mut ready, &adj, &id);
        } else {
            if result.start_failed {
                state.tasks.get_mut(&id).unwrap().skip_reason = Some(SkipReason::ProcessStartFailed);
            }
            state.tasks.get_mut(&id).unwrap().status = TaskStatus::Failed;
            finish_task(&mut active, &mut dep_remaining, &mut ready, &adj, &id);
            if opts.fail_fast && !fail_fast_mode {
                fail_fast_mode = true;
                let remaining: Vec<String> = active.iter().filter(|i| !running.contains_key(*i)).cloned().collect();
                for rid in remaining {
                    mark_terminal(&mut state, &mut active, &mut dep_remaining, &mut ready, &adj, &rid, TaskStatus::Skipped, Some(SkipReason::FailFast));
                }
            }
        }
        save_state_atomic(run_dir, &state)?;
    }

    state.status = roll_up_status(&state);
    state.updated_at = Utc::now().to_rfc3339();
    save_state_atomic(run_dir, &state)?;
    Ok(state)
}

fn final_status(state: &RunState, id: &str) -> Option<TaskStatus> {
    state.tasks.get(id).map(|t| t.status)
}

/// Mark a task terminal (skip/cancel path, never scheduled) and propagate
/// the dep_remaining decrement to its dependents.
fn mark_terminal(
    state: &mut RunState,
    active: &mut BTreeSet<String>,
    dep_remaining: &mut BTreeMap<String, usize>,
    ready: &mut VecDeque<String>,
    adj: &crate::dag::Adjacency,
    id: &str,
    status: TaskStatus,
    skip_reason: Option<SkipReason>,
) {
    if let Some(ts) = state.tasks.get_mut(id) {
        ts.status = status;
        ts.skip_reason = skip_reason;
        ts.ended_at = Some(Utc::now().to_rfc3339());
        if status == TaskStatus::Canceled {
            ts.canceled = true;
        }
    }
    finish_task(active, dep_remaining, ready, adj, id);
}

/// Remove a terminal task from the active set and decrement the
/// `dep_remaining` count of its dependents, enqueuing any that reach zero.
fn finish_task(active: &mut BTreeSet<String>, dep_remaining: &mut BTreeMap<String, usize>, ready: &mut VecDeque<String>, adj: &crate::dag::Adjacency, id: &str) {
    active.remove(id);
    dep_remaining.remove(id);
    if let Some(children) = adj.dependents.get(id) {
        for child in children {
            if !active.contains(child) {
                continue;
            }
            if let Some(count) = dep_remaining.get_mut(child) {
                if *count > 0 {
                    *count -= 1;
                }
                if *count == 0 {
                    ready.push_back(child.clone());
                }
            }
        }
    }
}

fn resolve_cwd(workdir: &str, task_cwd: Option<&str>) -> PathBuf {
    match task_cwd {
        Some(c) => {
            let p = Path::new(c);
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                Path::new(workdir).join(p)
            }
        }
        None => PathBuf::from(workdir),
    }
}

fn roll_up_status(state: &RunState) -> RunStatus {
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
    if canceled > 0 {
        RunStatus::Canceled
    } else if success == state.tasks.len() {
        RunStatus::Success
    } else if failed_or_skipped > 0 {
        RunStatus::Failed
    } else {
        RunStatus::Running
    }
}

/// The set of ids still to run in this invocation. On a fresh run that is
/// every task; on a resume, `cmd_resume` has already decided the rerun set
/// and reset each of its members to PENDING, so `active` is simply every
/// task currently PENDING — re-deriving the rerun set here via a second BFS
/// would just re-run the same decision on state the caller already mutated.
fn compute_active_set(state: &RunState, resume: bool) -> BTreeSet<String> {
    if !resume {
        return state.tasks.keys().cloned().collect();
    }
    state.tasks.iter().filter(|(_, t)| t.status == TaskStatus::Pending).map(|(id, _)| id.clone()).collect()
}
