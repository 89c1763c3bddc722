//! CLI surface: commands, flags, exit codes (§6).
//!
//! Ported from `orch/cli.py`. Flag and subcommand layout follows a
//! `clap::Parser`/`Subcommand` derive style.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Local;
use clap::{Parser, Subcommand};

use crate::dag::{build_adjacency, topological_order};
use crate::engine::{self, EngineOptions};
use crate::error::{OrchError, OrchResult};
use crate::lock::run_lock;
use crate::paths::{self, run_dir, run_exists};
use crate::plan::{copy_plan, load_plan};
use crate::report::write_report;
use crate::state::{RunState, RunStatus, TaskStatus};
use crate::store::{load_state, save_state_atomic};

const DEFAULT_STALE_SEC: u64 = 3600;
const STATUS_LOCK_RETRIES: u32 = 5;
const STATUS_LOCK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about = "local DAG task orchestrator for command-line tasks")]
pub struct Cli {
    /// Root directory for runs (default `.orch`).
    #[arg(long, global = true, value_name = "DIR", default_value = ".orch")]
    pub home: PathBuf,

    /// Directory tasks resolve relative paths against (default `.`).
    #[arg(long, global = true, value_name = "DIR", default_value = ".")]
    pub workdir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a fresh run from a plan file.
    Run {
        plan: PathBuf,
        #[arg(long, default_value_t = 4)]
        max_parallel: u32,
        #[arg(long, default_value_t = false)]
        fail_fast: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Resume a previous run.
    Resume {
        run_id: String,
        #[arg(long, default_value_t = 4)]
        max_parallel: u32,
        #[arg(long, default_value_t = false)]
        fail_fast: bool,
        #[arg(long, default_value_t = false)]
        failed_only: bool,
    },
    /// Print the status of a run.
    Status {
        run_id: String,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
    /// Print task log paths for a run.
    Logs { run_id: String },
    /// Request cancellation of an in-progress run.
    Cancel { run_id: String },
}

pub fn dispatch(cli: Cli) -> OrchResult<i32> {
    match cli.command {
        Commands::Run { plan, max_parallel, fail_fast, dry_run } => cmd_run(&cli.home, &cli.workdir, &plan, max_parallel, fail_fast, dry_run),
        Commands::Resume { run_id, max_parallel, fail_fast, failed_only } => cmd_resume(&cli.home, &cli.workdir, &run_id, max_parallel, fail_fast, failed_only),
        Commands::Status { run_id, json } => cmd_status(&cli.home, &run_id, json),
        Commands::Logs { run_id } => cmd_logs(&cli.home, &run_id),
        Commands::Cancel { run_id } => cmd_cancel(&cli.home, &run_id),
    }
}

fn cmd_run(home: &std::path::Path, workdir: &std::path::Path, plan_path: &std::path::Path, max_parallel: u32, fail_fast: bool, dry_run: bool) -> OrchResult<i32> {
    let plan = load_plan(plan_path)?;

    if dry_run {
        let adj = build_adjacency(&plan);
        let order = topological_order(&adj).ok_or_else(|| OrchError::plan("plan contains a dependency cycle"))?;
        for id in order {
            println!("{id}");
        }
        return Ok(0);
    }

    let run_id = paths::new_run_id(Local::now());
    let dir = run_dir(home, &run_id);
    paths::ensure_run_layout(&dir).map_err(OrchError::from)?;
    copy_plan(plan_path, &paths::plan_copy_path(&dir))?;

    let lock = run_lock(&paths::lock_path(&dir), DEFAULT_STALE_SEC, 0, Duration::from_millis(100))?;

    let now = chrono::Utc::now().to_rfc3339();
    let tasks = plan.tasks.iter().map(|t| (t.id.clone(), crate::state::TaskState::fresh(&t.id, t))).collect();
    let state = RunState {
        run_id: run_id.clone(),
        created_at: now.clone(),
        updated_at: now,
        status: RunStatus::Running,
        goal: plan.goal.clone(),
        plan_relpath: "plan.yaml".to_string(),
        home: home.canonicalize().unwrap_or_else(|_| home.to_path_buf()).to_string_lossy().into_owned(),
        workdir: workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf()).to_string_lossy().into_owned(),
        max_parallel,
        fail_fast,
        tasks,
    };

    let opts = EngineOptions { max_parallel, fail_fast, resume: false };
    let final_state = engine::run(&dir, &plan, state, opts)?;
    write_report(&dir, &final_state)?;
    lock.release();

    println!("run {run_id}: {:?}", final_state.status);
    Ok(exit_code_for(final_state.status))
}

fn cmd_resume(home: &std::path::Path, workdir: &std::path::Path, run_id: &str, max_parallel: u32, fail_fast: bool, failed_only: bool) -> OrchResult<i32> {
    let dir = run_dir(home, run_id);
    if !run_exists(&dir) {
        return Err(OrchError::plan(format!("no such run: {run_id}")));
    }

    // A resumed run must not immediately re-cancel itself because of a stale
    // cancel.request left over from the run it is resuming.
    let _ = crate::cancel::clear_cancel_request(&paths::cancel_request_path(&dir));

    let lock = run_lock(&paths::lock_path(&dir), DEFAULT_STALE_SEC, 0, Duration::from_millis(100))?;

    let mut state = load_state(&dir)?;
    let plan = load_plan(&paths::plan_copy_path(&dir))?;

    let plan_ids: std::collections::BTreeSet<String> = plan.tasks.iter().map(|t| t.id.clone()).collect();
    let state_ids: std::collections::BTreeSet<String> = state.tasks.keys().cloned().collect();
    if plan_ids != state_ids {
        return Err(OrchError::state("plan task ids do not match persisted state task ids"));
    }

    for task in state.tasks.values_mut() {
        if task.status == TaskStatus::Running {
            task.status = TaskStatus::Failed;
            task.skip_reason = Some(crate::state::SkipReason::PreviousRunInterrupted);
            task.ended_at = Some(chrono::Utc::now().to_rfc3339());
        }
    }
    state.status = RunStatus::Running;
    state.workdir = workdir.canonicalize().unwrap_or_else(|_| workdir.to_path_buf()).to_string_lossy().into_owned();

    let adj = build_adjacency(&plan);
    let rerun_set = engine_rerun_set(&state, &adj, failed_only);
    for id in &rerun_set {
        if let Some(task) = state.tasks.get_mut(id) {
            task.reset_for_rerun();
        }
    }
    save_state_atomic(&dir, &state)?;

    let opts = EngineOptions { max_parallel, fail_fast, resume: true };
    let final_state = engine::run(&dir, &plan, state, opts)?;
    write_report(&dir, &final_state)?;
    lock.release();

    println!("run {run_id}: {:?}", final_state.status);
    Ok(exit_code_for(final_state.status))
}

fn engine_rerun_set(state: &RunState, adj: &crate::dag::Adjacency, failed_only: bool) -> Vec<String> {
    if !failed_only {
        return state.tasks.iter().filter(|(_, t)| t.status != TaskStatus::Success).map(|(id, _)| id.clone()).collect();
    }
    let mut seeds: std::collections::VecDeque<String> = state.tasks.iter().filter(|(_, t)| t.status == TaskStatus::Failed).map(|(id, _)| id.clone()).collect();
    let mut set: std::collections::BTreeSet<String> = seeds.iter().cloned().collect();
    while let Some(id) = seeds.pop_front() {
        if let Some(children) = adj.dependents.get(&id) {
            for child in children {
                let status = state.tasks.get(child).map(|t| t.status);
                if status != Some(TaskStatus::Success) && set.insert(child.clone()) {
                    seeds.push_back(child.clone());
                }
            }
        }
    }
    set.into_iter().collect()
}

fn cmd_status(home: &std::path::Path, run_id: &str, json: bool) -> OrchResult<i32> {
    let dir = run_dir(home, run_id);
    if !run_exists(&dir) {
        return Err(OrchError::plan(format!("no such run: {run_id}")));
    }

    // Best-effort consistent read: take the lock briefly, fall back to an
    // unlocked read if a run is actively holding it.
    let lock = run_lock(&paths::lock_path(&dir), DEFAULT_STALE_SEC, STATUS_LOCK_RETRIES, STATUS_LOCK_INTERVAL).ok();
    let state = load_state(&dir)?;
    if let Some(lock) = lock {
        lock.release();
    }

    if json {
        let json = serde_json::to_string_pretty(&state).map_err(|e| OrchError::state(format!("cannot encode state: {e}")))?;
        println!("{json}");
    } else {
        println!("run {}: {:?}", state.run_id, state.status);
        for (id, task) in &state.tasks {
            println!("  {id}: {:?} (attempts={})", task.status, task.attempts);
        }
    }
    Ok(0)
}

fn cmd_logs(home: &std::path::Path, run_id: &str) -> OrchResult<i32> {
    let dir = run_dir(home, run_id);
    if !run_exists(&dir) {
        return Err(OrchError::plan(format!("no such run: {run_id}")));
    }
    let state = load_state(&dir)?;
    for (id, task) in &state.tasks {
        println!("{id}:");
        println!("  stdout: {}", dir.join(&task.stdout_path).display());
        println!("  stderr: {}", dir.join(&task.stderr_path).display());
    }
    Ok(0)
}

fn cmd_cancel(home: &std::path::Path, run_id: &str) -> OrchResult<i32> {
    let dir = run_dir(home, run_id);
    if !run_exists(&dir) {
        return Err(OrchError::plan(format!("no such run: {run_id}")));
    }
    crate::cancel::write_cancel_request(&paths::cancel_request_path(&dir)).map_err(OrchError::from)?;
    println!("cancel requested for {run_id}");
    Ok(0)
}

pub fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Success => 0,
        RunStatus::Running => 0,
        RunStatus::Failed => 3,
        RunStatus::Canceled => 4,
    }
}
