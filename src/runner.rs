//! Per-task process lifecycle: spawn, stream capture, timeout, cancel (§4.5).
//!
//! Ported from `orch/exec/runner.py` and `orch/exec/timeout.py`; the
//! reader-thread log-streaming pattern follows the per-pipe reader thread
//! plus `mpsc` completion reporting used throughout this crate.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use wait_timeout::ChildExt;

use crate::path_guard::guarded_open_append;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(1);
const CHUNK_SIZE: usize = 4096;

pub struct TaskResult {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub canceled: bool,
    pub start_failed: bool,
    pub started_at: chrono::DateTime<Utc>,
    pub ended_at: chrono::DateTime<Utc>,
    pub duration_sec: f64,
}

pub struct RunSpec<'a> {
    pub cmd: &'a [String],
    pub cwd: &'a Path,
    pub env: Option<&'a BTreeMap<String, String>>,
    pub timeout_sec: Option<f64>,
    pub attempt: u32,
    pub total_attempts: u32,
    pub stdout_path: &'a Path,
    pub stderr_path: &'a Path,
}

fn spawn_reader<R: Read + Send + 'static>(reader: R, mut dest: File) -> thread::JoinHandle<io::Result<()>> {
    thread::spawn(move || {
        let mut buf = io::BufReader::new(reader);
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            let n = match buf.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => return Err(e),
            };
            dest.write_all(&chunk[..n])?;
            dest.flush()?;
        }
        Ok(())
    })
}

/// Run one attempt of a task to completion, polling `cancel_requested` on
/// every supervisor cycle. Returns once the process exits, is canceled, or
/// times out.
pub fn run_attempt(spec: &RunSpec, cancel_requested: impl Fn() -> bool) -> io::Result<TaskResult> {
    let mut stdout_log = guarded_open_append(spec.stdout_path, 0o644)?;
    let mut stderr_log = guarded_open_append(spec.stderr_path, 0o644)?;

    let header = format!("===== attempt {} / {} =====\n", spec.attempt, spec.total_attempts);
    stdout_log.write_all(header.as_bytes())?;
    stderr_log.write_all(header.as_bytes())?;

    let started_at = Utc::now();

    let mut command = Command::new(&spec.cmd[0]);
    command.args(&spec.cmd[1..]).current_dir(spec.cwd).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(env) = spec.env {
        for (k, v) in env {
            command.env(k, v);
        }
    }

    let mut child = match command.spawn() {
        Ok(c) => c,
        Err(e) => {
            let _ = writeln!(stderr_log, "failed to start process: {e}");
            let ended_at = Utc::now();
            return Ok(TaskResult {
                exit_code: Some(127),
                timed_out: false,
                canceled: false,
                start_failed: true,
                started_at,
                ended_at,
                duration_sec: (ended_at - started_at).num_milliseconds() as f64 / 1000.0,
            });
        }
    };

    let stdout_pipe = child.stdout.take().expect("piped stdout");
    let stderr_pipe = child.stderr.take().expect("piped stderr");
    let out_handle = spawn_reader(stdout_pipe, stdout_log);
    let err_handle = spawn_reader(stderr_pipe, stderr_log);

    let deadline = spec.timeout_sec.map(|secs| Instant::now() + Duration::from_secs_f64(secs));
    let start = Instant::now();

    let mut timed_out = false;
    let mut canceled = false;

    loop {
        if let Some(status) = child.wait_timeout(POLL_INTERVAL)? {
            let ended_at = Utc::now();
            join_readers(out_handle, err_handle);
            // A timed-out attempt reports no exit code even though the reap
            // above observes the signal-mapped code from the escalated kill;
            // only a cancel legitimately surfaces the process's real exit.
            let exit_code = if timed_out { None } else { exit_code_of(&status) };
            return Ok(TaskResult {
                exit_code,
                timed_out,
                canceled,
                start_failed: false,
                started_at,
                ended_at,
                duration_sec: start.elapsed().as_secs_f64(),
            });
        }

        if cancel_requested() {
            canceled = true;
            terminate_escalating(&mut child)?;
            continue;
        }

        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                timed_out = true;
                terminate_escalating(&mut child)?;
                continue;
            }
        }
    }
}

fn join_readers(out: thread::JoinHandle<io::Result<()>>, err: thread::JoinHandle<io::Result<()>>) {
    let _ = out.join();
    let _ = err.join();
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> Option<i32> {
    status.code()
}

/// Polite terminate, wait up to one second, then kill.
#[cfg(unix)]
fn terminate_escalating(child: &mut Child) -> io::Result<()> {
    let pid = child.id() as i32;
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
    let deadline = Instant::now() + TERMINATE_GRACE;
    loop {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(());
        }
        thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(not(unix))]
fn terminate_escalating(child: &mut Child) -> io::Result<()> {
    let _ = child.kill();
    let _ = child.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn successful_command_reports_exit_zero() {
        let tmp = TempDir::new().unwrap();
        let stdout_path = tmp.path().join("t.out.log");
        let stderr_path = tmp.path().join("t.err.log");
        let spec = RunSpec {
            cmd: &["true".to_string()],
            cwd: tmp.path(),
            env: None,
            timeout_sec: None,
            attempt: 1,
            total_attempts: 1,
            stdout_path: &stdout_path,
            stderr_path: &stderr_path,
        };
        let result = run_attempt(&spec, || false).unwrap();
        assert_eq!(result.exit_code, Some(0));
        assert!(!result.timed_out);
    }

    #[test]
    fn timeout_terminates_long_running_command() {
        let tmp = TempDir::new().unwrap();
        let stdout_path = tmp.path().join("t.out.log");
        let stderr_path = tmp.path().join("t.err.log");
        let spec = RunSpec {
            cmd: &["sleep".to_string(), "5".to_string()],
            cwd: tmp.path(),
            env: None,
            timeout_sec: Some(0.2),
            attempt: 1,
            total_attempts: 1,
            stdout_path: &stdout_path,
            stderr_path: &stderr_path,
        };
        let start = Instant::now();
        let result = run_attempt(&spec, || false).unwrap();
        assert!(result.timed_out);
        assert_eq!(result.exit_code, None);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn missing_binary_reports_start_failed() {
        let tmp = TempDir::new().unwrap();
        let stdout_path = tmp.path().join("t.out.log");
        let stderr_path = tmp.path().join("t.err.log");
        let spec = RunSpec {
            cmd: &["__definitely_not_a_real_binary__".to_string()],
            cwd: tmp.path(),
            env: None,
            timeout_sec: None,
            attempt: 1,
            total_attempts: 1,
            stdout_path: &stdout_path,
            stderr_path: &stderr_path,
        };
        let result = run_attempt(&spec, || false).unwrap();
        assert!(result.start_failed);
        assert_eq!(result.exit_code, Some(127));
    }
}
