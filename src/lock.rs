//! File-based exclusive advisory lock with staleness recovery (§4.3).
//!
//! Ported from `orch/state/lock.py`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{OrchError, OrchResult};
use crate::path_guard::file_identity;

pub struct RunLock {
    path: PathBuf,
    file: File,
    identity: (u64, u64),
}

impl RunLock {
    /// Release the lock. Equivalent to dropping it; spelled out for callers
    /// that want the release point to be explicit in the run flow.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for RunLock {
    /// Unlink the lock file only if it still carries the inode+device we
    /// created, guarding against a race where another process reclaimed a
    /// stale lock in between.
    fn drop(&mut self) {
        if let Ok(meta) = fs::symlink_metadata(&self.path) {
            if !meta.file_type().is_symlink() {
                if let Ok(current) = File::open(&self.path).and_then(|f| file_identity(&f)) {
                    if current == self.identity {
                        let _ = fs::remove_file(&self.path);
                    }
                }
            }
        }
    }
}

fn try_create(path: &Path) -> io::Result<File> {
    let mut opts = OpenOptions::new();
    opts.create_new(true).write(true);
    #[cfg(unix)]
    opts.mode(0o644);
    opts.open(path)
}

fn is_stale(path: &Path, stale_sec: u64) -> bool {
    match fs::metadata(path) {
        Ok(meta) => match meta.modified() {
            Ok(modified) => match SystemTime::now().duration_since(modified) {
                Ok(age) => age > Duration::from_secs(stale_sec),
                Err(_) => false,
            },
            Err(_) => false,
        },
        Err(_) => false,
    }
}

/// Acquire the run lock at `<run_dir>/.lock`. Retries up to `retries`
/// times at `retry_interval` when the lock is held and not stale; an
/// existing lock older than `stale_sec` is reclaimed immediately.
pub fn run_lock(path: &Path, stale_sec: u64, retries: u32, retry_interval: Duration) -> OrchResult<RunLock> {
    let mut attempt = 0u32;
    loop {
        match try_create(path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                let _ = file.sync_all();
                let identity = file_identity(&file).map_err(OrchError::from)?;
                return Ok(RunLock { path: path.to_path_buf(), file, identity });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if is_stale(path, stale_sec) {
                    let _ = fs::remove_file(path);
                    continue;
                }
                if attempt >= retries {
                    return Err(OrchError::run_conflict(format!("run lock held: {}", path.display())));
                }
                attempt += 1;
                thread::sleep(retry_interval);
            }
            Err(e) => return Err(OrchError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_then_release_allows_reacquire() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".lock");
        let lock = run_lock(&path, 3600, 0, Duration::from_millis(1)).unwrap();
        assert!(path.exists());
        lock.release();
        assert!(!path.exists());
        let lock2 = run_lock(&path, 3600, 0, Duration::from_millis(1)).unwrap();
        lock2.release();
    }

    #[test]
    fn second_acquire_fails_without_staleness() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".lock");
        let _lock = run_lock(&path, 3600, 0, Duration::from_millis(1)).unwrap();
        let result = run_lock(&path, 3600, 1, Duration::from_millis(1));
        assert!(result.is_err());
    }
}
