//! Run directory layout and id generation (§6: `<home>/runs/<run_id>/…`).
//!
//! Ported from `orch/util/paths.py` and `orch/util/ids.py`.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use rand::Rng;

use crate::path_guard::{has_symlink_ancestor, is_symlink_path};

/// Generate a run id in `YYYYMMDD_HHMMSS_xxxxxx` format (6 lowercase hex
/// digits), matching `orch/util/ids.py::new_run_id`.
pub fn new_run_id(now: DateTime<Local>) -> String {
    let suffix: u32 = rand::thread_rng().gen_range(0..0x100_0000);
    format!("{}_{:06x}", now.format("%Y%m%d_%H%M%S"), suffix)
}

pub fn run_dir(home: &Path, run_id: &str) -> PathBuf {
    home.join("runs").join(run_id)
}

pub fn runs_root(home: &Path) -> PathBuf {
    home.join("runs")
}

fn ensure_directory(path: &Path) -> io::Result<()> {
    if has_symlink_ancestor(path) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path must not include symlink: {}", path.display()),
        ));
    }
    if is_symlink_path(path) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path must not be symlink: {}", path.display()),
        ));
    }
    fs::create_dir_all(path)?;
    let meta = fs::symlink_metadata(path)?;
    if !meta.is_dir() || meta.file_type().is_symlink() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path must be directory: {}", path.display()),
        ));
    }
    Ok(())
}

/// Ensure every directory the run layout needs exists: the run dir itself,
/// `logs/`, `artifacts/`, `report/`.
pub fn ensure_run_layout(run_dir: &Path) -> io::Result<()> {
    ensure_directory(run_dir)?;
    ensure_directory(&run_dir.join("logs"))?;
    ensure_directory(&run_dir.join("artifacts"))?;
    ensure_directory(&run_dir.join("report"))?;
    Ok(())
}

pub fn state_path(run_dir: &Path) -> PathBuf {
    run_dir.join("state.json")
}

pub fn plan_copy_path(run_dir: &Path) -> PathBuf {
    run_dir.join("plan.yaml")
}

pub fn lock_path(run_dir: &Path) -> PathBuf {
    run_dir.join(".lock")
}

pub fn cancel_request_path(run_dir: &Path) -> PathBuf {
    run_dir.join("cancel.request")
}

pub fn report_path(run_dir: &Path) -> PathBuf {
    run_dir.join("report").join("final_report.md")
}

pub fn task_log_paths(run_dir: &Path, task_id: &str) -> (PathBuf, PathBuf) {
    let logs = run_dir.join("logs");
    (logs.join(format!("{task_id}.out.log")), logs.join(format!("{task_id}.err.log")))
}

/// A run directory "exists" for CLI purposes if it is a directory that
/// carries either persisted state or a copied plan (`cli.py::_run_exists`).
pub fn run_exists(run_dir: &Path) -> bool {
    run_dir.is_dir() && (state_path(run_dir).exists() || plan_copy_path(run_dir).exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn run_id_has_expected_shape() {
        let now = Local.with_ymd_and_hms(2026, 7, 26, 10, 30, 0).unwrap();
        let id = new_run_id(now);
        assert_eq!(id.len(), "20260726_103000_".len() + 6);
        assert!(id.starts_with("20260726_103000_"));
    }

    #[test]
    fn ensure_run_layout_creates_all_dirs() {
        let tmp = TempDir::new().unwrap();
        let rd = tmp.path().join("runs").join("r1");
        ensure_run_layout(&rd).unwrap();
        assert!(rd.join("logs").is_dir());
        assert!(rd.join("artifacts").is_dir());
        assert!(rd.join("report").is_dir());
    }

    #[test]
    fn run_exists_requires_state_or_plan() {
        let tmp = TempDir::new().unwrap();
        let rd = tmp.path().join("runs").join("r2");
        ensure_run_layout(&rd).unwrap();
        assert!(!run_exists(&rd));
        fs::write(state_path(&rd), b"{}").unwrap();
        assert!(run_exists(&rd));
    }
}
