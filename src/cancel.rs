//! Cancel sentinel file: `cancel.request` (§4.6).
//!
//! Ported from `orch/exec/cancel.py`.

use std::fs;
use std::io;
use std::path::Path;

use crate::path_guard::{guarded_create, has_symlink_ancestor, is_symlink_path};

/// True iff `<run_dir>/cancel.request` exists, is a regular file, is not a
/// symlink, and has no symlinked ancestor. Fails closed: any of those checks
/// failing means "not asserted" rather than propagating an error, since the
/// caller polls this in a tight loop and a transient stat failure should not
/// crash the engine.
pub fn cancel_requested(path: &Path) -> bool {
    if has_symlink_ancestor(path) || is_symlink_path(path) {
        return false;
    }
    match fs::metadata(path) {
        Ok(meta) => meta.is_file(),
        Err(_) => false,
    }
}

pub fn write_cancel_request(path: &Path) -> io::Result<()> {
    let mut file = guarded_create(path, 0o600)?;
    use std::io::Write;
    file.write_all(b"cancel requested\n")
}

/// Remove the cancel file only when it is a regular, non-symlink path.
pub fn clear_cancel_request(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() || meta.is_dir() {
                return Ok(());
            }
            fs::remove_file(path)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn round_trips_write_check_clear() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("cancel.request");
        assert!(!cancel_requested(&path));
        write_cancel_request(&path).unwrap();
        assert!(cancel_requested(&path));
        clear_cancel_request(&path).unwrap();
        assert!(!cancel_requested(&path));
    }

    #[test]
    fn symlinked_cancel_file_is_not_requested() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real.request");
        fs::write(&real, b"x").unwrap();
        let link = tmp.path().join("cancel.request");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&real, &link).unwrap();
            assert!(!cancel_requested(&link));
        }
    }
}
