//! Temp-then-rename atomic writes with fsync on file and directory (§4.1/§4.2).

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use crate::path_guard::guarded_create;

/// Write `contents` to `path` atomically: write to `<path>.tmp`, fsync the
/// temp file, rename onto `path`, then fsync the containing directory. The
/// temp file is removed on any failure along the way.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => return Err(io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")),
    };

    let result = (|| -> io::Result<()> {
        let mut file = guarded_create(&tmp_path, 0o644)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, path)?;
        fsync_dir(path.parent().unwrap_or_else(|| Path::new(".")))?;
        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(unix)]
fn fsync_dir(dir: &Path) -> io::Result<()> {
    let dir_file = File::open(dir)?;
    dir_file.sync_all()
}

#[cfg(not(unix))]
fn fsync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_leaves_no_tmp_on_success() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        write_atomic(&target, b"{}\n").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"{}\n");
        assert!(!tmp.path().join("state.json.tmp").exists());
    }

    #[test]
    fn atomic_write_rejects_symlinked_tmp() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("state.json");
        let outside = tmp.path().join("outside.txt");
        fs::write(&outside, b"do-not-touch").unwrap();
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&outside, tmp.path().join("state.json.tmp")).unwrap();
            assert!(write_atomic(&target, b"{}\n").is_err());
            assert_eq!(fs::read(&outside).unwrap(), b"do-not-touch");
        }
    }
}
