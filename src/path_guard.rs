//! Symlink refusal and FD-first stat-then-use discipline (design §4.1).
//!
//! Ported from `orch/util/path_guard.py` and `orch/exec/capture.py`: every
//! security-sensitive path touch in this crate goes through one of the
//! helpers here instead of calling `std::fs` directly.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

/// Walk the parent chain via `lstat`, failing *closed* (treating the path as
/// unsafe) on any stat error other than "does not exist".
pub fn has_symlink_ancestor(path: &Path) -> bool {
    let mut current = match path.parent() {
        Some(p) => p,
        None => return false,
    };
    loop {
        match fs::symlink_metadata(current) {
            Ok(meta) => {
                if meta.file_type().is_symlink() {
                    return true;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(_) => return true,
        }
        match current.parent() {
            Some(p) if p != current => current = p,
            _ => return false,
        }
    }
}

/// Whether `path` itself is a symlink. Fails closed (returns `true`) on a
/// stat error other than "does not exist".
pub fn is_symlink_path(path: &Path) -> bool {
    match fs::symlink_metadata(path) {
        Ok(meta) => meta.file_type().is_symlink(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(_) => true,
    }
}

#[cfg(unix)]
fn nofollow_nonblock() -> i32 {
    libc::O_NOFOLLOW | libc::O_NONBLOCK
}

/// Open an existing regular file read-only through the path guard:
/// `O_NOFOLLOW|O_NONBLOCK`, then re-check via `fstat` that the opened
/// descriptor really points at a regular file.
pub fn guarded_open_read(path: &Path) -> io::Result<File> {
    if has_symlink_ancestor(path) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must not include symlink component"));
    }
    let mut opts = OpenOptions::new();
    opts.read(true);
    #[cfg(unix)]
    opts.custom_flags(nofollow_nonblock());
    let file = opts.open(path).map_err(map_eloop)?;
    assert_regular_file(&file)?;
    Ok(file)
}

/// Open (creating if absent) a regular file for appending through the path
/// guard, used by the process runner's log streaming.
pub fn guarded_open_append(path: &Path, mode: u32) -> io::Result<File> {
    if has_symlink_ancestor(path) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must not include symlink component"));
    }
    if is_symlink_path(path) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must not be symlink"));
    }
    let mut opts = OpenOptions::new();
    opts.create(true).append(true);
    #[cfg(unix)]
    {
        opts.custom_flags(nofollow_nonblock());
        opts.mode(mode);
    }
    let file = opts.open(path).map_err(map_eloop)?;
    assert_regular_file(&file)?;
    Ok(file)
}

/// Open (create, truncate) a regular file for writing through the path
/// guard, used for `state.json.tmp` and similar single-shot writes.
pub fn guarded_create(path: &Path, mode: u32) -> io::Result<File> {
    if has_symlink_ancestor(path) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must not include symlink component"));
    }
    if is_symlink_path(path) {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must not be symlink"));
    }
    let mut opts = OpenOptions::new();
    opts.create(true).write(true).truncate(true);
    #[cfg(unix)]
    {
        opts.custom_flags(nofollow_nonblock());
        opts.mode(mode);
    }
    let file = opts.open(path).map_err(map_eloop)?;
    assert_regular_file(&file)?;
    Ok(file)
}

fn assert_regular_file(file: &File) -> io::Result<()> {
    let meta = file.metadata()?;
    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "path must be regular file"));
    }
    Ok(())
}

#[cfg(unix)]
fn map_eloop(err: io::Error) -> io::Error {
    if err.raw_os_error() == Some(libc::ELOOP) {
        io::Error::new(io::ErrorKind::InvalidInput, "path must not be symlink")
    } else {
        err
    }
}

#[cfg(not(unix))]
fn map_eloop(err: io::Error) -> io::Error {
    err
}

/// Device+inode identity of an open file, used by the run lock to decide
/// whether the on-disk lock file is still the one this process created.
#[cfg(unix)]
pub fn file_identity(file: &File) -> io::Result<(u64, u64)> {
    let meta = file.metadata()?;
    Ok((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
pub fn file_identity(_file: &File) -> io::Result<(u64, u64)> {
    Ok((0, 0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn detects_symlink_ancestor() {
        let tmp = TempDir::new().unwrap();
        let real_dir = tmp.path().join("real");
        fs::create_dir(&real_dir).unwrap();
        let link_dir = tmp.path().join("link");
        #[cfg(unix)]
        std::os::unix::fs::symlink(&real_dir, &link_dir).unwrap();
        #[cfg(unix)]
        {
            let victim = link_dir.join("file.txt");
            assert!(has_symlink_ancestor(&victim));
        }
    }

    #[test]
    fn no_symlink_ancestor_for_plain_path() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain.txt");
        assert!(!has_symlink_ancestor(&file));
    }

    #[test]
    fn guarded_open_read_rejects_symlink_target() {
        let tmp = TempDir::new().unwrap();
        let real = tmp.path().join("real.txt");
        fs::write(&real, b"hi").unwrap();
        let link = tmp.path().join("link.txt");
        #[cfg(unix)]
        {
            std::os::unix::fs::symlink(&real, &link).unwrap();
            assert!(guarded_open_read(&link).is_err());
        }
    }
}
