//! Artifact glob matching, path sanitization, and copy (§4.7).
//!
//! Ported from `orch/exec/runner.py::_artifact_relative_path` and
//! `_iter_output_matches` / `_copy_to_aggregate_dir`. `glob` is grounded in
//! `other_examples/a8a19348_*` and `other_examples/9daf820c_*`.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Match a single output pattern against the filesystem: absolute patterns
/// glob globally, relative patterns glob under `cwd`.
pub fn match_outputs(cwd: &Path, pattern: &str) -> Vec<PathBuf> {
    let full_pattern = if Path::new(pattern).is_absolute() { pattern.to_string() } else { cwd.join(pattern).to_string_lossy().into_owned() };

    match glob::glob(&full_pattern) {
        Ok(paths) => paths
            .filter_map(|r| r.ok())
            .filter(|p| p.is_file())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Sanitize a matched path into a destination relative to
/// `artifacts/<task_id>/`: anchors and `.` components are dropped, `..`
/// becomes `__up__`, `:` becomes `_`. A wholly-absolute pattern match lands
/// under `__abs__/…`; a match that escapes `cwd` lands under `__external__/…`.
pub fn sanitize_relative(matched: &Path, cwd: &Path) -> PathBuf {
    if matched.is_absolute() {
        if let Ok(rel) = matched.strip_prefix(cwd) {
            if !rel.components().any(|c| matches!(c, Component::ParentDir)) {
                return sanitize_components(rel);
            }
        }
        let mut out = PathBuf::from("__abs__");
        out.push(sanitize_components(strip_root(matched)));
        return out;
    }

    if matched.components().any(|c| matches!(c, Component::ParentDir)) {
        let mut out = PathBuf::from("__external__");
        out.push(sanitize_components(matched));
        return out;
    }

    sanitize_components(matched)
}

fn strip_root(path: &Path) -> PathBuf {
    path.components().filter(|c| matches!(c, Component::Normal(_))).collect()
}

fn sanitize_components(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(seg) => {
                let seg = seg.to_string_lossy().replace(':', "_");
                out.push(seg);
            }
            Component::ParentDir => out.push("__up__"),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    out
}

/// Copy every matched output for one task into `<run_dir>/artifacts/<task_id>/…`
/// and, when `artifacts_dir` is set, best-effort into
/// `<artifacts_dir>/<task_id>/…` as well. Returns the sorted, de-duplicated
/// (case-insensitive) list of run-dir-relative destinations recorded on the
/// task state.
pub fn collect_artifacts(run_dir: &Path, task_id: &str, cwd: &Path, outputs: &[String], artifacts_dir: Option<&Path>) -> Vec<String> {
    let task_dir = run_dir.join("artifacts").join(task_id);
    let mut seen_lower = BTreeSet::new();
    let mut recorded = Vec::new();

    for pattern in outputs {
        for matched in match_outputs(cwd, pattern) {
            let sanitized = sanitize_relative(&matched, cwd);
            let dest = task_dir.join(&sanitized);
            if let Some(parent) = dest.parent() {
                if fs::create_dir_all(parent).is_err() {
                    continue;
                }
            }
            if fs::copy(&matched, &dest).is_err() {
                continue;
            }

            if let Some(agg) = artifacts_dir {
                let agg_dest = agg.join(task_id).join(&sanitized);
                if let Some(parent) = agg_dest.parent() {
                    let _ = fs::create_dir_all(parent);
                }
                let _ = fs::copy(&matched, &agg_dest);
            }

            let relpath = format!("artifacts/{task_id}/{}", sanitized.to_string_lossy());
            let key = relpath.to_lowercase();
            if seen_lower.insert(key) {
                recorded.push(relpath);
            }
        }
    }

    recorded.sort();
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitizes_parent_and_colon() {
        let cwd = Path::new("/work");
        let out = sanitize_relative(Path::new("sub/../file:name.txt"), cwd);
        assert_eq!(out, PathBuf::from("__up__").join("file_name.txt"));
    }

    #[test]
    fn plain_relative_path_is_unchanged() {
        let cwd = Path::new("/work");
        let out = sanitize_relative(Path::new("out/sub/a.txt"), cwd);
        assert_eq!(out, PathBuf::from("out/sub/a.txt"));
    }

    #[test]
    fn collects_nested_outputs_sorted() {
        let tmp = TempDir::new().unwrap();
        let cwd = tmp.path().join("work");
        fs::create_dir_all(cwd.join("out/sub")).unwrap();
        fs::write(cwd.join("out/b.txt"), b"b").unwrap();
        fs::write(cwd.join("out/sub/a.txt"), b"a").unwrap();

        let run_dir = tmp.path().join("run");
        fs::create_dir_all(run_dir.join("artifacts")).unwrap();

        let recorded = collect_artifacts(&run_dir, "publish", &cwd, &["out/**/*.txt".to_string()], None);
        assert_eq!(recorded, vec!["artifacts/publish/out/b.txt".to_string(), "artifacts/publish/out/sub/a.txt".to_string()]);
    }
}
