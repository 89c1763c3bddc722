//! Plan loading and validation (§3/§6: plan YAML schema).
//!
//! Ported from `orch/config/schema.py` and `orch/config/loader.py`. Field
//! parsing follows `serde_yaml` (grounded in `other_examples/5f5422fd_*`,
//! `other_examples/beda0e41_*`), the same declarative-derive style used
//! elsewhere in this crate for its own persisted metadata.

use std::collections::BTreeMap;
use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{OrchError, OrchResult};
use crate::path_guard::{guarded_open_read, has_symlink_ancestor, is_symlink_path};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub goal: Option<String>,
    pub artifacts_dir: Option<String>,
    pub tasks: Vec<TaskSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSpec {
    pub id: String,
    #[serde(deserialize_with = "deserialize_cmd")]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub cwd: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub timeout_sec: Option<f64>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub retry_backoff_sec: Vec<f64>,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawCmd {
    Text(String),
    List(Vec<String>),
}

fn deserialize_cmd<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    match RawCmd::deserialize(deserializer)? {
        RawCmd::Text(s) => split_shell_words(&s).map_err(D::Error::custom),
        RawCmd::List(v) => Ok(v),
    }
}

/// Split a command string by POSIX-shell word rules: whitespace separates
/// words, single quotes suppress all interpretation, double quotes suppress
/// word-splitting but allow backslash-escaping of `"`, `\`, `$`, and `` ` ``,
/// and a bare backslash escapes the following character outside quotes.
///
/// No crate in the example pack offers this narrowly-scoped utility, so this
/// is a deliberate hand-rolled exception (recorded in DESIGN.md).
pub fn split_shell_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars().peekable();

    #[derive(PartialEq)]
    enum Quote {
        None,
        Single,
        Double,
    }
    let mut quote = Quote::None;

    while let Some(c) = chars.next() {
        match quote {
            Quote::None => match c {
                ' ' | '\t' | '\n' => {
                    if in_word {
                        words.push(std::mem::take(&mut current));
                        in_word = false;
                    }
                }
                '\'' => {
                    quote = Quote::Single;
                    in_word = true;
                }
                '"' => {
                    quote = Quote::Double;
                    in_word = true;
                }
                '\\' => match chars.next() {
                    Some(next) => {
                        current.push(next);
                        in_word = true;
                    }
                    None => return Err("trailing backslash in command string".to_string()),
                },
                _ => {
                    current.push(c);
                    in_word = true;
                }
            },
            Quote::Single => {
                if c == '\'' {
                    quote = Quote::None;
                } else {
                    current.push(c);
                }
            }
            Quote::Double => match c {
                '"' => quote = Quote::None,
                '\\' => match chars.peek() {
                    Some('"') | Some('\\') | Some('$') | Some('`') => {
                        current.push(chars.next().unwrap());
                    }
                    _ => current.push('\\'),
                },
                _ => current.push(c),
            },
        }
    }
    if quote != Quote::None {
        return Err("unterminated quote in command string".to_string());
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

/// Load and fully validate a plan YAML file through the path guard.
pub fn load_plan(path: &std::path::Path) -> OrchResult<Plan> {
    if has_symlink_ancestor(path) || is_symlink_path(path) {
        return Err(OrchError::plan(format!("plan path must not be or contain a symlink: {}", path.display())));
    }
    let mut file = guarded_open_read(path).map_err(|e| OrchError::plan(format!("cannot open plan {}: {e}", path.display())))?;
    use std::io::Read;
    let mut text = String::new();
    file.read_to_string(&mut text).map_err(|e| OrchError::plan(format!("cannot read plan {}: {e}", path.display())))?;

    let plan: Plan = serde_yaml::from_str(&text).map_err(|e| OrchError::plan(format!("invalid plan YAML: {e}")))?;
    validate_plan(&plan)?;
    Ok(plan)
}

/// Copy the plan file verbatim into the run directory as `plan.yaml`
/// (`run_plan` always keeps a copy alongside `state.json`).
pub fn copy_plan(src: &std::path::Path, dest: &std::path::Path) -> OrchResult<()> {
    let contents = fs::read(src).map_err(|e| OrchError::plan(format!("cannot read plan {}: {e}", src.display())))?;
    crate::atomic::write_atomic(dest, &contents).map_err(|e| OrchError::plan(format!("cannot copy plan to {}: {e}", dest.display())))?;
    Ok(())
}

pub fn validate_plan(plan: &Plan) -> OrchResult<()> {
    if plan.tasks.is_empty() {
        return Err(OrchError::plan("plan must declare at least one task"));
    }

    let mut seen_lower: BTreeMap<String, &str> = BTreeMap::new();
    for task in &plan.tasks {
        if task.id.trim().is_empty() {
            return Err(OrchError::plan("task id must be a non-empty string"));
        }
        let lower = task.id.to_lowercase();
        if let Some(other) = seen_lower.insert(lower, &task.id) {
            return Err(OrchError::plan(format!("duplicate task id (case-insensitive): {} / {}", other, task.id)));
        }
        if task.cmd.is_empty() || task.cmd.iter().any(|t| t.is_empty()) {
            return Err(OrchError::plan(format!("task {}: cmd must be a non-empty list of non-empty strings", task.id)));
        }
        if let Some(t) = task.timeout_sec {
            if !(t > 0.0) {
                return Err(OrchError::plan(format!("task {}: timeout_sec must be > 0", task.id)));
            }
        }
        if task.retry_backoff_sec.iter().any(|b| *b < 0.0) {
            return Err(OrchError::plan(format!("task {}: retry_backoff_sec entries must be >= 0", task.id)));
        }
    }

    let known: std::collections::BTreeSet<String> = plan.tasks.iter().map(|t| t.id.to_lowercase()).collect();
    for task in &plan.tasks {
        for dep in &task.depends_on {
            if !known.contains(&dep.to_lowercase()) {
                return Err(OrchError::plan(format!("task {}: unknown dependency {}", task.id, dep)));
            }
        }
    }

    crate::dag::assert_acyclic(plan).map_err(OrchError::plan)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_simple_words() {
        assert_eq!(split_shell_words("echo hello world").unwrap(), vec!["echo", "hello", "world"]);
    }

    #[test]
    fn splits_quoted_segments() {
        assert_eq!(split_shell_words("echo 'hello world' foo").unwrap(), vec!["echo", "hello world", "foo"]);
        assert_eq!(split_shell_words(r#"echo "a b" c"#).unwrap(), vec!["echo", "a b", "c"]);
    }

    #[test]
    fn rejects_unterminated_quote() {
        assert!(split_shell_words("echo 'unterminated").is_err());
    }

    fn task(id: &str, deps: &[&str]) -> TaskSpec {
        TaskSpec {
            id: id.to_string(),
            cmd: vec!["true".to_string()],
            depends_on: deps.iter().map(|s| s.to_string()).collect(),
            cwd: None,
            env: None,
            timeout_sec: None,
            retries: 0,
            retry_backoff_sec: vec![],
            outputs: vec![],
        }
    }

    #[test]
    fn rejects_duplicate_case_insensitive_ids() {
        let plan = Plan { goal: None, artifacts_dir: None, tasks: vec![task("A", &[]), task("a", &[])] };
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn rejects_unknown_dependency() {
        let plan = Plan { goal: None, artifacts_dir: None, tasks: vec![task("a", &["missing"])] };
        assert!(validate_plan(&plan).is_err());
    }

    #[test]
    fn accepts_valid_dag() {
        let plan = Plan { goal: None, artifacts_dir: None, tasks: vec![task("a", &[]), task("b", &["a"])] };
        assert!(validate_plan(&plan).is_ok());
    }
}
