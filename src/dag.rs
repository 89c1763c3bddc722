//! DAG adjacency, topological order, and cycle detection (§4.4).
//!
//! Ported from `orch/dag/build.py` and `orch/dag/validate.py`.

use std::collections::{BTreeMap, VecDeque};

use crate::plan::Plan;

/// `dependents[id]` lists the tasks that depend on `id`; `in_degree[id]` is
/// the number of dependencies `id` itself has. Keys are the task ids exactly
/// as declared (not lowercased) since within one plan ids are already unique
/// case-insensitively by the time this runs.
pub struct Adjacency {
    pub dependents: BTreeMap<String, Vec<String>>,
    pub in_degree: BTreeMap<String, usize>,
}

pub fn build_adjacency(plan: &Plan) -> Adjacency {
    let mut dependents: BTreeMap<String, Vec<String>> = plan.tasks.iter().map(|t| (t.id.clone(), Vec::new())).collect();
    let mut in_degree: BTreeMap<String, usize> = plan.tasks.iter().map(|t| (t.id.clone(), 0)).collect();

    for task in &plan.tasks {
        *in_degree.get_mut(&task.id).unwrap() = task.depends_on.len();
        for dep in &task.depends_on {
            if let Some(list) = dependents.get_mut(dep) {
                list.push(task.id.clone());
            }
        }
    }

    Adjacency { dependents, in_degree }
}

/// Kahn BFS topological sort. Does not mutate the adjacency passed in; if
/// fewer nodes are emitted than exist, the plan has a cycle.
pub fn topological_order(adj: &Adjacency) -> Option<Vec<String>> {
    let mut in_degree = adj.in_degree.clone();
    let mut queue: VecDeque<String> = in_degree.iter().filter(|(_, d)| **d == 0).map(|(id, _)| id.clone()).collect();
    let mut order = Vec::with_capacity(in_degree.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());
        if let Some(children) = adj.dependents.get(&id) {
            for child in children {
                let degree = in_degree.get_mut(child).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(child.clone());
                }
            }
        }
    }

    if order.len() == in_degree.len() {
        Some(order)
    } else {
        None
    }
}

/// Validate a plan is acyclic, returning a human-readable error otherwise.
pub fn assert_acyclic(plan: &Plan) -> Result<Vec<String>, String> {
    let adj = build_adjacency(plan);
    topological_order(&adj).ok_or_else(|| "plan contains a dependency cycle".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::TaskSpec;

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
    fn orders_diamond_with_a_first_and_d_last() {
        let plan = Plan {
            goal: None,
            artifacts_dir: None,
            tasks: vec![task("a", &[]), task("b", &["a"]), task("c", &["a"]), task("d", &["b", "c"])],
        };
        let order = assert_acyclic(&plan).unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
    }

    #[test]
    fn detects_cycle() {
        let plan = Plan { goal: None, artifacts_dir: None, tasks: vec![task("a", &["b"]), task("b", &["a"])] };
        assert!(assert_acyclic(&plan).is_err());
    }

    #[test]
    fn does_not_mutate_input_in_degree() {
        let plan = Plan { goal: None, artifacts_dir: None, tasks: vec![task("a", &[]), task("b", &["a"])] };
        let adj = build_adjacency(&plan);
        let before = adj.in_degree.clone();
        let _ = topological_order(&adj);
        assert_eq!(adj.in_degree, before);
    }
}
