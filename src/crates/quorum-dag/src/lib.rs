//! DAG Builder & Scheduler (§4.E). Kahn's algorithm over in-degree
//! counters; ties broken by stable insertion order; cycles yield a typed
//! error naming every member of the cycle.
//!
//! `Tasks` is the arena, `TaskId` the index (Design Notes) — this builder
//! never stores owned task data, only ids and the edge list, and hands
//! back orderings the caller uses to index into its own task map.

use quorum_state::TaskId;
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DagError {
    #[error("dependency {0} added before its task was added")]
    UnknownTask(String),
    #[error("cycle detected among tasks: {0:?}")]
    Cycle(Vec<TaskId>),
}

/// Builds and schedules a dependency DAG for one workflow's tasks. Not
/// `Send`/`Sync` by design — the DAG builder is single-threaded per
/// workflow (§5 Shared resources).
#[derive(Debug, Default)]
pub struct DagBuilder {
    order: Vec<TaskId>,
    edges: HashMap<TaskId, Vec<TaskId>>,
}

impl DagBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task. Idempotent: adding the same id twice is a no-op.
    pub fn add_task(&mut self, id: TaskId) {
        if !self.edges.contains_key(&id) {
            self.order.push(id.clone());
            self.edges.insert(id, Vec::new());
        }
    }

    /// `to` depends on `from`: `from` must complete before `to` runs.
    pub fn add_dependency(&mut self, from: TaskId, to: TaskId) -> Result<(), DagError> {
        if !self.edges.contains_key(&from) {
            return Err(DagError::UnknownTask(from.0));
        }
        if !self.edges.contains_key(&to) {
            return Err(DagError::UnknownTask(to.0));
        }
        self.edges.get_mut(&from).unwrap().push(to);
        Ok(())
    }

    /// Kahn's algorithm: repeatedly peel off zero-in-degree nodes in
    /// insertion order. If nodes remain once no more have in-degree zero,
    /// every remaining node is part of (or downstream of) a cycle.
    pub fn build(&self) -> Result<Vec<TaskId>, DagError> {
        let mut in_degree: HashMap<TaskId, usize> =
            self.order.iter().map(|id| (id.clone(), 0)).collect();
        for targets in self.edges.values() {
            for t in targets {
                *in_degree.get_mut(t).unwrap() += 1;
            }
        }

        let mut ready: VecDeque<TaskId> = self
            .order
            .iter()
            .filter(|id| in_degree[*id] == 0)
            .cloned()
            .collect();

        let mut result = Vec::with_capacity(self.order.len());
        let mut remaining = in_degree.clone();

        while let Some(id) = ready.pop_front() {
            result.push(id.clone());
            if let Some(targets) = self.edges.get(&id) {
                for t in targets {
                    let entry = remaining.get_mut(t).unwrap();
                    *entry -= 1;
                    if *entry == 0 {
                        ready.push_back(t.clone());
                    }
                }
            }
        }

        if result.len() != self.order.len() {
            let done: HashSet<&TaskId> = result.iter().collect();
            let cycle_members: Vec<TaskId> = self
                .order
                .iter()
                .filter(|id| !done.contains(id))
                .cloned()
                .collect();
            return Err(DagError::Cycle(cycle_members));
        }

        Ok(result)
    }

    /// Every task whose dependencies are all in `completed` and which is
    /// not itself in `completed` — the Executor drains this into a bounded
    /// worker pool.
    pub fn ready_set(&self, completed: &HashSet<TaskId>) -> Vec<TaskId> {
        self.order
            .iter()
            .filter(|id| !completed.contains(*id))
            .filter(|id| {
                self.dependencies_of(id)
                    .iter()
                    .all(|dep| completed.contains(dep))
            })
            .cloned()
            .collect()
    }

    fn dependencies_of(&self, id: &TaskId) -> Vec<TaskId> {
        self.edges
            .iter()
            .filter_map(|(from, targets)| targets.contains(id).then(|| from.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tid(s: &str) -> TaskId {
        TaskId(s.to_string())
    }

    #[test]
    fn linear_chain_topologically_sorted() {
        let mut dag = DagBuilder::new();
        dag.add_task(tid("a"));
        dag.add_task(tid("b"));
        dag.add_task(tid("c"));
        dag.add_dependency(tid("a"), tid("b")).unwrap();
        dag.add_dependency(tid("b"), tid("c")).unwrap();
        assert_eq!(dag.build().unwrap(), vec![tid("a"), tid("b"), tid("c")]);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut dag = DagBuilder::new();
        dag.add_task(tid("z"));
        dag.add_task(tid("a"));
        dag.add_task(tid("m"));
        // no dependencies among them: insertion order must be preserved
        assert_eq!(dag.build().unwrap(), vec![tid("z"), tid("a"), tid("m")]);
    }

    #[test]
    fn two_cycle_is_detected() {
        let mut dag = DagBuilder::new();
        dag.add_task(tid("a"));
        dag.add_task(tid("b"));
        dag.add_dependency(tid("a"), tid("b")).unwrap();
        dag.add_dependency(tid("b"), tid("a")).unwrap();
        match dag.build().unwrap_err() {
            DagError::Cycle(members) => {
                assert_eq!(members.len(), 2);
                assert!(members.contains(&tid("a")));
                assert!(members.contains(&tid("b")));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn three_cycle_is_detected() {
        let mut dag = DagBuilder::new();
        for t in ["a", "b", "c"] {
            dag.add_task(tid(t));
        }
        dag.add_dependency(tid("a"), tid("b")).unwrap();
        dag.add_dependency(tid("b"), tid("c")).unwrap();
        dag.add_dependency(tid("c"), tid("a")).unwrap();
        assert!(matches!(dag.build().unwrap_err(), DagError::Cycle(m) if m.len() == 3));
    }

    #[test]
    fn n_cycle_is_detected() {
        let mut dag = DagBuilder::new();
        let n = 6;
        for i in 0..n {
            dag.add_task(tid(&format!("t{i}")));
        }
        for i in 0..n {
            dag.add_dependency(tid(&format!("t{i}")), tid(&format!("t{}", (i + 1) % n))).unwrap();
        }
        assert!(matches!(dag.build().unwrap_err(), DagError::Cycle(m) if m.len() == n));
    }

    #[test]
    fn ready_set_respects_dependencies() {
        let mut dag = DagBuilder::new();
        dag.add_task(tid("a"));
        dag.add_task(tid("b"));
        dag.add_task(tid("c"));
        dag.add_dependency(tid("a"), tid("b")).unwrap();
        dag.add_dependency(tid("a"), tid("c")).unwrap();

        let completed = HashSet::new();
        assert_eq!(dag.ready_set(&completed), vec![tid("a")]);

        let mut completed = HashSet::new();
        completed.insert(tid("a"));
        let mut ready = dag.ready_set(&completed);
        ready.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(ready, vec![tid("b"), tid("c")]);
    }

    #[test]
    fn dependency_on_unknown_task_errors() {
        let mut dag = DagBuilder::new();
        dag.add_task(tid("a"));
        let err = dag.add_dependency(tid("a"), tid("ghost")).unwrap_err();
        assert!(matches!(err, DagError::UnknownTask(_)));
    }
}
