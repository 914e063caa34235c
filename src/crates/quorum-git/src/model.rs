//! Types shared across the manager and its callers (§4.D contract).

use quorum_state::{MergeStrategy, TaskId, WorkflowId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeInfo {
    pub task_id: TaskId,
    pub branch: String,
    pub path: String,
    pub base_commit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOption {
    Theirs,
    Ours,
}

impl From<quorum_state::ConflictOption> for ConflictOption {
    fn from(c: quorum_state::ConflictOption) -> Self {
        match c {
            quorum_state::ConflictOption::Theirs => ConflictOption::Theirs,
            quorum_state::ConflictOption::Ours => ConflictOption::Ours,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowGitStatus {
    pub workflow_branch: String,
    pub worktree_root: String,
    pub base_branch: String,
    pub active_task_worktrees: Vec<WorktreeInfo>,
}

/// Result of a merge attempt: `Ok(None)` is a clean merge, `Ok(Some(paths))`
/// lists the conflicting paths left for the caller to resolve or retry with
/// a `ConflictOption`.
pub type MergeOutcome = Result<Option<Vec<String>>, quorum_core::CoreError>;

pub(crate) fn branch_name_for_workflow(id: &WorkflowId) -> String {
    format!("quorum/{id}")
}

pub(crate) fn branch_name_for_task(id: &WorkflowId, task: &TaskId) -> String {
    format!("quorum/{id}/{task}")
}

pub(crate) fn recovery_branch_name(id: &WorkflowId, timestamp: &str) -> String {
    format!("recovery/{id}/{timestamp}")
}
