//! Git Isolation Manager (§4.D): workflow-level branch plus per-task
//! worktrees with serializable merge strategies and rollback.

pub mod github;
pub mod manager;
pub mod model;

pub use github::{GitHubClient, PullRequest};
pub use manager::GitIsolationManager;
pub use model::{ConflictOption, MergeOutcome, WorkflowGitStatus, WorktreeInfo};

#[cfg(test)]
mod tests {
    use super::*;
    use git2::{Repository, Signature};
    use quorum_state::{TaskId, WorkflowId};
    use tempfile::TempDir;

    fn init_repo() -> (TempDir, TempDir) {
        let repo_dir = TempDir::new().unwrap();
        let worktree_dir = TempDir::new().unwrap();
        let repo = Repository::init(repo_dir.path()).unwrap();
        let sig = Signature::now("Test", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[]).unwrap();

        // git2 requires a branch name to exist for `find_branch`; ensure main.
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let _ = repo.branch("main", &head, false);
        (repo_dir, worktree_dir)
    }

    #[test]
    fn initialize_workflow_creates_branch_and_worktree() {
        let (repo_dir, worktree_dir) = init_repo();
        let manager = GitIsolationManager::open(repo_dir.path(), worktree_dir.path(), false, true).unwrap();
        let workflow_id = WorkflowId("wf-test-1".to_string());

        let (branch, path) = manager.initialize_workflow(&workflow_id, "main").unwrap();
        assert_eq!(branch, "quorum/wf-test-1");
        assert!(std::path::Path::new(&path).exists());
    }

    #[test]
    fn create_task_worktree_branches_off_workflow() {
        let (repo_dir, worktree_dir) = init_repo();
        let manager = GitIsolationManager::open(repo_dir.path(), worktree_dir.path(), false, true).unwrap();
        let workflow_id = WorkflowId("wf-test-2".to_string());
        manager.initialize_workflow(&workflow_id, "main").unwrap();

        let task_id = TaskId("task-a".to_string());
        let info = manager.create_task_worktree(&workflow_id, &task_id).unwrap();
        assert_eq!(info.branch, "quorum/wf-test-2/task-a");
        assert!(std::path::Path::new(&info.path).exists());
    }

    #[test]
    fn dry_run_never_touches_disk() {
        let (repo_dir, worktree_dir) = init_repo();
        let manager = GitIsolationManager::open(repo_dir.path(), worktree_dir.path(), true, true).unwrap();
        let workflow_id = WorkflowId("wf-test-3".to_string());

        let (_, path) = manager.initialize_workflow(&workflow_id, "main").unwrap();
        assert!(!std::path::Path::new(&path).exists());
    }

    #[test]
    fn list_active_workflows_finds_quorum_branches() {
        let (repo_dir, worktree_dir) = init_repo();
        let manager = GitIsolationManager::open(repo_dir.path(), worktree_dir.path(), false, true).unwrap();
        let workflow_id = WorkflowId("wf-test-4".to_string());
        manager.initialize_workflow(&workflow_id, "main").unwrap();

        let active = manager.list_active_workflows().unwrap();
        assert!(active.contains(&workflow_id));
    }
}
