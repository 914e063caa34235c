//! Recovery Manager (§4.H): finds workflows abandoned by a process that
//! died mid-run and returns them to a resumable state. Generalized from
//! `orca::health::HealthChecker`'s "collect checks, report overall status"
//! shape: here the checks are zombie workflows, and recovering each is the
//! side effect instead of a read-only report.

use chrono::Utc;
use quorum_bus::{Event, EventBus};
use quorum_core::Result;
use quorum_git::GitIsolationManager;
use quorum_state::{Checkpoint, StateManager, TaskStatus, WorkflowId, WorkflowStatus};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct RecoveryManager {
    state_manager: Arc<dyn StateManager>,
    git: Arc<tokio::sync::Mutex<GitIsolationManager>>,
    bus: Arc<EventBus>,
    stale_threshold: chrono::Duration,
}

/// One workflow's recovery outcome, for logging/reporting at startup.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub workflow_id: WorkflowId,
    pub reset_tasks: usize,
    pub stashed_worktrees: usize,
}

impl RecoveryManager {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        git: Arc<tokio::sync::Mutex<GitIsolationManager>>,
        bus: Arc<EventBus>,
        stale_threshold: chrono::Duration,
    ) -> Self {
        Self { state_manager, git, bus, stale_threshold }
    }

    /// Scans for zombie workflows and recovers each in turn (§8 S3). Errors
    /// recovering one workflow are logged and skipped rather than aborting
    /// the whole scan — a stuck workflow shouldn't block every other one
    /// from being recovered.
    pub async fn scan_and_recover(&self, cancel: &CancellationToken) -> Result<Vec<RecoveryReport>> {
        let zombies = self.state_manager.find_zombie_workflows(self.stale_threshold, cancel).await?;
        let mut reports = Vec::with_capacity(zombies.len());
        for zombie in zombies {
            match self.recover_one(&zombie.workflow_id, cancel).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(workflow_id = %zombie.workflow_id, error = %e, "failed to recover zombie workflow"),
            }
        }
        Ok(reports)
    }

    async fn recover_one(&self, workflow_id: &WorkflowId, cancel: &CancellationToken) -> Result<RecoveryReport> {
        let mut state = self
            .state_manager
            .load(workflow_id, cancel)
            .await?
            .ok_or_else(|| quorum_core::CoreError::internal(format!("zombie workflow {workflow_id} vanished before recovery")))?;

        let mut reset_tasks = 0;
        let mut stashed_worktrees = 0;
        let timestamp = Utc::now().format("%Y%m%d%H%M%S").to_string();

        let running_worktrees: Vec<String> =
            state.tasks.values().filter(|t| t.status == TaskStatus::Running).filter_map(|t| t.worktree_path.clone()).collect();

        {
            let git = self.git.lock().await;
            for worktree_path in &running_worktrees {
                if let Err(e) = git.abort_in_progress(worktree_path) {
                    warn!(workflow_id = %workflow_id, worktree = %worktree_path, error = %e, "failed to abort in-progress merge/rebase");
                }
                match git.stash_to_recovery_branch(workflow_id, worktree_path, &timestamp) {
                    Ok(branch) => {
                        stashed_worktrees += 1;
                        info!(workflow_id = %workflow_id, worktree = %worktree_path, recovery_branch = %branch, "stashed abandoned worktree");
                    }
                    Err(e) => warn!(workflow_id = %workflow_id, worktree = %worktree_path, error = %e, "failed to stash abandoned worktree"),
                }
            }
        }

        for task in state.tasks.values_mut() {
            if task.status == TaskStatus::Running {
                task.reset_to_pending();
                reset_tasks += 1;
            }
        }

        state.status = WorkflowStatus::Paused;
        state.push_checkpoint(Checkpoint {
            id: format!("recovery-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            checkpoint_type: "recovery".to_string(),
            phase: state.current_phase,
            timestamp: Utc::now(),
            data: Vec::new(),
        });

        self.state_manager.save(&state, cancel).await?;
        self.state_manager.clear_workflow_running(workflow_id, cancel).await?;

        let _ = self
            .bus
            .publish(Event::WorkflowPaused { workflow_id: workflow_id.0.clone(), project_id: None, timestamp: Utc::now() })
            .await;

        Ok(RecoveryReport { workflow_id: workflow_id.clone(), reset_tasks, stashed_worktrees })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_bus::EventBus;
    use quorum_state::{Blueprint, FileStateManager, TaskId, TaskState, WorkflowState};
    use tempfile::TempDir;

    fn init_git_repo(dir: &TempDir) {
        let repo = git2::Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
    }

    #[tokio::test]
    async fn recovers_zombie_workflow_resetting_running_tasks() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let worktree = TempDir::new().unwrap();
        init_git_repo(&repo);

        let state_manager: Arc<dyn StateManager> = Arc::new(FileStateManager::new(root.path()));
        let git = Arc::new(tokio::sync::Mutex::new(GitIsolationManager::open(repo.path(), worktree.path(), true, true).unwrap()));
        let bus = Arc::new(EventBus::new(16));
        let cancel = CancellationToken::new();

        let workflow_id = WorkflowId("wf-zombie".to_string());
        let mut state = WorkflowState::new(workflow_id.clone(), "do something", Blueprint::default());
        state.status = WorkflowStatus::Running;
        state.heartbeat_at = Some(Utc::now() - chrono::Duration::minutes(10));
        let mut task = TaskState::new(TaskId("t1".to_string()), "t1", "desc", "claude");
        task.status = TaskStatus::Running;
        state.tasks.insert(TaskId("t1".to_string()), task);
        state_manager.save(&state, &cancel).await.unwrap();
        state_manager.set_workflow_running(&workflow_id, &cancel).await.unwrap();

        let manager = RecoveryManager::new(state_manager.clone(), git, bus, chrono::Duration::minutes(5));
        let reports = manager.scan_and_recover(&cancel).await.unwrap();

        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reset_tasks, 1);

        let recovered = state_manager.load(&workflow_id, &cancel).await.unwrap().unwrap();
        assert_eq!(recovered.status, WorkflowStatus::Paused);
        assert_eq!(recovered.tasks[&TaskId("t1".to_string())].status, TaskStatus::Pending);
        assert!(recovered.latest_checkpoint("recovery").is_some());

        let running = state_manager.list_running_workflows(&cancel).await.unwrap();
        assert!(running.is_empty());
    }
}
