//! `StateManager` contract (§4.B). One async trait; the backend is
//! pluggable (file+journal or embedded key/value store) behind it — the
//! contract is identical either way. Grounded on
//! `langgraph_checkpoint::traits::CheckpointSaver`'s pluggable-storage
//! trait idiom, generalized from per-thread checkpoints to whole
//! `WorkflowState` documents with locks and heartbeats.

use crate::lock::LockHandle;
use crate::model::{Checkpoint, WorkflowId, WorkflowState};
use async_trait::async_trait;
use quorum_core::CoreError;
use tokio_util::sync::CancellationToken;

/// Summary row returned by `ListWorkflows`/`ListRunningWorkflows` — avoids
/// forcing callers to deserialize full state just to list ids/status.
#[derive(Debug, Clone)]
pub struct WorkflowSummary {
    pub workflow_id: WorkflowId,
    pub status: crate::model::WorkflowStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    pub heartbeat_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[async_trait]
pub trait StateManager: Send + Sync {
    async fn save(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<(), CoreError>;

    /// Loads the active (most recently saved) state for a workflow.
    async fn load(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<Option<WorkflowState>, CoreError>;

    /// Alias kept distinct from `load` per §4.B's operation list — some
    /// backends distinguish "the active pointer" from "by id" lookups;
    /// the file backend treats them identically.
    async fn load_by_id(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<Option<WorkflowState>, CoreError> {
        self.load(id, cancel).await
    }

    async fn list_workflows(&self, cancel: &CancellationToken) -> Result<Vec<WorkflowSummary>, CoreError>;

    async fn acquire_lock(&self, holder: &str, ttl_secs: i64, cancel: &CancellationToken) -> Result<LockHandle, CoreError>;
    async fn release_lock(&self, cancel: &CancellationToken) -> Result<(), CoreError>;

    async fn acquire_workflow_lock(
        &self,
        id: &WorkflowId,
        holder: &str,
        ttl_secs: i64,
        cancel: &CancellationToken,
    ) -> Result<LockHandle, CoreError>;

    async fn refresh_workflow_lock(&self, id: &WorkflowId, ttl_secs: i64, cancel: &CancellationToken) -> Result<(), CoreError>;

    async fn set_workflow_running(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn clear_workflow_running(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn list_running_workflows(&self, cancel: &CancellationToken) -> Result<Vec<WorkflowSummary>, CoreError>;

    /// Running workflows whose `heartbeat_at` is older than `stale_threshold`
    /// or absent entirely (§4.B, §4.H).
    async fn find_zombie_workflows(
        &self,
        stale_threshold: chrono::Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkflowSummary>, CoreError>;

    async fn update_heartbeat(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError>;

    async fn archive_workflows(&self, ids: &[WorkflowId], cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn purge_all_workflows(&self, cancel: &CancellationToken) -> Result<(), CoreError>;
    async fn delete_workflow(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError>;

    /// Append a checkpoint atomically alongside a `Save` (used by
    /// `ExecuteAtomically` callers — see the default impl below).
    async fn latest_checkpoint(&self, id: &WorkflowId, checkpoint_type: &str, cancel: &CancellationToken) -> Result<Option<Checkpoint>, CoreError> {
        Ok(self
            .load(id, cancel)
            .await?
            .and_then(|s| s.latest_checkpoint(checkpoint_type).cloned()))
    }

    /// Sees a snapshot-consistent view and commits all mutations or none
    /// (§4.B, testable property #6). The default implementation loads,
    /// applies `mutate`, then saves — correct for a single-writer-per-lock
    /// backend (the workflow lock, not this method, is what serializes
    /// concurrent writers); backends with native transactions may override.
    /// Takes a boxed closure (rather than a generic parameter) so the trait
    /// stays object-safe — `Arc<dyn StateManager>` is how every consumer
    /// holds this.
    async fn execute_atomically(
        &self,
        id: &WorkflowId,
        cancel: &CancellationToken,
        mutate: Box<dyn FnOnce(&mut WorkflowState) -> Result<(), CoreError> + Send>,
    ) -> Result<(), CoreError> {
        let mut state = self
            .load(id, cancel)
            .await?
            .ok_or_else(|| CoreError::new(quorum_core::ErrorCode::Internal, format!("no state for {id}")))?;
        mutate(&mut state)?;
        self.save(&state, cancel).await
    }
}
