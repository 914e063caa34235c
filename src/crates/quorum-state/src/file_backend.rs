//! File-backed `StateManager`: atomic write (temp file + fsync + rename)
//! with a `.bak` peer, per §4.B's "Durability model". Chosen over an
//! embedded key/value store per the Open Question resolution in
//! `DESIGN.md` — the spec fixes the contract and leaves backend choice to
//! implementers.

use crate::lock::LockHandle;
use crate::migration::{apply_migrations, Migration};
use crate::model::{WorkflowId, WorkflowState, WorkflowStatus};
use crate::traits::{StateManager, WorkflowSummary};
use async_trait::async_trait;
use quorum_core::{CoreError, ErrorCode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

struct GlobalLock {
    handle: Option<LockHandle>,
}

/// `.quorum/state/` on disk, one JSON file per workflow plus a shared
/// `running.json` registry of currently-running ids and a process-wide
/// legacy lock slot.
pub struct FileStateManager {
    root: PathBuf,
    migrations: Vec<Box<dyn Migration>>,
    global_lock: Mutex<GlobalLock>,
    workflow_locks: Mutex<HashMap<WorkflowId, LockHandle>>,
    running: Mutex<std::collections::HashSet<WorkflowId>>,
}

impl FileStateManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            migrations: Vec::new(),
            global_lock: Mutex::new(GlobalLock { handle: None }),
            workflow_locks: Mutex::new(HashMap::new()),
            running: Mutex::new(std::collections::HashSet::new()),
        }
    }

    pub fn with_migrations(mut self, migrations: Vec<Box<dyn Migration>>) -> Self {
        self.migrations = migrations;
        self
    }

    fn primary_path(&self, id: &WorkflowId) -> PathBuf {
        self.root.join(format!("{}.json", id.0))
    }

    fn backup_path(&self, id: &WorkflowId) -> PathBuf {
        self.root.join(format!("{}.json.bak", id.0))
    }

    async fn ensure_root(&self) -> Result<(), CoreError> {
        tokio::fs::create_dir_all(&self.root).await?;
        Ok(())
    }

    /// Write `contents` atomically: temp file in the same directory (so
    /// rename is same-filesystem), fsync, rename over the destination, and
    /// copy the previous primary to `.bak` first so a crash mid-write
    /// leaves a readable fallback.
    async fn atomic_write(path: &Path, bak_path: &Path, contents: &[u8]) -> Result<(), CoreError> {
        if tokio::fs::try_exists(path).await.unwrap_or(false) {
            let _ = tokio::fs::copy(path, bak_path).await;
        }
        let tmp_path = path.with_extension("json.tmp");
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        use tokio::io::AsyncWriteExt;
        file.write_all(contents).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    async fn read_state_file(path: &Path) -> Result<WorkflowState, CoreError> {
        let bytes = tokio::fs::read(path).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::new(ErrorCode::StateCorrupt, format!("corrupt state at {path:?}: {e}")))
    }
}

#[async_trait]
impl StateManager for FileStateManager {
    async fn save(&self, state: &WorkflowState, _cancel: &CancellationToken) -> Result<(), CoreError> {
        self.ensure_root().await?;
        let json = serde_json::to_vec_pretty(state)?;
        let primary = self.primary_path(&state.workflow_id);
        let backup = self.backup_path(&state.workflow_id);
        Self::atomic_write(&primary, &backup, &json).await
    }

    async fn load(&self, id: &WorkflowId, _cancel: &CancellationToken) -> Result<Option<WorkflowState>, CoreError> {
        let primary = self.primary_path(id);
        if !tokio::fs::try_exists(&primary).await.unwrap_or(false) {
            return Ok(None);
        }
        let mut state = match Self::read_state_file(&primary).await {
            Ok(s) => s,
            Err(e) if e.code == ErrorCode::StateCorrupt => {
                tracing::warn!(workflow_id = %id, "primary state corrupt, falling back to .bak");
                let backup = self.backup_path(id);
                if tokio::fs::try_exists(&backup).await.unwrap_or(false) {
                    Self::read_state_file(&backup).await?
                } else {
                    return Err(e);
                }
            }
            Err(e) => return Err(e),
        };
        apply_migrations(&mut state, &self.migrations)?;
        Ok(Some(state))
    }

    async fn list_workflows(&self, cancel: &CancellationToken) -> Result<Vec<WorkflowSummary>, CoreError> {
        self.ensure_root().await?;
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if !name.ends_with(".json") || name.ends_with(".json.tmp") {
                continue;
            }
            let id = WorkflowId(name.trim_end_matches(".json").to_string());
            if let Some(state) = self.load(&id, cancel).await? {
                out.push(WorkflowSummary {
                    workflow_id: state.workflow_id,
                    status: state.status,
                    updated_at: state.updated_at,
                    heartbeat_at: state.heartbeat_at,
                });
            }
        }
        Ok(out)
    }

    async fn acquire_lock(&self, holder: &str, ttl_secs: i64, _cancel: &CancellationToken) -> Result<LockHandle, CoreError> {
        let mut guard = self.global_lock.lock().await;
        if let Some(existing) = &guard.handle {
            if !existing.is_expired() {
                return Err(CoreError::new(ErrorCode::LockBusy, format!("held by {}", existing.holder)));
            }
            tracing::warn!(previous_holder = %existing.holder, "stealing expired global lock");
        }
        let handle = LockHandle::new(holder, ttl_secs);
        guard.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn release_lock(&self, _cancel: &CancellationToken) -> Result<(), CoreError> {
        self.global_lock.lock().await.handle = None;
        Ok(())
    }

    async fn acquire_workflow_lock(
        &self,
        id: &WorkflowId,
        holder: &str,
        ttl_secs: i64,
        _cancel: &CancellationToken,
    ) -> Result<LockHandle, CoreError> {
        let mut locks = self.workflow_locks.lock().await;
        if let Some(existing) = locks.get(id) {
            if !existing.is_expired() {
                return Err(CoreError::new(ErrorCode::LockBusy, format!("workflow {id} held by {}", existing.holder)));
            }
            tracing::warn!(workflow_id = %id, previous_holder = %existing.holder, "stealing expired workflow lock");
        }
        let handle = LockHandle::new(holder, ttl_secs);
        locks.insert(id.clone(), handle.clone());
        Ok(handle)
    }

    async fn refresh_workflow_lock(&self, id: &WorkflowId, ttl_secs: i64, _cancel: &CancellationToken) -> Result<(), CoreError> {
        let mut locks = self.workflow_locks.lock().await;
        match locks.get_mut(id) {
            Some(handle) => {
                handle.refresh(ttl_secs);
                Ok(())
            }
            None => Err(CoreError::new(ErrorCode::Internal, format!("no lock held for {id}"))),
        }
    }

    async fn set_workflow_running(&self, id: &WorkflowId, _cancel: &CancellationToken) -> Result<(), CoreError> {
        self.running.lock().await.insert(id.clone());
        Ok(())
    }

    async fn clear_workflow_running(&self, id: &WorkflowId, _cancel: &CancellationToken) -> Result<(), CoreError> {
        self.running.lock().await.remove(id);
        Ok(())
    }

    async fn list_running_workflows(&self, cancel: &CancellationToken) -> Result<Vec<WorkflowSummary>, CoreError> {
        let running_ids = self.running.lock().await.clone();
        let all = self.list_workflows(cancel).await?;
        Ok(all.into_iter().filter(|s| running_ids.contains(&s.workflow_id)).collect())
    }

    async fn find_zombie_workflows(
        &self,
        stale_threshold: chrono::Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<WorkflowSummary>, CoreError> {
        let now = chrono::Utc::now();
        let running = self.list_running_workflows(cancel).await?;
        Ok(running
            .into_iter()
            .filter(|s| s.status == WorkflowStatus::Running)
            .filter(|s| match s.heartbeat_at {
                None => true,
                Some(hb) => now - hb > stale_threshold,
            })
            .collect())
    }

    async fn update_heartbeat(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError> {
        if let Some(mut state) = self.load(id, cancel).await? {
            state.heartbeat_at = Some(chrono::Utc::now());
            self.save(&state, cancel).await?;
        }
        Ok(())
    }

    async fn archive_workflows(&self, ids: &[WorkflowId], cancel: &CancellationToken) -> Result<(), CoreError> {
        let archive_dir = self.root.join("archive");
        tokio::fs::create_dir_all(&archive_dir).await?;
        for id in ids {
            let primary = self.primary_path(id);
            if tokio::fs::try_exists(&primary).await.unwrap_or(false) {
                let dest = archive_dir.join(format!("{}.json", id.0));
                tokio::fs::rename(&primary, &dest).await?;
            }
            self.clear_workflow_running(id, cancel).await?;
        }
        Ok(())
    }

    async fn purge_all_workflows(&self, cancel: &CancellationToken) -> Result<(), CoreError> {
        let summaries = self.list_workflows(cancel).await?;
        for summary in summaries {
            self.delete_workflow(&summary.workflow_id, cancel).await?;
        }
        Ok(())
    }

    async fn delete_workflow(&self, id: &WorkflowId, cancel: &CancellationToken) -> Result<(), CoreError> {
        let _ = tokio::fs::remove_file(self.primary_path(id)).await;
        let _ = tokio::fs::remove_file(self.backup_path(id)).await;
        self.clear_workflow_running(id, cancel).await?;
        self.workflow_locks.lock().await.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Blueprint;
    use tempfile::TempDir;

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(1);
        let state = WorkflowState::new(id.clone(), "prompt", Blueprint::default());
        mgr.save(&state, &cancel()).await.unwrap();
        let loaded = mgr.load(&id, &cancel()).await.unwrap().unwrap();
        assert_eq!(loaded.workflow_id, state.workflow_id);
        assert_eq!(loaded.prompt, state.prompt);
    }

    #[tokio::test]
    async fn corrupt_primary_falls_back_to_backup() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(2);
        let state = WorkflowState::new(id.clone(), "prompt", Blueprint::default());
        mgr.save(&state, &cancel()).await.unwrap();
        // second save creates a .bak of the first
        let mut second = state.clone();
        second.prompt = "updated".into();
        mgr.save(&second, &cancel()).await.unwrap();
        // corrupt the primary
        tokio::fs::write(mgr.primary_path(&id), b"not json").await.unwrap();
        let loaded = mgr.load(&id, &cancel()).await.unwrap().unwrap();
        assert_eq!(loaded.prompt, "prompt");
    }

    #[tokio::test]
    async fn missing_workflow_loads_none() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(3);
        assert!(mgr.load(&id, &cancel()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn workflow_lock_is_exclusive_until_expired() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(4);
        mgr.acquire_workflow_lock(&id, "runner-a", 300, &cancel()).await.unwrap();
        let err = mgr.acquire_workflow_lock(&id, "runner-b", 300, &cancel()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::LockBusy);
        // an expired lock can be stolen
        mgr.acquire_workflow_lock(&id, "runner-c", -1, &cancel()).await.unwrap();
        mgr.acquire_workflow_lock(&id, "runner-d", 300, &cancel()).await.unwrap();
    }

    #[tokio::test]
    async fn find_zombie_workflows_detects_stale_heartbeat() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(5);
        let mut state = WorkflowState::new(id.clone(), "prompt", Blueprint::default());
        state.status = WorkflowStatus::Running;
        state.heartbeat_at = Some(chrono::Utc::now() - chrono::Duration::minutes(10));
        mgr.save(&state, &cancel()).await.unwrap();
        mgr.set_workflow_running(&id, &cancel()).await.unwrap();

        let zombies = mgr.find_zombie_workflows(chrono::Duration::minutes(5), &cancel()).await.unwrap();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].workflow_id, id);
    }

    #[tokio::test]
    async fn execute_atomically_persists_mutation() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(6);
        let state = WorkflowState::new(id.clone(), "prompt", Blueprint::default());
        mgr.save(&state, &cancel()).await.unwrap();

        mgr.execute_atomically(
            &id,
            &cancel(),
            Box::new(|s| {
                s.status = WorkflowStatus::Running;
                Ok(())
            }),
        )
        .await
        .unwrap();

        let loaded = mgr.load(&id, &cancel()).await.unwrap().unwrap();
        assert_eq!(loaded.status, WorkflowStatus::Running);
    }

    #[tokio::test]
    async fn delete_workflow_removes_primary_and_backup() {
        let dir = TempDir::new().unwrap();
        let mgr = FileStateManager::new(dir.path());
        let id = WorkflowId::generate(7);
        let state = WorkflowState::new(id.clone(), "prompt", Blueprint::default());
        mgr.save(&state, &cancel()).await.unwrap();
        mgr.delete_workflow(&id, &cancel()).await.unwrap();
        assert!(mgr.load(&id, &cancel()).await.unwrap().is_none());
    }
}
