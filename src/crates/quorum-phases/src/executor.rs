//! Executor (Execute phase, §4.G.3): runs tasks in dependency order with
//! bounded parallelism, isolated git worktrees, retry, cascading skip, and
//! a cost guard.

use crate::prompts::render_execute_prompt;
use chrono::Utc;
use quorum_agents::{retry, AgentRegistry, ExecuteOptions};
use quorum_bus::{Event, EventBus};
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_dag::{DagBuilder, DagError};
use quorum_git::GitIsolationManager;
use quorum_state::{Phase, StateManager, TaskId, TaskState, TaskStatus, WorkflowId, WorkflowState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// §4.G.3 worker pool. Not `Clone`-derived by accident: every field is an
/// `Arc` so a batch's concurrent workers can each own a handle, and the
/// git manager is serialized behind its own mutex since `git2::Repository`
/// is not safe for concurrent access (§5 "the DAG builder is
/// single-threaded per workflow" — the same reasoning applies to git
/// writes, which are inherently serialized by branch refs anyway).
#[derive(Clone)]
pub struct Executor {
    registry: Arc<AgentRegistry>,
    bus: Arc<EventBus>,
    git: Arc<tokio::sync::Mutex<GitIsolationManager>>,
    state_manager: Arc<dyn StateManager>,
    /// Guards `execute_atomically` calls against the lost-update race that
    /// would otherwise occur when multiple workers in one batch mutate the
    /// same `WorkflowState` concurrently — `StateManager`'s default
    /// `execute_atomically` impl assumes a single writer per lock holder,
    /// which the workflow lock alone doesn't guarantee across this
    /// worker pool.
    state_write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Executor {
    pub fn new(
        registry: Arc<AgentRegistry>,
        bus: Arc<EventBus>,
        git: Arc<tokio::sync::Mutex<GitIsolationManager>>,
        state_manager: Arc<dyn StateManager>,
    ) -> Self {
        Self { registry, bus, git, state_manager, state_write_lock: Arc::new(tokio::sync::Mutex::new(())) }
    }

    /// Drives the ready set to completion in batches; reloads state at
    /// each batch boundary so a concurrently-resumed run sees the latest
    /// task statuses.
    pub async fn run(&self, workflow_id: &WorkflowId, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::new(ErrorCode::Cancelled, "execution cancelled"));
            }

            let state = self.load(workflow_id, cancel).await?;
            if state.all_tasks_terminal() {
                return Ok(());
            }

            let ready = self.ready_tasks(&state)?;
            if ready.is_empty() {
                // Nothing ready and not all terminal: every remaining task is
                // blocked on a failed dependency that hasn't cascaded yet, or
                // the plan is malformed. Either way there's nothing this
                // batch can do.
                return Ok(());
            }

            self.snapshot_batch(workflow_id, &ready, cancel).await?;

            let pool_size = state.blueprint.max_parallel_tasks.max(1).min(ready.len());
            let semaphore = Arc::new(tokio::sync::Semaphore::new(pool_size));
            let mut join_set = tokio::task::JoinSet::new();

            for task_id in ready {
                let semaphore = semaphore.clone();
                let executor = self.clone();
                let workflow_id = workflow_id.clone();
                let cancel = cancel.clone();
                join_set.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
                    executor.run_one(&workflow_id, &task_id, &cancel).await
                });
            }

            while let Some(joined) = join_set.join_next().await {
                if let Err(join_err) = joined {
                    warn!(error = %join_err, "executor worker task panicked");
                }
            }

            let state = self.load(workflow_id, cancel).await?;
            if state.metrics.total_cost_usd > state.blueprint.max_cost_per_workflow {
                return Err(CoreError::new(
                    ErrorCode::CostLimit,
                    format!(
                        "cumulative cost {:.2} exceeds budget {:.2}",
                        state.metrics.total_cost_usd, state.blueprint.max_cost_per_workflow
                    ),
                ));
            }
        }
    }

    fn ready_tasks(&self, state: &WorkflowState) -> Result<Vec<TaskId>> {
        let mut dag = DagBuilder::new();
        for id in &state.task_order {
            dag.add_task(id.clone());
        }
        for task in state.tasks.values() {
            for dep in &task.dependencies {
                dag.add_dependency(dep.clone(), task.id.clone())
                    .map_err(|e: DagError| CoreError::new(ErrorCode::Internal, e.to_string()))?;
            }
        }

        let completed: HashSet<TaskId> = state.tasks.values().filter(|t| t.status.is_terminal()).map(|t| t.id.clone()).collect();
        Ok(dag
            .ready_set(&completed)
            .into_iter()
            .filter(|id| state.tasks.get(id).map(|t| t.status == TaskStatus::Pending).unwrap_or(false))
            .collect())
    }

    /// §4.F Checkpoints: "used ... by the executor to snapshot progress
    /// before each task batch."
    async fn snapshot_batch(&self, workflow_id: &WorkflowId, ready: &[TaskId], cancel: &CancellationToken) -> Result<()> {
        let ids: Vec<String> = ready.iter().map(|id| id.0.clone()).collect();
        let data = bincode::serialize(&ids).map_err(|e| CoreError::internal(e.to_string()))?;
        self.atomic(workflow_id, cancel, move |state| {
            state.push_checkpoint(quorum_state::Checkpoint {
                id: format!("execute-batch-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
                checkpoint_type: "phase".to_string(),
                phase: Phase::Execute,
                timestamp: Utc::now(),
                data,
            });
            Ok(())
        })
        .await
    }

    async fn run_one(&self, workflow_id: &WorkflowId, task_id: &TaskId, cancel: &CancellationToken) -> Result<()> {
        self.mark_running(workflow_id, task_id, cancel).await?;

        let worktree = {
            let git = self.git.lock().await;
            git.create_task_worktree(workflow_id, task_id)?
        };

        let task = self
            .atomic_and_read(workflow_id, task_id, cancel, {
                let worktree = worktree.clone();
                move |task| {
                    task.branch = Some(worktree.branch.clone());
                    task.worktree_path = Some(worktree.path.clone());
                }
            })
            .await?;

        let analysis_excerpt = self.load(workflow_id, cancel).await?.latest_checkpoint("consolidated_analysis").and_then(|c| {
            bincode::deserialize::<crate::model::ConsolidatedAnalysis>(&c.data).ok().map(|a| a.content)
        });
        let analysis_excerpt = analysis_excerpt.unwrap_or_default();

        let prompt = render_execute_prompt(&task, &analysis_excerpt);
        let mut options = ExecuteOptions::new(prompt, worktree.path.clone());
        options.model = task.model.clone();
        options.phase_hint = Some("execute".to_string());

        let _ = self
            .bus
            .publish(Event::TaskStarted { workflow_id: workflow_id.0.clone(), task_id: task_id.0.clone(), timestamp: Utc::now() })
            .await;

        match self.execute_with_retry(&task, options, workflow_id, cancel).await {
            Ok(result) => self.handle_success(workflow_id, task_id, &worktree, result, cancel).await,
            Err(error) => self.handle_failure(workflow_id, task_id, error, cancel).await,
        }
    }

    async fn execute_with_retry(
        &self,
        task: &TaskState,
        options: ExecuteOptions,
        workflow_id: &WorkflowId,
        cancel: &CancellationToken,
    ) -> Result<quorum_agents::ExecuteResult> {
        let policy = retry::default_policy();
        let registry = self.registry.clone();
        let cli = task.cli.clone();
        let cancel_owned = cancel.clone();

        let bus = self.bus.clone();
        let state_manager = self.state_manager.clone();
        let write_lock = self.state_write_lock.clone();
        let workflow_id = workflow_id.clone();
        let task_id = task.id.clone();

        retry::with_task_retry(
            &policy,
            &task_id.0,
            move || {
                let registry = registry.clone();
                let options = options.clone();
                let cli = cli.clone();
                let cancel = cancel_owned.clone();
                async move { registry.execute(&cli, options, &cancel).await }
            },
            move |attempt, _err| {
                let bus = bus.clone();
                let state_manager = state_manager.clone();
                let write_lock = write_lock.clone();
                let workflow_id = workflow_id.clone();
                let task_id = task_id.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    {
                        let _guard = write_lock.lock().await;
                        let task_id = task_id.clone();
                        let _ = state_manager
                            .execute_atomically(
                                &workflow_id,
                                &cancel,
                                Box::new(move |state| {
                                    if let Some(task) = state.tasks.get_mut(&task_id) {
                                        task.retries += 1;
                                    }
                                    Ok(())
                                }),
                            )
                            .await;
                    }
                    let _ = bus
                        .publish(Event::TaskRetry {
                            workflow_id: workflow_id.0.clone(),
                            task_id: task_id.0.clone(),
                            attempt: attempt as u32,
                            timestamp: Utc::now(),
                        })
                        .await;
                });
            },
        )
        .await
    }

    async fn handle_success(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        worktree: &quorum_git::WorktreeInfo,
        result: quorum_agents::ExecuteResult,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let state = self.load(workflow_id, cancel).await?;
        let finalization = state.blueprint.finalization.clone();

        let mut last_commit = None;
        if finalization.auto_commit {
            let message = format!("quorum: {}", task_id.0);
            let git = self.git.lock().await;
            match git.commit_worktree_changes(&worktree.path, &message) {
                Ok(commit) => last_commit = commit,
                Err(e) => warn!(task_id = %task_id.0, error = %e, "failed to commit task worktree"),
            }
        }

        let mut merge_pending = false;
        {
            let git = self.git.lock().await;
            match git.merge_task_to_workflow(workflow_id, &worktree.branch, state.merge_strategy, finalization.conflict_resolution.map(Into::into)) {
                Ok(Some(_conflicts)) => merge_pending = true,
                Ok(None) => {}
                Err(e) => {
                    warn!(task_id = %task_id.0, error = %e, "merge to workflow branch failed, leaving merge pending");
                    merge_pending = true;
                }
            }
        }

        self.atomic(workflow_id, cancel, {
            let task_id = task_id.clone();
            move |state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.tokens_in = result.tokens_in;
                    task.tokens_out = result.tokens_out;
                    task.cost_usd = result.cost_usd;
                    task.last_commit = last_commit.clone();
                    task.merge_pending = merge_pending;
                    task.mark_completed();
                }
                state.recompute_metrics();
                Ok(())
            }
        })
        .await?;

        let _ = self
            .bus
            .publish(Event::TaskCompleted { workflow_id: workflow_id.0.clone(), task_id: task_id.0.clone(), timestamp: Utc::now() })
            .await;
        Ok(())
    }

    async fn handle_failure(&self, workflow_id: &WorkflowId, task_id: &TaskId, error: CoreError, cancel: &CancellationToken) -> Result<()> {
        let skipped: Arc<std::sync::Mutex<Vec<TaskId>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let skipped_handle = skipped.clone();
        let error_message = error.message.clone();

        self.atomic(workflow_id, cancel, {
            let task_id = task_id.clone();
            move |state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.mark_failed(error_message.clone());
                }
                let newly_skipped = cascade_skip(state, &task_id);
                *skipped_handle.lock().expect("skip list mutex poisoned") = newly_skipped;
                state.recompute_metrics();
                Ok(())
            }
        })
        .await?;

        let _ = self
            .bus
            .publish(Event::TaskFailed {
                workflow_id: workflow_id.0.clone(),
                task_id: task_id.0.clone(),
                error_code: format!("{:?}", error.code),
                error: error.message.clone(),
                timestamp: Utc::now(),
            })
            .await;

        let skipped = skipped.lock().expect("skip list mutex poisoned").clone();
        for dependent in skipped {
            let _ = self
                .bus
                .publish(Event::TaskSkipped {
                    workflow_id: workflow_id.0.clone(),
                    task_id: dependent.0.clone(),
                    reason: "dependency_failed".to_string(),
                    timestamp: Utc::now(),
                })
                .await;
        }

        Ok(())
    }

    async fn mark_running(&self, workflow_id: &WorkflowId, task_id: &TaskId, cancel: &CancellationToken) -> Result<()> {
        self.atomic(workflow_id, cancel, {
            let task_id = task_id.clone();
            move |state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    task.phase = Phase::Execute;
                    task.mark_running();
                }
                Ok(())
            }
        })
        .await
    }

    async fn load(&self, workflow_id: &WorkflowId, cancel: &CancellationToken) -> Result<WorkflowState> {
        self.state_manager
            .load(workflow_id, cancel)
            .await?
            .ok_or_else(|| CoreError::internal(format!("no persisted state for workflow {workflow_id}")))
    }

    async fn atomic(
        &self,
        workflow_id: &WorkflowId,
        cancel: &CancellationToken,
        mutate: impl FnOnce(&mut WorkflowState) -> Result<()> + Send + 'static,
    ) -> Result<()> {
        let _guard = self.state_write_lock.lock().await;
        self.state_manager.execute_atomically(workflow_id, cancel, Box::new(mutate)).await
    }

    async fn atomic_and_read(
        &self,
        workflow_id: &WorkflowId,
        task_id: &TaskId,
        cancel: &CancellationToken,
        mutate: impl FnOnce(&mut TaskState) + Send + 'static,
    ) -> Result<TaskState> {
        let task_id = task_id.clone();
        self.atomic(workflow_id, cancel, {
            let task_id = task_id.clone();
            move |state| {
                if let Some(task) = state.tasks.get_mut(&task_id) {
                    mutate(task);
                }
                Ok(())
            }
        })
        .await?;
        self.load(workflow_id, cancel)
            .await?
            .tasks
            .get(&task_id)
            .cloned()
            .ok_or_else(|| CoreError::internal(format!("task {task_id} vanished after update")))
    }
}

/// A failed task cascades: every transitive dependent still `pending` is
/// marked `skipped(dependency_failed)` (§4.G.3 step 6, §8 S4).
fn cascade_skip(state: &mut WorkflowState, failed_id: &TaskId) -> Vec<TaskId> {
    let mut to_skip = Vec::new();
    let mut frontier = vec![failed_id.clone()];
    let mut visited: HashSet<TaskId> = HashSet::new();
    visited.insert(failed_id.clone());

    while let Some(current) = frontier.pop() {
        for task in state.tasks.values() {
            if task.dependencies.contains(&current) && !visited.contains(&task.id) {
                visited.insert(task.id.clone());
                frontier.push(task.id.clone());
                to_skip.push(task.id.clone());
            }
        }
    }

    for id in &to_skip {
        if let Some(task) = state.tasks.get_mut(id) {
            if task.status == TaskStatus::Pending {
                task.mark_skipped("dependency_failed");
            }
        }
    }
    to_skip
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_state::{Blueprint, WorkflowId};

    fn task(id: &str, deps: &[&str]) -> TaskState {
        let mut t = TaskState::new(TaskId(id.to_string()), id, "desc", "claude");
        t.dependencies = deps.iter().map(|d| TaskId(d.to_string())).collect();
        t
    }

    #[test]
    fn cascade_skip_marks_transitive_dependents() {
        let mut state = WorkflowState::new(WorkflowId("wf-cascade".into()), "prompt", Blueprint::default());
        for (id, deps) in [("a", &[][..]), ("b", &["a"][..]), ("c", &["b"][..]), ("d", &[][..])] {
            state.tasks.insert(TaskId(id.to_string()), task(id, deps));
        }

        let skipped = cascade_skip(&mut state, &TaskId("a".to_string()));
        let skipped_names: HashSet<String> = skipped.into_iter().map(|t| t.0).collect();

        assert_eq!(skipped_names, HashSet::from(["b".to_string(), "c".to_string()]));
        assert_eq!(state.tasks[&TaskId("b".to_string())].status, TaskStatus::Skipped);
        assert_eq!(state.tasks[&TaskId("c".to_string())].status, TaskStatus::Skipped);
        assert_eq!(state.tasks[&TaskId("d".to_string())].status, TaskStatus::Pending);
    }

    #[test]
    fn cascade_skip_does_not_touch_already_terminal_tasks() {
        let mut state = WorkflowState::new(WorkflowId("wf-cascade-2".into()), "prompt", Blueprint::default());
        let mut b = task("b", &["a"]);
        b.mark_completed();
        state.tasks.insert(TaskId("a".to_string()), task("a", &[]));
        state.tasks.insert(TaskId("b".to_string()), b);

        cascade_skip(&mut state, &TaskId("a".to_string()));
        assert_eq!(state.tasks[&TaskId("b".to_string())].status, TaskStatus::Completed);
    }
}
