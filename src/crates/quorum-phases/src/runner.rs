//! Workflow Runner (§4.G.4): drives Refine -> Analyze -> Plan -> Execute ->
//! Done, persisting `current_phase` at every transition and gating on
//! collaborator review after Analyze and Plan.

use crate::analyzer::Analyzer;
use crate::executor::Executor;
use crate::model::ReviewDecision;
use crate::planner::Planner;
use async_trait::async_trait;
use chrono::Utc;
use quorum_bus::{Event, EventBus};
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_state::{Phase, StateManager, WorkflowId, WorkflowState, WorkflowStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Interactive review gate (§4.G.4 Interactive mode). Invoked after Analyze
/// and after Plan; never after Execute (execution results are reviewed via
/// the task DAG and kanban board, not a blocking gate).
#[async_trait]
pub trait ReviewGate: Send + Sync {
    async fn await_decision(&self, workflow_id: &WorkflowId, phase: Phase) -> ReviewDecision;
}

/// Default gate for non-interactive runs: always continues.
pub struct AutoContinue;

#[async_trait]
impl ReviewGate for AutoContinue {
    async fn await_decision(&self, _workflow_id: &WorkflowId, _phase: Phase) -> ReviewDecision {
        ReviewDecision::Continue
    }
}

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_LOCK_TTL_SECS: i64 = 300;

pub struct WorkflowRunner {
    state_manager: Arc<dyn StateManager>,
    bus: Arc<EventBus>,
    analyzer: Analyzer,
    planner: Planner,
    executor: Executor,
    review_gate: Arc<dyn ReviewGate>,
}

impl WorkflowRunner {
    pub fn new(
        state_manager: Arc<dyn StateManager>,
        bus: Arc<EventBus>,
        analyzer: Analyzer,
        planner: Planner,
        executor: Executor,
        review_gate: Arc<dyn ReviewGate>,
    ) -> Self {
        Self { state_manager, bus, analyzer, planner, executor, review_gate }
    }

    /// Starts a brand new workflow: persists the initial state, then runs
    /// to completion.
    pub async fn start(&self, mut state: WorkflowState, cancel: &CancellationToken) -> Result<()> {
        state.status = WorkflowStatus::Running;
        self.state_manager.save(&state, cancel).await?;
        self.state_manager.set_workflow_running(&state.workflow_id, cancel).await?;
        let _ = self.bus.publish(Event::WorkflowStarted { workflow_id: state.workflow_id.0.clone(), project_id: None, timestamp: Utc::now() }).await;
        self.run_to_completion(state, cancel).await
    }

    /// Resumes a persisted workflow. Invariant 7 (§8): resuming an already
    /// terminal workflow is a no-op.
    pub async fn resume_with_state(&self, state: WorkflowState, cancel: &CancellationToken) -> Result<()> {
        if state.status.is_terminal() {
            return Ok(());
        }
        let _ = self.bus.publish(Event::WorkflowResumed { workflow_id: state.workflow_id.0.clone(), project_id: None, timestamp: Utc::now() }).await;
        self.run_to_completion(state, cancel).await
    }

    async fn run_to_completion(&self, state: WorkflowState, cancel: &CancellationToken) -> Result<()> {
        let workflow_id = state.workflow_id.clone();
        let heartbeat_handle = self.spawn_heartbeat(workflow_id.clone(), cancel.clone());

        let outcome = self.drive_phases(state, cancel).await;
        heartbeat_handle.abort();

        let _ = self.state_manager.clear_workflow_running(&workflow_id, cancel).await;

        match &outcome {
            Ok(()) => {
                let _ = self.bus.publish(Event::WorkflowCompleted { workflow_id: workflow_id.0.clone(), project_id: None, timestamp: Utc::now() }).await;
            }
            Err(error) if error.code == ErrorCode::Cancelled => {
                let _ = self.bus.publish(Event::WorkflowCancelled { workflow_id: workflow_id.0.clone(), project_id: None, timestamp: Utc::now() }).await;
            }
            Err(error) => {
                let _ = self
                    .bus
                    .publish(Event::WorkflowFailed {
                        workflow_id: workflow_id.0.clone(),
                        project_id: None,
                        error_code: format!("{:?}", error.code),
                        error: error.message.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }

        outcome
    }

    /// Background liveness ticker (§2 "a background heartbeat ticker
    /// refreshes the workflow's liveness"). Aborted once `drive_phases`
    /// returns, win or lose.
    fn spawn_heartbeat(&self, workflow_id: WorkflowId, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let state_manager = self.state_manager.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                if cancel.is_cancelled() {
                    return;
                }
                if let Err(e) = state_manager.refresh_workflow_lock(&workflow_id, HEARTBEAT_LOCK_TTL_SECS, &cancel).await {
                    warn!(workflow_id = %workflow_id.0, error = %e, "failed to refresh workflow lock");
                }
                if let Err(e) = state_manager.update_heartbeat(&workflow_id, &cancel).await {
                    warn!(workflow_id = %workflow_id.0, error = %e, "failed to update workflow heartbeat");
                }
            }
        })
    }

    async fn drive_phases(&self, mut state: WorkflowState, cancel: &CancellationToken) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                state.status = WorkflowStatus::Cancelled;
                self.state_manager.save(&state, cancel).await?;
                return Err(CoreError::new(ErrorCode::Cancelled, "workflow cancelled"));
            }

            match state.current_phase {
                Phase::Refine => {
                    self.publish_phase_started(&state, Phase::Refine).await;
                    state.current_phase = Phase::Analyze;
                    self.persist_phase(&mut state, cancel).await?;
                    self.publish_phase_completed(&state, Phase::Refine).await;
                }
                Phase::Analyze => {
                    self.publish_phase_started(&state, Phase::Analyze).await;
                    self.analyzer.run(&mut state, cancel).await?;
                    self.publish_phase_completed(&state, Phase::Analyze).await;

                    match self.await_review(&state, Phase::Analyze, cancel).await? {
                        ReviewDecision::Continue => {
                            state.current_phase = Phase::Plan;
                            self.persist_phase(&mut state, cancel).await?;
                        }
                        ReviewDecision::Rerun => {
                            self.persist_phase(&mut state, cancel).await?;
                        }
                        ReviewDecision::Feedback(_) | ReviewDecision::Abort => {
                            // Feedback during Analyze review has no analysis
                            // to prepend onto yet; treat it like a rerun.
                            self.persist_phase(&mut state, cancel).await?;
                        }
                    }
                }
                Phase::Plan => {
                    self.publish_phase_started(&state, Phase::Plan).await;
                    let analysis = self.latest_analysis_text(&state);
                    self.planner.run(&mut state, &analysis, cancel).await?;
                    self.announce_tasks(&state).await;
                    self.publish_phase_completed(&state, Phase::Plan).await;

                    match self.await_review(&state, Phase::Plan, cancel).await? {
                        ReviewDecision::Continue => {
                            state.current_phase = Phase::Execute;
                            self.persist_phase(&mut state, cancel).await?;
                        }
                        ReviewDecision::Rerun => {
                            self.persist_phase(&mut state, cancel).await?;
                        }
                        ReviewDecision::Feedback(feedback) => {
                            self.planner.replan(&mut state, &analysis, Some(feedback.as_str()), cancel).await?;
                            self.announce_tasks(&state).await;
                            self.persist_phase(&mut state, cancel).await?;
                        }
                        ReviewDecision::Abort => {
                            state.status = WorkflowStatus::Cancelled;
                            self.state_manager.save(&state, cancel).await?;
                            return Err(CoreError::new(ErrorCode::Cancelled, "workflow aborted at plan review"));
                        }
                    }
                }
                Phase::Execute => {
                    self.publish_phase_started(&state, Phase::Execute).await;
                    self.executor.run(&state.workflow_id, cancel).await?;

                    state = self
                        .state_manager
                        .load(&state.workflow_id, cancel)
                        .await?
                        .ok_or_else(|| CoreError::internal(format!("no persisted state for workflow {}", state.workflow_id)))?;

                    self.publish_phase_completed(&state, Phase::Execute).await;
                    state.current_phase = Phase::Done;
                    self.persist_phase(&mut state, cancel).await?;
                }
                Phase::Done => {
                    state.status = WorkflowStatus::Completed;
                    self.state_manager.save(&state, cancel).await?;
                    return Ok(());
                }
            }
        }
    }

    async fn await_review(&self, state: &WorkflowState, phase: Phase, cancel: &CancellationToken) -> Result<ReviewDecision> {
        if state.blueprint.execution_mode != quorum_state::ExecutionMode::Interactive {
            return Ok(ReviewDecision::Continue);
        }
        let _ = self
            .bus
            .publish(Event::PhaseAwaitingReview {
                workflow_id: state.workflow_id.0.clone(),
                project_id: None,
                phase: format!("{phase:?}").to_lowercase(),
                timestamp: Utc::now(),
            })
            .await;
        if cancel.is_cancelled() {
            return Err(CoreError::new(ErrorCode::Cancelled, "workflow cancelled while awaiting review"));
        }
        Ok(self.review_gate.await_decision(&state.workflow_id, phase).await)
    }

    fn latest_analysis_text(&self, state: &WorkflowState) -> String {
        state
            .latest_checkpoint("consolidated_analysis")
            .and_then(|c| bincode::deserialize::<crate::model::ConsolidatedAnalysis>(&c.data).ok())
            .map(|a| a.content)
            .unwrap_or_default()
    }

    async fn announce_tasks(&self, state: &WorkflowState) {
        for task_id in &state.task_order {
            if let Some(task) = state.tasks.get(task_id) {
                let _ = self
                    .bus
                    .publish(Event::TaskCreated {
                        workflow_id: state.workflow_id.0.clone(),
                        task_id: task.id.0.clone(),
                        name: task.name.clone(),
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }
    }

    async fn persist_phase(&self, state: &mut WorkflowState, cancel: &CancellationToken) -> Result<()> {
        state.updated_at = Utc::now();
        self.state_manager.save(state, cancel).await
    }

    async fn publish_phase_started(&self, state: &WorkflowState, phase: Phase) {
        let _ = self
            .bus
            .publish(Event::PhaseStarted {
                workflow_id: state.workflow_id.0.clone(),
                project_id: None,
                phase: format!("{phase:?}").to_lowercase(),
                timestamp: Utc::now(),
            })
            .await;
    }

    async fn publish_phase_completed(&self, state: &WorkflowState, phase: Phase) {
        let _ = self
            .bus
            .publish(Event::PhaseCompleted {
                workflow_id: state.workflow_id.0.clone(),
                project_id: None,
                phase: format!("{phase:?}").to_lowercase(),
                timestamp: Utc::now(),
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_agents::{Agent, AgentCapabilities, AgentRegistry, EventHandler, ExecuteOptions, ExecuteResult};
    use quorum_core::Result as CoreResult;
    use quorum_git::GitIsolationManager;
    use quorum_state::{Blueprint, FileStateManager};
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct FixedAgent(&'static str);

    #[async_trait]
    impl Agent for FixedAgent {
        fn name(&self) -> &str {
            self.0
        }
        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities { supports_streaming: false, supports_sandbox: false, supports_deny_list: false, supports_model_override: false, max_context_bytes: 1_000_000 }
        }
        async fn ping(&self, _cancel: &CancellationToken) -> CoreResult<()> {
            Ok(())
        }
        async fn execute(&self, options: ExecuteOptions, _cancel: &CancellationToken) -> CoreResult<ExecuteResult> {
            let content = if options.prompt.contains("task list") || options.prompt.contains("\"tasks\"") {
                r#"{"tasks": [{"id": "t1", "name": "only task", "description": "do it", "agent": "claude", "dependencies": []}]}"#.to_string()
            } else {
                "claims: x. risks: y. recommendations: z.".to_string()
            };
            Ok(ExecuteResult { content, tokens_in: 1, tokens_out: 1, cost_usd: 0.0, artifacts: vec![], duration_ms: 1 })
        }
        fn set_event_handler(&self, _handler: EventHandler) {}
    }

    fn build_runner(root: &TempDir, repo: &TempDir, worktree: &TempDir) -> WorkflowRunner {
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        agents.insert("claude".to_string(), Arc::new(FixedAgent("claude")));
        let registry = Arc::new(AgentRegistry::new(agents, 100, Duration::from_secs(1)));
        let bus = Arc::new(EventBus::new(64));
        let state_manager: Arc<dyn StateManager> = Arc::new(FileStateManager::new(root.path()));
        let git = Arc::new(tokio::sync::Mutex::new(GitIsolationManager::open(repo.path(), worktree.path(), true, true).unwrap()));

        let analyzer = Analyzer::new(registry.clone());
        let planner = Planner::new(registry.clone());
        let executor = Executor::new(registry, bus.clone(), git, state_manager.clone());
        WorkflowRunner::new(state_manager, bus, analyzer, planner, executor, Arc::new(AutoContinue))
    }

    fn init_git_repo(dir: &TempDir) {
        let repo = git2::Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let tree_id = repo.index().unwrap().write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[]).unwrap();
        let head = repo.head().unwrap().peel_to_commit().unwrap();
        let _ = repo.branch("main", &head, false);
    }

    #[tokio::test]
    async fn happy_path_runs_refine_through_done() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let worktree = TempDir::new().unwrap();
        init_git_repo(&repo);

        let mut blueprint = Blueprint::default();
        blueprint.analyze_agents = vec!["claude".to_string()];
        blueprint.planner_agent = "claude".to_string();
        blueprint.finalization.auto_commit = false;

        let state = WorkflowState::new(WorkflowId("wf-happy".into()), "build a feature", blueprint);
        let runner = build_runner(&root, &repo, &worktree);
        let cancel = CancellationToken::new();

        runner.start(state, &cancel).await.unwrap();

        let state_manager = FileStateManager::new(root.path());
        let saved = state_manager.load(&WorkflowId("wf-happy".into()), &cancel).await.unwrap().unwrap();
        assert_eq!(saved.status, WorkflowStatus::Completed);
        assert_eq!(saved.current_phase, Phase::Done);
        assert_eq!(saved.tasks.len(), 1);
    }

    #[tokio::test]
    async fn resuming_terminal_workflow_is_a_no_op() {
        let root = TempDir::new().unwrap();
        let repo = TempDir::new().unwrap();
        let worktree = TempDir::new().unwrap();
        init_git_repo(&repo);

        let mut state = WorkflowState::new(WorkflowId("wf-done".into()), "already finished", Blueprint::default());
        state.status = WorkflowStatus::Completed;
        state.current_phase = Phase::Done;

        let runner = build_runner(&root, &repo, &worktree);
        let cancel = CancellationToken::new();

        runner.resume_with_state(state, &cancel).await.unwrap();
    }
}
