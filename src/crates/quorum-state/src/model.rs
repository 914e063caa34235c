//! Data model types (§3). `Tasks` is the arena, `TaskId` the index —
//! dependency edges reference peers by id rather than by owning reference
//! (Design Notes: "arena+index ... to avoid self-referential ownership
//! puzzles").

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Opaque workflow identifier: `wf-<nanos>-<seq>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkflowId(pub String);

impl WorkflowId {
    pub fn generate(seq: u64) -> Self {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
        Self(format!("wf-{nanos}-{seq}"))
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque task identifier, unique within one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub String);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// `failed`/`cancelled` are sinks unless the Recovery Manager resurrects
    /// a workflow into `paused`.
    pub fn is_terminal(self) -> bool {
        matches!(self, WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refine,
    Analyze,
    Plan,
    Execute,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskState {
    pub id: TaskId,
    pub name: String,
    pub description: String,
    pub phase: Phase,
    pub status: TaskStatus,
    pub cli: String,
    pub model: Option<String>,
    pub dependencies: Vec<TaskId>,
    pub retries: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub branch: Option<String>,
    pub worktree_path: Option<String>,
    pub last_commit: Option<String>,
    pub merge_pending: bool,
    /// Set by the Executor when `status == Skipped` (e.g. `dependency_failed`).
    pub skip_reason: Option<String>,
    pub error: Option<String>,
}

impl TaskState {
    pub fn new(id: TaskId, name: impl Into<String>, description: impl Into<String>, cli: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            description: description.into(),
            phase: Phase::Plan,
            status: TaskStatus::Pending,
            cli: cli.into(),
            model: None,
            dependencies: Vec::new(),
            retries: 0,
            started_at: None,
            completed_at: None,
            tokens_in: 0,
            tokens_out: 0,
            cost_usd: 0.0,
            branch: None,
            worktree_path: None,
            last_commit: None,
            merge_pending: false,
            skip_reason: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TaskStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        self.status = TaskStatus::Skipped;
        self.skip_reason = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }

    /// Reverts an interrupted `running` task back to `pending` (Recovery
    /// Manager, §4.H, §8 S3). Leaves `worktree_path`/`branch` intact so the
    /// Executor can re-enter the same worktree rather than recreate it.
    pub fn reset_to_pending(&mut self) {
        self.status = TaskStatus::Pending;
        self.started_at = None;
    }
}

/// Append-only record; newest of a given `Type` wins when consumers look up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub checkpoint_type: String,
    pub phase: Phase,
    pub timestamp: DateTime<Utc>,
    /// Opaque payload (bincode-encoded) — callers agree on shape out of band
    /// per `checkpoint_type`.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    MultiAgent,
    SingleAgent,
    Interactive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeratorConfig {
    pub threshold: f64,
    pub abort_threshold: f64,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub stagnation_threshold: f64,
    pub weights: HashMap<String, f64>,
    pub arbiter_agent: Option<String>,
}

impl Default for ModeratorConfig {
    fn default() -> Self {
        Self {
            threshold: 0.8,
            abort_threshold: 0.3,
            min_rounds: 1,
            max_rounds: 3,
            stagnation_threshold: 0.05,
            weights: HashMap::new(),
            arbiter_agent: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    Sequential,
    Parallel,
    Rebase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictOption {
    Theirs,
    Ours,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalizationPolicy {
    pub auto_commit: bool,
    pub auto_push: bool,
    pub auto_pr: bool,
    pub auto_merge: bool,
    pub base_branch: String,
    pub merge_strategy: MergeStrategy,
    pub remote: String,
    /// File-favor applied when a task/workflow merge conflicts (§4.D Merge
    /// strategies "conflict favor"). `None` leaves conflicts unresolved —
    /// the merge reports the conflicting paths and `MergePending` is set.
    pub conflict_resolution: Option<ConflictOption>,
}

impl Default for FinalizationPolicy {
    fn default() -> Self {
        Self {
            auto_commit: true,
            auto_push: false,
            auto_pr: false,
            auto_merge: false,
            base_branch: "main".to_string(),
            merge_strategy: MergeStrategy::Sequential,
            remote: "origin".to_string(),
            conflict_resolution: None,
        }
    }
}

/// Immutable once a run starts (§3 Blueprint / RunnerConfig).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blueprint {
    pub execution_mode: ExecutionMode,
    pub moderator: ModeratorConfig,
    pub refiner_agent: Option<String>,
    /// Agents invoked during Analyze (§4.G.1 "for each enabled agent").
    /// Config-driven (`agents.<name>.enabled`) — lives here rather than
    /// being re-derived from the registry so a `Blueprint` snapshot fully
    /// describes one run without a live registry handle.
    pub analyze_agents: Vec<String>,
    pub synthesizer_agent: Option<String>,
    /// The "designated planning agent" referenced by §4.G.2.
    pub planner_agent: String,
    pub phase_models: HashMap<String, String>,
    pub worktree_auto_clean: bool,
    pub finalization: FinalizationPolicy,
    pub max_parallel_tasks: usize,
    pub max_cost_per_workflow: f64,
    pub phase_timeout_secs: u64,
    pub workflow_timeout_secs: u64,
}

impl Default for Blueprint {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::SingleAgent,
            moderator: ModeratorConfig::default(),
            refiner_agent: None,
            analyze_agents: Vec::new(),
            synthesizer_agent: None,
            planner_agent: String::new(),
            phase_models: HashMap::new(),
            worktree_auto_clean: true,
            finalization: FinalizationPolicy::default(),
            max_parallel_tasks: 4,
            max_cost_per_workflow: 10.0,
            phase_timeout_secs: 600,
            workflow_timeout_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Metrics {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_usd: f64,
    pub total_duration_ms: u64,
}

/// Logical root entity (§3 WorkflowState).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: WorkflowId,
    pub prompt: String,
    pub blueprint: Blueprint,
    pub status: WorkflowStatus,
    pub current_phase: Phase,
    pub tasks: HashMap<TaskId, TaskState>,
    pub task_order: Vec<TaskId>,
    pub checkpoints: Vec<Checkpoint>,
    pub metrics: Metrics,
    pub workflow_branch: Option<String>,
    pub base_branch: String,
    pub worktree_root: Option<String>,
    pub merge_strategy: MergeStrategy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub version: u32,
    pub kanban_column: Option<String>,
}

impl WorkflowState {
    pub fn new(workflow_id: WorkflowId, prompt: impl Into<String>, blueprint: Blueprint) -> Self {
        let now = Utc::now();
        let base_branch = blueprint.finalization.base_branch.clone();
        Self {
            workflow_id,
            prompt: prompt.into(),
            blueprint,
            status: WorkflowStatus::Pending,
            current_phase: Phase::Refine,
            tasks: HashMap::new(),
            task_order: Vec::new(),
            checkpoints: Vec::new(),
            metrics: Metrics::default(),
            workflow_branch: None,
            base_branch,
            worktree_root: None,
            merge_strategy: MergeStrategy::Sequential,
            created_at: now,
            updated_at: now,
            heartbeat_at: None,
            version: crate::migration::CURRENT_STATE_VERSION,
            kanban_column: None,
        }
    }

    /// Append a checkpoint (owned exclusively by the `WorkflowState` it
    /// lives in, per the §3 ownership rule).
    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push(checkpoint);
        self.updated_at = Utc::now();
    }

    /// Newest-first lookup by type (§4.F `LatestByType`).
    pub fn latest_checkpoint(&self, checkpoint_type: &str) -> Option<&Checkpoint> {
        self.checkpoints
            .iter()
            .rev()
            .find(|c| c.checkpoint_type == checkpoint_type)
    }

    /// Invariant 3 (§8): recomputes aggregate metrics from completed tasks.
    pub fn recompute_metrics(&mut self) {
        let mut m = Metrics::default();
        for task in self.tasks.values() {
            if task.status == TaskStatus::Completed {
                m.total_tokens_in += task.tokens_in;
                m.total_tokens_out += task.tokens_out;
                m.total_cost_usd += task.cost_usd;
            }
        }
        self.metrics = m;
        self.updated_at = Utc::now();
    }

    /// Invariant 2 (§8): true once every task is `completed` or `skipped`.
    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|t| t.status.is_terminal())
    }
}
