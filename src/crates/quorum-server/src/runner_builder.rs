//! Composes the `AgentRegistry`/`EventBus`/`GitIsolationManager`/
//! `FileStateManager`/`WorkflowRunner` stack from a loaded `QuorumConfig`.
//! Mirrors the composition shown in `quorum_phases::runner`'s own
//! `build_runner()` test helper, but wired from config-driven values
//! instead of fixed test fixtures.

use crate::config::QuorumConfig;
use quorum_agents::{Agent, AgentCapabilities, AgentRegistry, CliAgent, CliAgentSpec};
use quorum_bus::EventBus;
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_git::GitIsolationManager;
use quorum_phases::{Analyzer, Executor, Planner, ReviewGate, WorkflowRunner};
use quorum_state::{
    Blueprint, ExecutionMode, FileStateManager, FinalizationPolicy, MergeStrategy, ModeratorConfig, StateManager,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

const AGENT_RATE_LIMIT_BUCKET: usize = 10;
const AGENT_RATE_LIMIT_PERIOD: Duration = Duration::from_secs(60);

/// Env vars passed through to every agent subprocess regardless of
/// `env_allowlist` (§4.C Subprocess discipline "env_clear, then an
/// allowlist").
const DEFAULT_ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "LANG", "TERM"];

pub fn build_agent_registry(config: &QuorumConfig) -> Result<Arc<AgentRegistry>> {
    let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::new();
    for (name, agent_cfg) in &config.agents {
        if !agent_cfg.enabled {
            continue;
        }
        if agent_cfg.path.is_empty() {
            return Err(CoreError::new(ErrorCode::Config, format!("agents.{name}.path must be set when enabled")));
        }
        let spec = CliAgentSpec {
            name: name.clone(),
            binary: agent_cfg.path.clone(),
            base_args: Vec::new(),
            capabilities: AgentCapabilities {
                supports_streaming: true,
                supports_sandbox: true,
                supports_deny_list: true,
                supports_model_override: true,
                max_context_bytes: 200_000,
            },
            deny_flag_template: Some("--deny {tools}".to_string()),
            model_flag_template: Some("--model {model}".to_string()),
            env_allowlist: DEFAULT_ENV_ALLOWLIST.iter().map(|s| s.to_string()).collect(),
            phase_models: agent_cfg.phase_models.clone(),
        };
        agents.insert(name.clone(), Arc::new(CliAgent::new(spec)));
    }

    if agents.is_empty() {
        return Err(CoreError::new(ErrorCode::AgentNoAgents, "no enabled agents produced from configuration"));
    }

    Ok(Arc::new(AgentRegistry::new(agents, AGENT_RATE_LIMIT_BUCKET, AGENT_RATE_LIMIT_PERIOD)))
}

pub fn build_state_manager(config: &QuorumConfig) -> Arc<dyn StateManager> {
    Arc::new(FileStateManager::new(&config.state.path))
}

pub fn build_git_manager(config: &QuorumConfig) -> Result<Arc<tokio::sync::Mutex<GitIsolationManager>>> {
    let manager = GitIsolationManager::open(&config.git.repo_root, &config.git.worktree_dir, false, config.git.auto_clean)?;
    Ok(Arc::new(tokio::sync::Mutex::new(manager)))
}

pub fn parse_merge_strategy(value: &str) -> MergeStrategy {
    match value {
        "parallel" => MergeStrategy::Parallel,
        "rebase" => MergeStrategy::Rebase,
        "sequential" => MergeStrategy::Sequential,
        other => {
            warn!(value = other, "unrecognized git.merge_strategy, defaulting to sequential");
            MergeStrategy::Sequential
        }
    }
}

/// Builds a fresh `Blueprint` for a new workflow from configuration plus the
/// caller-chosen execution mode (§4.G.1 "Single-agent mode" vs "Multi-agent
/// mode" vs "Interactive mode" — a per-run choice, not a config-file key).
pub fn build_blueprint(config: &QuorumConfig, execution_mode: ExecutionMode, registry: &AgentRegistry) -> Result<Blueprint> {
    let enabled_agents = registry.agent_names();
    if enabled_agents.is_empty() {
        return Err(CoreError::new(ErrorCode::AgentNoAgents, "no agents available to populate a blueprint"));
    }
    let planner_agent = enabled_agents.first().cloned().unwrap_or_default();

    let moderator = ModeratorConfig {
        threshold: config.consensus.threshold,
        abort_threshold: config.consensus.arbiter.abort_threshold,
        min_rounds: config.consensus.arbiter.min_rounds,
        max_rounds: config.consensus.arbiter.max_rounds,
        stagnation_threshold: config.consensus.arbiter.stagnation_threshold,
        weights: config.consensus.weights.clone(),
        arbiter_agent: config.consensus.arbiter.agent.clone(),
    };

    let finalization = FinalizationPolicy {
        auto_commit: config.git.auto_commit,
        auto_push: config.git.auto_push,
        auto_pr: config.git.auto_pr,
        auto_merge: config.git.auto_merge,
        base_branch: config.git.pr_base_branch.clone(),
        merge_strategy: parse_merge_strategy(&config.git.merge_strategy),
        remote: config.git.remote.clone(),
        conflict_resolution: None,
    };

    let mut phase_models = HashMap::new();
    for agent_cfg in config.agents.values() {
        for (phase, model) in &agent_cfg.phase_models {
            phase_models.entry(phase.clone()).or_insert_with(|| model.clone());
        }
    }

    Ok(Blueprint {
        execution_mode,
        moderator,
        refiner_agent: Some(planner_agent.clone()),
        analyze_agents: enabled_agents.clone(),
        synthesizer_agent: config.consensus.arbiter.agent.clone(),
        planner_agent,
        phase_models,
        worktree_auto_clean: config.git.auto_clean,
        finalization,
        max_parallel_tasks: 4,
        max_cost_per_workflow: config.costs.max_per_workflow,
        phase_timeout_secs: config.workflow.timeout,
        workflow_timeout_secs: config.workflow.timeout,
    })
}

/// One composed runtime: the pieces a server or CLI process needs to start,
/// resume, or inspect workflows, plus the config they were built from.
pub struct RunnerStack {
    pub state_manager: Arc<dyn StateManager>,
    pub bus: Arc<EventBus>,
    pub git: Arc<tokio::sync::Mutex<GitIsolationManager>>,
    pub registry: Arc<AgentRegistry>,
    pub runner: Arc<WorkflowRunner>,
}

pub fn build_stack(config: &QuorumConfig, review_gate: Arc<dyn ReviewGate>, bus_capacity: usize) -> Result<RunnerStack> {
    let registry = build_agent_registry(config)?;
    let bus = Arc::new(EventBus::new(bus_capacity));
    let state_manager = build_state_manager(config);
    let git = build_git_manager(config)?;

    let analyzer = Analyzer::new(registry.clone());
    let planner = Planner::new(registry.clone());
    let executor = Executor::new(registry.clone(), bus.clone(), git.clone(), state_manager.clone());
    let runner = Arc::new(WorkflowRunner::new(state_manager.clone(), bus.clone(), analyzer, planner, executor, review_gate));

    Ok(RunnerStack { state_manager, bus, git, registry, runner })
}
