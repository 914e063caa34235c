//! Planner (Plan phase, §4.G.2): turns the consolidated analysis into a
//! validated task DAG.

use crate::prompts::render_plan_prompt;
use quorum_agents::{AgentRegistry, ExecuteOptions};
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_dag::{DagBuilder, DagError};
use quorum_state::{TaskId, TaskState, WorkflowState};
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::model::PlanResponse;
use crate::prompts::prepend_feedback;

pub struct Planner {
    registry: Arc<AgentRegistry>,
}

impl Planner {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    /// Fresh plan: clears any prior tasks before rendering the Plan prompt.
    pub async fn run(&self, state: &mut WorkflowState, analysis: &str, cancel: &CancellationToken) -> Result<()> {
        state.tasks.clear();
        state.task_order.clear();
        self.plan_into(state, analysis, cancel).await
    }

    /// Replan (§4.G.2 Replan): clears `Tasks`/`TaskOrder` and re-runs with
    /// optional prepended feedback, without disturbing the analysis
    /// checkpoint.
    pub async fn replan(&self, state: &mut WorkflowState, analysis: &str, feedback: Option<&str>, cancel: &CancellationToken) -> Result<()> {
        let analysis_text = match feedback {
            Some(f) => prepend_feedback(analysis, f),
            None => analysis.to_string(),
        };
        state.tasks.clear();
        state.task_order.clear();
        self.plan_into(state, &analysis_text, cancel).await
    }

    async fn plan_into(&self, state: &mut WorkflowState, analysis: &str, cancel: &CancellationToken) -> Result<()> {
        let agent_name = state.blueprint.planner_agent.clone();
        if agent_name.is_empty() {
            return Err(CoreError::new(ErrorCode::Config, "no planner_agent configured in blueprint"));
        }

        let model = state.blueprint.phase_models.get("plan").cloned();
        let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
        let mut options = ExecuteOptions::new(render_plan_prompt(analysis, &state.blueprint), workdir);
        options.model = model;
        options.phase_hint = Some("plan".to_string());

        let result = self.registry.execute(&agent_name, options, cancel).await?;
        let response: PlanResponse = parse_plan_response(&result.content)?;

        self.validate_and_install(state, response.tasks)
    }

    fn validate_and_install(&self, state: &mut WorkflowState, planned: Vec<crate::model::PlannedTask>) -> Result<()> {
        if planned.is_empty() {
            return Err(CoreError::new(ErrorCode::Config, "planning agent returned zero tasks"));
        }

        let registered_agents: HashSet<String> = self.registry.agent_names().into_iter().collect();
        let ids: HashSet<String> = planned.iter().map(|t| t.id.clone()).collect();
        if ids.len() != planned.len() {
            return Err(CoreError::new(ErrorCode::Config, "duplicate task ids in plan response"));
        }

        let mut dag = DagBuilder::new();
        for task in &planned {
            if !registered_agents.contains(&task.agent) {
                return Err(CoreError::new(
                    ErrorCode::AgentNotFound,
                    format!("planned task '{}' references unregistered agent '{}'", task.id, task.agent),
                ));
            }
            for dep in &task.dependencies {
                if !ids.contains(dep) {
                    return Err(CoreError::new(
                        ErrorCode::Config,
                        format!("task '{}' depends on unknown task '{}'", task.id, dep),
                    ));
                }
            }
            dag.add_task(TaskId(task.id.clone()));
        }
        for task in &planned {
            for dep in &task.dependencies {
                dag.add_dependency(TaskId(dep.clone()), TaskId(task.id.clone()))
                    .map_err(|e| CoreError::new(ErrorCode::Internal, e.to_string()))?;
            }
        }

        let order = dag.build().map_err(|e| match e {
            DagError::Cycle(members) => CoreError::new(ErrorCode::DagCycle, format!("cycle among tasks: {members:?}")),
            DagError::UnknownTask(t) => CoreError::new(ErrorCode::Internal, format!("dependency on unregistered task {t}")),
        })?;

        for task in planned {
            let id = TaskId(task.id.clone());
            let mut task_state = TaskState::new(id.clone(), task.name, task.description, task.agent);
            task_state.model = task.model;
            task_state.dependencies = task.dependencies.into_iter().map(TaskId).collect();
            state.tasks.insert(id, task_state);
        }
        state.task_order = order;
        Ok(())
    }
}

fn parse_plan_response(content: &str) -> Result<PlanResponse> {
    if let Ok(value) = serde_json::from_str::<PlanResponse>(content) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<PlanResponse>(&content[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(CoreError::new(ErrorCode::Internal, "failed to parse planning agent's JSON task list"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_agents::{Agent, AgentCapabilities, EventHandler, ExecuteResult};
    use quorum_state::{Blueprint, WorkflowId};
    use std::collections::HashMap;
    use std::time::Duration;

    struct ScriptedAgent {
        content: &'static str,
    }

    #[async_trait]
    impl Agent for ScriptedAgent {
        fn name(&self) -> &str {
            "planner"
        }

        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities {
                supports_streaming: false,
                supports_sandbox: false,
                supports_deny_list: false,
                supports_model_override: false,
                max_context_bytes: 1_000_000,
            }
        }

        async fn ping(&self, _cancel: &CancellationToken) -> quorum_core::Result<()> {
            Ok(())
        }

        async fn execute(&self, _options: ExecuteOptions, _cancel: &CancellationToken) -> quorum_core::Result<ExecuteResult> {
            Ok(ExecuteResult {
                content: self.content.to_string(),
                tokens_in: 1,
                tokens_out: 1,
                cost_usd: 0.0,
                artifacts: vec![],
                duration_ms: 1,
            })
        }

        fn set_event_handler(&self, _handler: EventHandler) {}
    }

    struct NoopAgent(&'static str);

    #[async_trait]
    impl Agent for NoopAgent {
        fn name(&self) -> &str {
            self.0
        }
        fn capabilities(&self) -> AgentCapabilities {
            AgentCapabilities {
                supports_streaming: false,
                supports_sandbox: false,
                supports_deny_list: false,
                supports_model_override: false,
                max_context_bytes: 1_000_000,
            }
        }
        async fn ping(&self, _cancel: &CancellationToken) -> quorum_core::Result<()> {
            Ok(())
        }
        async fn execute(&self, _options: ExecuteOptions, _cancel: &CancellationToken) -> quorum_core::Result<ExecuteResult> {
            Ok(ExecuteResult { content: String::new(), tokens_in: 0, tokens_out: 0, cost_usd: 0.0, artifacts: vec![], duration_ms: 0 })
        }
        fn set_event_handler(&self, _handler: EventHandler) {}
    }

    fn planner_with(plan_content: &'static str, coding_agents: &[&'static str]) -> Planner {
        let mut map: HashMap<String, Arc<dyn Agent>> = HashMap::new();
        map.insert("planner".to_string(), Arc::new(ScriptedAgent { content: plan_content }));
        for name in coding_agents {
            map.insert(name.to_string(), Arc::new(NoopAgent(name)));
        }
        let registry = Arc::new(AgentRegistry::new(map, 100, Duration::from_secs(1)));
        Planner::new(registry)
    }

    fn state_with_planner() -> WorkflowState {
        let mut blueprint = Blueprint::default();
        blueprint.planner_agent = "planner".to_string();
        WorkflowState::new(WorkflowId("wf-plan".into()), "add a feature", blueprint)
    }

    #[tokio::test]
    async fn valid_plan_installs_topologically_ordered_tasks() {
        let planner = planner_with(
            r#"{"tasks": [
                {"id": "t1", "name": "scaffold", "description": "set up module", "agent": "claude", "dependencies": []},
                {"id": "t2", "name": "implement", "description": "write logic", "agent": "claude", "dependencies": ["t1"]}
            ]}"#,
            &["claude"],
        );
        let mut state = state_with_planner();
        let cancel = CancellationToken::new();

        planner.run(&mut state, "analysis text", &cancel).await.unwrap();

        assert_eq!(state.task_order, vec![TaskId("t1".to_string()), TaskId("t2".to_string())]);
        assert_eq!(state.tasks.len(), 2);
    }

    #[tokio::test]
    async fn unregistered_agent_is_rejected() {
        let planner = planner_with(
            r#"{"tasks": [{"id": "t1", "name": "x", "description": "y", "agent": "ghost", "dependencies": []}]}"#,
            &["claude"],
        );
        let mut state = state_with_planner();
        let cancel = CancellationToken::new();

        let err = planner.run(&mut state, "analysis", &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AgentNotFound);
    }

    #[tokio::test]
    async fn cyclic_dependencies_are_rejected() {
        let planner = planner_with(
            r#"{"tasks": [
                {"id": "t1", "name": "a", "description": "a", "agent": "claude", "dependencies": ["t2"]},
                {"id": "t2", "name": "b", "description": "b", "agent": "claude", "dependencies": ["t1"]}
            ]}"#,
            &["claude"],
        );
        let mut state = state_with_planner();
        let cancel = CancellationToken::new();

        let err = planner.run(&mut state, "analysis", &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::DagCycle);
    }

    #[tokio::test]
    async fn replan_prepends_feedback_and_clears_old_tasks() {
        let planner = planner_with(
            r#"{"tasks": [{"id": "t1", "name": "redo", "description": "redo it", "agent": "claude", "dependencies": []}]}"#,
            &["claude"],
        );
        let mut state = state_with_planner();
        let cancel = CancellationToken::new();
        planner.run(&mut state, "initial analysis", &cancel).await.unwrap();
        assert_eq!(state.tasks.len(), 1);

        planner.replan(&mut state, "initial analysis", Some("use a different approach"), &cancel).await.unwrap();
        assert_eq!(state.tasks.len(), 1);
        assert!(state.tasks.contains_key(&TaskId("t1".to_string())));
    }
}
