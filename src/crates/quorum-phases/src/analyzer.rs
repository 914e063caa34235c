//! Analyzer (Analyze phase, §4.G.1): produces the single
//! `consolidated_analysis` checkpoint subsequent phases read, either from
//! one agent or from a multi-agent consensus loop moderated by an arbiter
//! agent.

use crate::model::{ConsolidatedAnalysis, ModeratorVerdict};
use crate::prompts::{render_analyze_prompt, render_moderator_prompt, render_refine_prompt, render_synthesize_prompt};
use chrono::Utc;
use quorum_agents::{AgentRegistry, ExecuteOptions};
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_state::{Checkpoint, ExecutionMode, Phase, WorkflowState};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// A moderator is active only when an arbiter agent is configured; the
/// `Blueprint`'s `ModeratorConfig` has no separate `enabled` flag, so this
/// is the natural reading of "if a moderator is enabled" (§4.G.1).
#[derive(Clone)]
pub struct Analyzer {
    registry: Arc<AgentRegistry>,
}

impl Analyzer {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, state: &mut WorkflowState, cancel: &CancellationToken) -> Result<ConsolidatedAnalysis> {
        let analysis = match state.blueprint.execution_mode {
            ExecutionMode::SingleAgent => self.run_single_agent(state, cancel).await?,
            ExecutionMode::MultiAgent | ExecutionMode::Interactive => self.run_multi_agent(state, cancel).await?,
        };

        let data = bincode::serialize(&analysis).map_err(|e| CoreError::internal(e.to_string()))?;
        state.push_checkpoint(Checkpoint {
            id: format!("analysis-{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()),
            checkpoint_type: "consolidated_analysis".to_string(),
            phase: Phase::Analyze,
            timestamp: Utc::now(),
            data,
        });
        Ok(analysis)
    }

    async fn run_single_agent(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<ConsolidatedAnalysis> {
        let agent_name = state
            .blueprint
            .analyze_agents
            .first()
            .or(state.blueprint.refiner_agent.as_ref())
            .ok_or_else(|| CoreError::new(ErrorCode::AgentNoAgents, "no analyze agent configured"))?
            .clone();
        let content = self.execute_analyze(&agent_name, state, cancel).await?;
        Ok(ConsolidatedAnalysis { content, sources: vec![agent_name] })
    }

    async fn run_multi_agent(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<ConsolidatedAnalysis> {
        if state.blueprint.analyze_agents.is_empty() {
            return Err(CoreError::new(ErrorCode::AgentNoAgents, "no analyze agents configured"));
        }

        let mut analyses = self.collect_initial(state, cancel).await?;
        let moderator = state.blueprint.moderator.clone();

        let Some(arbiter) = moderator.arbiter_agent.clone() else {
            return self.synthesize(state, &analyses, cancel).await;
        };

        let mut round: u32 = 0;
        let mut prev_score: Option<f64> = None;

        loop {
            round += 1;
            let verdict = self.moderate(&arbiter, state, &analyses, cancel).await?;
            let score = verdict.weighted_score(&moderator.weights);
            info!(round, score, "consensus round scored");

            if score < moderator.abort_threshold {
                return Err(CoreError::new(
                    ErrorCode::ConsensusAborted,
                    format!(
                        "consensus score {score:.3} below abort threshold {:.3} at round {round}",
                        moderator.abort_threshold
                    ),
                ));
            }

            if score >= moderator.threshold && round >= moderator.min_rounds {
                return self.synthesize(state, &analyses, cancel).await;
            }

            if let Some(prev) = prev_score {
                if (score - prev).abs() < moderator.stagnation_threshold {
                    warn!(round, score, "consensus stagnated, synthesizing with current best");
                    return self.synthesize(state, &analyses, cancel).await;
                }
            }

            if round >= moderator.max_rounds {
                return self.synthesize(state, &analyses, cancel).await;
            }

            prev_score = Some(score);
            analyses = self.refine_all(state, &analyses, cancel).await?;
        }
    }

    async fn execute_analyze(&self, agent_name: &str, state: &WorkflowState, cancel: &CancellationToken) -> Result<String> {
        let model = state.blueprint.phase_models.get("analyze").cloned();
        let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
        let mut options = ExecuteOptions::new(render_analyze_prompt(&state.prompt), workdir);
        options.model = model;
        options.phase_hint = Some("analyze".to_string());
        let result = self.registry.execute(agent_name, options, cancel).await?;
        Ok(result.content)
    }

    async fn collect_initial(&self, state: &WorkflowState, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let mut join_set = tokio::task::JoinSet::new();
        for agent_name in &state.blueprint.analyze_agents {
            let analyzer = self.clone();
            let agent_name = agent_name.clone();
            let model = state.blueprint.phase_models.get("analyze").cloned();
            let prompt = render_analyze_prompt(&state.prompt);
            let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let mut options = ExecuteOptions::new(prompt, workdir);
                options.model = model;
                options.phase_hint = Some("analyze".to_string());
                let result = analyzer.registry.execute(&agent_name, options, &cancel).await;
                (agent_name, result)
            });
        }

        let mut analyses = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (agent_name, result) = joined.map_err(|e| CoreError::internal(e.to_string()))?;
            analyses.insert(agent_name, result?.content);
        }
        Ok(analyses)
    }

    async fn refine_all(&self, state: &WorkflowState, analyses: &HashMap<String, String>, cancel: &CancellationToken) -> Result<HashMap<String, String>> {
        let mut join_set = tokio::task::JoinSet::new();
        for (agent_name, own_analysis) in analyses {
            let others: Vec<(String, String)> = analyses
                .iter()
                .filter(|(name, _)| *name != agent_name)
                .map(|(name, text)| (name.clone(), text.clone()))
                .collect();
            let analyzer = self.clone();
            let agent_name = agent_name.clone();
            let own_analysis = own_analysis.clone();
            let model = state.blueprint.phase_models.get("analyze").cloned();
            let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
            let cancel = cancel.clone();
            join_set.spawn(async move {
                let others_refs: Vec<(&str, &str)> = others.iter().map(|(n, t)| (n.as_str(), t.as_str())).collect();
                let prompt = render_refine_prompt(&own_analysis, &others_refs);
                let mut options = ExecuteOptions::new(prompt, workdir);
                options.model = model;
                options.phase_hint = Some("analyze".to_string());
                let result = analyzer.registry.execute(&agent_name, options, &cancel).await;
                (agent_name, result)
            });
        }

        let mut refined = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            let (agent_name, result) = joined.map_err(|e| CoreError::internal(e.to_string()))?;
            refined.insert(agent_name, result?.content);
        }
        Ok(refined)
    }

    async fn moderate(&self, arbiter: &str, state: &WorkflowState, analyses: &HashMap<String, String>, cancel: &CancellationToken) -> Result<ModeratorVerdict> {
        let model = state.blueprint.phase_models.get("analyze").cloned();
        let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
        let mut options = ExecuteOptions::new(render_moderator_prompt(analyses), workdir);
        options.model = model;
        let result = self.registry.execute(arbiter, options, cancel).await?;
        parse_json_payload(&result.content)
    }

    async fn synthesize(&self, state: &WorkflowState, analyses: &HashMap<String, String>, cancel: &CancellationToken) -> Result<ConsolidatedAnalysis> {
        let sources: Vec<String> = analyses.keys().cloned().collect();
        let content = match &state.blueprint.synthesizer_agent {
            Some(agent_name) => {
                let model = state.blueprint.phase_models.get("analyze").cloned();
                let workdir = state.worktree_root.clone().unwrap_or_else(|| ".".to_string());
                let mut options = ExecuteOptions::new(render_synthesize_prompt(analyses), workdir);
                options.model = model;
                self.registry.execute(agent_name, options, cancel).await?.content
            }
            None => {
                let mut combined = String::new();
                for (agent_name, text) in analyses {
                    combined.push_str(&format!("--- {agent_name} ---\n{text}\n\n"));
                }
                combined
            }
        };
        Ok(ConsolidatedAnalysis { content, sources })
    }
}

fn parse_json_payload<T: serde::de::DeserializeOwned>(content: &str) -> Result<T> {
    if let Ok(value) = serde_json::from_str::<T>(content) {
        return Ok(value);
    }
    if let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) {
        if end > start {
            if let Ok(value) = serde_json::from_str::<T>(&content[start..=end]) {
                return Ok(value);
            }
        }
    }
    Err(CoreError::new(ErrorCode::Internal, "failed to parse agent JSON response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use quorum_agents::{Agent, AgentCapabilities, EventHandler, ExecuteResult};
    use quorum_state::{Blueprint, ModeratorConfig, WorkflowId};
    use std::time::Duration;

    struct FixedAgent {
        name: String,
        content: String,
    }

    fn dummy_capabilities() -> AgentCapabilities {
        AgentCapabilities {
            supports_streaming: false,
            supports_sandbox: false,
            supports_deny_list: false,
            supports_model_override: false,
            max_context_bytes: 1_000_000,
        }
    }

    #[async_trait]
    impl Agent for FixedAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> AgentCapabilities {
            dummy_capabilities()
        }

        async fn ping(&self, _cancel: &CancellationToken) -> quorum_core::Result<()> {
            Ok(())
        }

        async fn execute(&self, _options: ExecuteOptions, _cancel: &CancellationToken) -> quorum_core::Result<ExecuteResult> {
            Ok(ExecuteResult {
                content: self.content.clone(),
                tokens_in: 10,
                tokens_out: 10,
                cost_usd: 0.01,
                artifacts: vec![],
                duration_ms: 5,
            })
        }

        fn set_event_handler(&self, _handler: EventHandler) {}
    }

    fn registry_with(agents: Vec<(&str, Arc<dyn Agent>)>) -> Arc<AgentRegistry> {
        let map: HashMap<String, Arc<dyn Agent>> = agents.into_iter().map(|(n, a)| (n.to_string(), a)).collect();
        Arc::new(AgentRegistry::new(map, 100, Duration::from_secs(1)))
    }

    fn fixed(name: &str, content: &str) -> Arc<dyn Agent> {
        Arc::new(FixedAgent { name: name.to_string(), content: content.to_string() })
    }

    #[tokio::test]
    async fn single_agent_mode_uses_content_directly() {
        let registry = registry_with(vec![("claude", fixed("claude", "the analysis"))]);
        let analyzer = Analyzer::new(registry);

        let mut blueprint = Blueprint::default();
        blueprint.execution_mode = ExecutionMode::SingleAgent;
        blueprint.analyze_agents = vec!["claude".to_string()];

        let mut state = WorkflowState::new(WorkflowId("wf-1".into()), "prompt", blueprint);
        let cancel = CancellationToken::new();

        let result = analyzer.run(&mut state, &cancel).await.unwrap();
        assert_eq!(result.content, "the analysis");
        assert!(state.latest_checkpoint("consolidated_analysis").is_some());
    }

    #[tokio::test]
    async fn multi_agent_without_moderator_concatenates() {
        let registry = registry_with(vec![("a", fixed("a", "alpha view")), ("b", fixed("b", "beta view"))]);
        let analyzer = Analyzer::new(registry);

        let mut blueprint = Blueprint::default();
        blueprint.execution_mode = ExecutionMode::MultiAgent;
        blueprint.analyze_agents = vec!["a".to_string(), "b".to_string()];

        let mut state = WorkflowState::new(WorkflowId("wf-2".into()), "prompt", blueprint);
        let cancel = CancellationToken::new();

        let result = analyzer.run(&mut state, &cancel).await.unwrap();
        assert!(result.content.contains("alpha view"));
        assert!(result.content.contains("beta view"));
    }

    #[tokio::test]
    async fn consensus_below_abort_threshold_fails() {
        struct ModeratorAgent;

        #[async_trait]
        impl Agent for ModeratorAgent {
            fn name(&self) -> &str {
                "mod"
            }

            fn capabilities(&self) -> AgentCapabilities {
                dummy_capabilities()
            }

            async fn ping(&self, _cancel: &CancellationToken) -> quorum_core::Result<()> {
                Ok(())
            }

            async fn execute(&self, _options: ExecuteOptions, _cancel: &CancellationToken) -> quorum_core::Result<ExecuteResult> {
                Ok(ExecuteResult {
                    content: r#"{"per_category": {"claims": 0.1, "risks": 0.1, "recommendations": 0.1}}"#.to_string(),
                    tokens_in: 1,
                    tokens_out: 1,
                    cost_usd: 0.0,
                    artifacts: vec![],
                    duration_ms: 1,
                })
            }

            fn set_event_handler(&self, _handler: EventHandler) {}
        }

        let registry = registry_with(vec![
            ("a", fixed("a", "alpha")),
            ("b", fixed("b", "beta")),
            ("mod", Arc::new(ModeratorAgent)),
        ]);
        let analyzer = Analyzer::new(registry);

        let mut blueprint = Blueprint::default();
        blueprint.execution_mode = ExecutionMode::MultiAgent;
        blueprint.analyze_agents = vec!["a".to_string(), "b".to_string()];
        blueprint.moderator = ModeratorConfig {
            threshold: 0.8,
            abort_threshold: 0.3,
            min_rounds: 1,
            max_rounds: 3,
            stagnation_threshold: 0.05,
            weights: HashMap::new(),
            arbiter_agent: Some("mod".to_string()),
        };

        let mut state = WorkflowState::new(WorkflowId("wf-3".into()), "prompt", blueprint);
        let cancel = CancellationToken::new();

        let err = analyzer.run(&mut state, &cancel).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::ConsensusAborted);
    }
}
