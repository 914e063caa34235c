//! Agent Registry (§4.C Responsibility, Rate limiter registry, Streaming
//! event bridge). Adapters are registered via a `HashMap<String, Arc<dyn
//! Agent>>` built at startup from config, following `orca::lib.rs`'s
//! re-export/registration convention.

use crate::model::{AgentEvent, ExecuteOptions, ExecuteResult};
use crate::traits::Agent;
use quorum_bus::{Event, EventBus};
use quorum_core::rate_limit::RateLimiter;
use quorum_core::{CoreError, ErrorCode, Result};
use quorum_state::{TaskId, WorkflowId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Process-global home for agent adapters and their per-agent token
/// buckets, so CLI phase commands share limits across concurrent tasks
/// (§4.C Rate limiter registry).
#[derive(Clone)]
pub struct AgentRegistry {
    agents: Arc<HashMap<String, Arc<dyn Agent>>>,
    limiters: Arc<HashMap<String, RateLimiter>>,
}

impl AgentRegistry {
    pub fn new(agents: HashMap<String, Arc<dyn Agent>>, bucket_capacity: usize, bucket_period: Duration) -> Self {
        let limiters = agents
            .keys()
            .map(|name| (name.clone(), RateLimiter::new(bucket_capacity, bucket_period)))
            .collect();
        Self { agents: Arc::new(agents), limiters: Arc::new(limiters) }
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Agent>> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::new(ErrorCode::AgentNotFound, format!("no agent registered as '{name}'")))
    }

    /// Installs a single global handler converting `AgentEvent`s into bus
    /// `agent_event` payloads tagged with the current workflow and task
    /// (§4.C Streaming event bridge).
    pub fn install_bus_bridge(&self, bus: Arc<EventBus>, workflow_id: WorkflowId, task_id: TaskId) {
        for agent in self.agents.values() {
            let bus = bus.clone();
            let workflow_id = workflow_id.clone();
            let task_id = task_id.clone();
            agent.set_event_handler(Arc::new(move |event: AgentEvent| {
                let bus = bus.clone();
                let workflow_id = workflow_id.0.clone();
                let task_id = task_id.0.clone();
                tokio::spawn(async move {
                    let _ = bus
                        .publish(Event::AgentEvent {
                            workflow_id,
                            task_id: Some(task_id),
                            agent: event.agent,
                            event_type: event.event_type,
                            message: event.message,
                            data: event.data,
                            timestamp: event.timestamp,
                        })
                        .await;
                });
            }));
        }
    }

    /// Blocks on the named agent's token bucket (respecting cancellation),
    /// then executes. Mirrors §4.C: "Execute blocks on the bucket."
    pub async fn execute(&self, agent_name: &str, options: ExecuteOptions, cancel: &CancellationToken) -> Result<ExecuteResult> {
        let agent = self.get(agent_name)?;
        if let Some(limiter) = self.limiters.get(agent_name) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(CoreError::new(ErrorCode::Cancelled, "rate-limit wait cancelled")),
                _ = limiter.acquire() => {}
            }
        }
        agent.execute(options, cancel).await
    }

    pub async fn ping_all(&self, cancel: &CancellationToken) -> HashMap<String, Result<()>> {
        let mut results = HashMap::new();
        for (name, agent) in self.agents.iter() {
            results.insert(name.clone(), agent.ping(cancel).await);
        }
        results
    }

    /// Names of every registered agent, for validating config-driven agent
    /// lists (e.g. `Blueprint.analyze_agents`, `Blueprint.planner_agent`)
    /// against what's actually available.
    pub fn agent_names(&self) -> Vec<String> {
        self.agents.keys().cloned().collect()
    }
}
