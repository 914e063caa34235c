//! Agent interface types (§3 Agent Capabilities, §4.C ExecuteOptions/Result).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AgentCapabilities {
    pub supports_streaming: bool,
    pub supports_sandbox: bool,
    pub supports_deny_list: bool,
    pub supports_model_override: bool,
    pub max_context_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub prompt: String,
    pub model: Option<String>,
    pub sandbox: bool,
    pub denied_tools: HashSet<String>,
    pub workdir: String,
    pub env_passthrough: Vec<String>,
    pub max_tokens: Option<u64>,
    pub timeout: Duration,
    pub phase_hint: Option<String>,
}

impl ExecuteOptions {
    pub fn new(prompt: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            model: None,
            sandbox: false,
            denied_tools: HashSet::new(),
            workdir: workdir.into(),
            env_passthrough: Vec::new(),
            max_tokens: None,
            timeout: Duration::from_secs(600),
            phase_hint: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub path: String,
    pub bytes: u64,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub content: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub cost_usd: f64,
    pub artifacts: Vec<Artifact>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub event_type: String,
    pub agent: String,
    pub message: String,
    pub data: Option<serde_json::Value>,
    pub timestamp: DateTime<Utc>,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>, agent: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            agent: agent.into(),
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Declarative subprocess shape for one CLI agent (§6 `agents.<name>.*`).
#[derive(Debug, Clone)]
pub struct CliAgentSpec {
    pub name: String,
    pub binary: String,
    pub base_args: Vec<String>,
    pub capabilities: AgentCapabilities,
    pub deny_flag_template: Option<String>,
    pub model_flag_template: Option<String>,
    pub env_allowlist: HashSet<String>,
    pub phase_models: HashMap<String, String>,
}
