//! `.quorum/config.yaml` schema (§6 Configuration) and loading. Grounded on
//! `orchestrator::config::loader`'s load-then-validate convention, simplified
//! to a direct `serde_yaml::from_str` since this config has no `$include`
//! composition requirement, combined with `quorum_core::config::ConfigBuilder`
//! for the validate/from_env/merge contract every workspace config follows.

use quorum_core::config::{get_env_bool, get_env_or, get_env_parse_or, ConfigBuilder};
use quorum_core::{CoreError, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), format: "text".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub enabled: bool,
    pub path: String,
    pub model: Option<String>,
    pub max_tokens: Option<u64>,
    pub phase_models: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { enabled: true, path: String::new(), model: None, max_tokens: None, phase_models: HashMap::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    pub timeout: u64,
    pub max_retries: u32,
    pub sandbox: bool,
    pub deny_tools: Vec<String>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self { timeout: 3600, max_retries: 3, sandbox: false, deny_tools: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub agent: Option<String>,
    pub abort_threshold: f64,
    pub min_rounds: u32,
    pub max_rounds: u32,
    pub stagnation_threshold: f64,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self { agent: None, abort_threshold: 0.3, min_rounds: 1, max_rounds: 3, stagnation_threshold: 0.05 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    pub threshold: f64,
    pub weights: HashMap<String, f64>,
    pub arbiter: ArbiterConfig,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self { threshold: 0.8, weights: HashMap::new(), arbiter: ArbiterConfig::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    pub backend: String,
    pub path: String,
    pub lock_ttl: i64,
    pub backup_path: Option<String>,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self { backend: "file".to_string(), path: ".quorum/state".to_string(), lock_ttl: 300, backup_path: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub repo_root: String,
    pub worktree_dir: String,
    pub worktree_mode: String,
    pub auto_clean: bool,
    pub auto_commit: bool,
    pub auto_push: bool,
    pub auto_pr: bool,
    pub auto_merge: bool,
    pub pr_base_branch: String,
    pub merge_strategy: String,
    pub remote: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_root: ".".to_string(),
            worktree_dir: ".quorum/worktrees".to_string(),
            worktree_mode: "isolated".to_string(),
            auto_clean: true,
            auto_commit: true,
            auto_push: false,
            auto_pr: false,
            auto_merge: false,
            pr_base_branch: "main".to_string(),
            merge_strategy: "sequential".to_string(),
            remote: "origin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CostsConfig {
    pub max_per_workflow: f64,
    pub max_per_task: f64,
}

impl Default for CostsConfig {
    fn default() -> Self {
        Self { max_per_workflow: 10.0, max_per_task: 2.0 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub interval: u64,
    pub stale_threshold: u64,
    pub check_interval: u64,
    pub auto_resume: bool,
    pub max_resumes: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self { interval: 30, stale_threshold: 300, check_interval: 60, auto_resume: true, max_resumes: 3 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub mode: String,
    pub dir: String,
    pub redact: bool,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self { mode: "off".to_string(), dir: ".quorum/trace".to_string(), redact: true }
    }
}

/// HTTP bind settings. Not part of §6's config key list, but a server
/// process needs a host/port from somewhere, and every other section here
/// lives in the same file — adding it here beats a second config source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "127.0.0.1".to_string(), port: 8383 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub log: LogConfig,
    pub agents: HashMap<String, AgentConfig>,
    pub workflow: WorkflowConfig,
    pub consensus: ConsensusConfig,
    pub state: StateConfig,
    pub git: GitConfig,
    pub costs: CostsConfig,
    pub heartbeat: HeartbeatConfig,
    pub trace: TraceConfig,
    pub server: ServerConfig,
}

impl ConfigBuilder for QuorumConfig {
    fn validate(&self) -> Result<()> {
        if self.state.backend != "file" {
            return Err(CoreError::new(
                ErrorCode::Config,
                format!("unsupported state.backend '{}': only 'file' is implemented", self.state.backend),
            ));
        }
        if self.agents.is_empty() || self.agents.values().all(|a| !a.enabled) {
            return Err(CoreError::new(ErrorCode::AgentNoAgents, "no enabled agents configured under agents.<name>"));
        }
        if self.consensus.threshold < 0.0 || self.consensus.threshold > 1.0 {
            return Err(CoreError::new(ErrorCode::Config, "consensus.threshold must be between 0.0 and 1.0"));
        }
        Ok(())
    }

    /// Reads server-level overrides from the environment (§6 config keys
    /// are file-driven; this covers only what deployers commonly override
    /// without editing the file, mirroring the `QUORUM_` prefix other
    /// workspace binaries use for their own `{PREFIX}PORT`-style keys).
    fn from_env(prefix: &str) -> Result<Self> {
        let mut config = Self::default();
        config.server.host = get_env_or(&format!("{prefix}HOST"), &config.server.host)?;
        config.server.port = get_env_parse_or(&format!("{prefix}PORT"), config.server.port)?;
        config.log.level = get_env_or(&format!("{prefix}LOG_LEVEL"), &config.log.level)?;
        if let Some(json) = get_env_bool(&format!("{prefix}LOG_JSON"))? {
            config.log.format = if json { "json".to_string() } else { "text".to_string() };
        }
        Ok(config)
    }

    fn merge(&mut self, other: Self) -> &mut Self {
        if !other.log.level.is_empty() {
            self.log.level = other.log.level;
        }
        if !other.log.format.is_empty() {
            self.log.format = other.log.format;
        }
        self.agents.extend(other.agents);
        self
    }
}

/// Loads `.quorum/config.yaml` (or any path), validating the result. A
/// missing file is a configuration error (§6 exit code 2), not a silent
/// default — callers that want to run without a file should build
/// `QuorumConfig::default()` explicitly.
pub fn load_config(path: &Path) -> Result<QuorumConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| CoreError::new(ErrorCode::Config, format!("reading config file {}: {e}", path.display())))?;
    let config: QuorumConfig = serde_yaml::from_str(&contents)
        .map_err(|e| CoreError::new(ErrorCode::Config, format!("parsing config file {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}
