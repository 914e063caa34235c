//! Ambient stack shared by every quorum-ai crate.
//!
//! # Modules
//!
//! - `config` - Configuration management with environment variable loading
//! - `error` - Error handling utilities with context and chain formatting
//! - `async_utils` - Retry policies and timeout utilities for async operations
//! - `validation` - Fluent validation API for type-safe data validation
//! - `serialization` - Stable JSON serialization and hashing utilities
//! - `rate_limit` - Token bucket and sliding window rate limiters
//! - `logging` - Structured logging helpers and formatters

pub mod async_utils;
pub mod config;
pub mod error;
pub mod logging;
pub mod rate_limit;
pub mod serialization;
pub mod validation;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error kinds shared across the workspace (see `ERROR HANDLING DESIGN`
/// in the project spec). The CLI maps these to process exit codes; the SSE
/// gateway includes them verbatim in event payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    Config,
    StateCorrupt,
    StateMigration,
    LockBusy,
    DagCycle,
    AgentNotFound,
    AgentTimeout,
    AgentRateLimited,
    AgentAuth,
    AgentNoAgents,
    AgentTransient,
    AgentFatal,
    RateLimitExceeded,
    ConsensusAborted,
    CostLimit,
    Git,
    Cancelled,
    Timeout,
    Internal,
}

impl ErrorCode {
    /// Whether the retry service should treat this kind as retryable.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorCode::AgentTimeout | ErrorCode::AgentRateLimited | ErrorCode::AgentTransient
        )
    }

    /// Maps a stable error code to the CLI process exit code from §6.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorCode::Config => 2,
            ErrorCode::AgentNotFound | ErrorCode::AgentNoAgents => 3,
            ErrorCode::LockBusy => 4,
            ErrorCode::CostLimit => 5,
            ErrorCode::ConsensusAborted => 6,
            ErrorCode::Cancelled => 130,
            _ => 1,
        }
    }
}

/// A user-visible failure: stable code, human message, optional structured detail.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{code:?}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::internal(e.to_string())
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::internal(e.to_string())
    }
}

/// Result type used at crate boundaries across the workspace.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Configuration structure for ambient tooling (logging verbosity, scratch dir).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    pub verbose: bool,
    pub output_dir: Option<String>,
}

impl CoreConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<String>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }
}

/// Initialize process-wide tracing subscriber from `log.{level,format}`.
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

/// Get version information.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CoreConfig::default();
        assert!(!config.verbose);
        assert!(config.output_dir.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = CoreConfig::new().with_verbose(true).with_output_dir("/tmp");
        assert!(config.verbose);
        assert_eq!(config.output_dir, Some("/tmp".to_string()));
    }

    #[test]
    fn test_error_code_retryable() {
        assert!(ErrorCode::AgentTimeout.is_retryable());
        assert!(!ErrorCode::AgentFatal.is_retryable());
    }

    #[test]
    fn test_error_code_exit_code() {
        assert_eq!(ErrorCode::Cancelled.exit_code(), 130);
        assert_eq!(ErrorCode::CostLimit.exit_code(), 5);
        assert_eq!(ErrorCode::Internal.exit_code(), 1);
    }

    #[test]
    fn test_version() {
        assert!(!version().is_empty());
    }
}
