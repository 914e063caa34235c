//! Workflow Runner composition, Recovery Manager, and axum HTTP/SSE API
//! (§4.G.4, §4.H, §4.I, §6). Grounded on the `orchestrator` crate's binary
//! and config/handler layout.

pub mod api;
pub mod config;
pub mod recovery;
pub mod runner_builder;
pub mod sse;

pub use config::{load_config, QuorumConfig};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use runner_builder::{build_blueprint, build_stack, RunnerStack};
