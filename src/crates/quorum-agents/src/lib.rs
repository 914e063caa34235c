//! Agent Registry & Adapter Protocol (§4.C): uniform invocation of
//! external CLI agent processes, with streaming events, retry, and
//! per-agent rate limiting.

pub mod cli_adapter;
pub mod model;
pub mod registry;
pub mod retry;
pub mod traits;

pub use cli_adapter::CliAgent;
pub use model::{AgentCapabilities, AgentEvent, Artifact, CliAgentSpec, ExecuteOptions, ExecuteResult};
pub use registry::AgentRegistry;
pub use traits::{Agent, EventHandler};
