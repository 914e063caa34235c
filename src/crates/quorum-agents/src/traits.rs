//! `Agent` interface (§4.C). Object-safe by construction: every method
//! takes `&self`, no generic parameters, so consumers hold `Arc<dyn Agent>`.

use crate::model::{AgentCapabilities, AgentEvent, ExecuteOptions, ExecuteResult};
use async_trait::async_trait;
use quorum_core::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type EventHandler = Arc<dyn Fn(AgentEvent) + Send + Sync>;

#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> AgentCapabilities;

    /// Liveness check; callers bound this to ~5s via the cancellation token.
    async fn ping(&self, cancel: &CancellationToken) -> Result<()>;

    async fn execute(&self, options: ExecuteOptions, cancel: &CancellationToken) -> Result<ExecuteResult>;

    /// Installs the handler invoked for every streamed `AgentEvent`. Called
    /// once at registry startup with the bus-forwarding handler (§4.C
    /// Streaming event bridge).
    fn set_event_handler(&self, handler: EventHandler);
}
