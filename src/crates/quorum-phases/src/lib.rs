//! Phase Runners (§4.G): the Analyzer, Planner, and Executor that turn a
//! prompt into a merged set of git branches, plus the `WorkflowRunner`
//! state machine that sequences them.

pub mod analyzer;
pub mod executor;
pub mod model;
pub mod planner;
pub mod prompts;
pub mod runner;

pub use analyzer::Analyzer;
pub use executor::Executor;
pub use planner::Planner;
pub use runner::{AutoContinue, ReviewGate, WorkflowRunner};
