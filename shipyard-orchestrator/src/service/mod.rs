//! Service Module
//!
//! Business logic layer for the orchestrator: the workflow state machine and
//! the background workers and bus consumers that drive it.

pub mod orchestrator;
pub mod reconciler;
pub mod subscriber;
pub mod sweeper;

pub use orchestrator::{Orchestrator, OrchestratorError};
pub use reconciler::Reconciler;
pub use sweeper::{SweepReport, Sweeper};
