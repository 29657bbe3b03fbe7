//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only run journal
//! - Pipeline: The step sequence and retry policy
//! - Step: The contract every stage implements
//! - LaneLock: One writer per lane across processes
//! - Orchestrator: Main execution engine

pub mod event_store;
pub mod lane_lock;
pub mod orchestrator;
pub mod pipeline;
pub mod step;

// Re-export commonly used types
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use lane_lock::LaneLock;
pub use orchestrator::Orchestrator;
pub use pipeline::{Pipeline, PipelineError, RetryPolicy, StepSpec};
pub use step::{run_step, Step, StepContext, StepError, StepInvocation, StepOutput};
