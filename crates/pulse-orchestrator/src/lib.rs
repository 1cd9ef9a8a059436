//! Pipeline orchestration for the Pulse platform
//!
//! The orchestrator executes pipeline requests as a linear stage DAG
//! (scrape, process, clean, persist), tracks every stage as a task in the
//! registry, propagates cancellation, and bounds parallelism. The scheduler
//! submits a preset pipeline on a jittered cadence with skip-if-overlapping
//! semantics.

pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod spool;

pub use pipeline::{Orchestrator, OrchestratorStats, PipelineSnapshot};
pub use registry::{TaskFilter, TaskRegistry};
pub use scheduler::Scheduler;
