//! # Orchestration
//!
//! The cycle supervisor and its per-module activity trail.

pub mod activity_log;
pub mod observer;
pub mod orchestrator;

pub use activity_log::{ActivityEvent, ActivityLog};
pub use observer::{BaseCounts, ModuleObserver};
pub use orchestrator::{CycleReport, ModuleOutcome, Orchestrator, OrchestratorStatus, RunnerStatus};
