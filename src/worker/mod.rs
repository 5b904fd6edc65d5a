//! # Worker Contract and Runner
//!
//! [`Worker`] is implemented by every module (scrapers, analysers). The
//! orchestrator never calls a worker directly; it drives one through a
//! [`WorkerRunner`], which owns the batch loop, failure isolation and
//! cooperative cancellation.

pub mod runner;
pub mod traits;

pub use runner::{RunnerState, WorkerRunner, WorkerStats};
pub use traits::{ItemOutcome, NoopObserver, ProgressUpdate, RunObserver, Worker, WorkerResult};
