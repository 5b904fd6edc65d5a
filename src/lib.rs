#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Cycle Orchestrator
//!
//! Supervisor for long-running, failure-prone module jobs (directory scrapers,
//! SEO analysers) that repeatedly rotates through a fixed set of modules inside
//! one process.
//!
//! ## Overview
//!
//! Each module implements the [`Worker`] contract: list item identifiers after
//! a cursor, process one item. The orchestrator runs every module in parallel
//! each cycle, checkpoints every module's cursor durably, resumes exactly where
//! a crashed process left off, stops modules whose heartbeat goes silent, and
//! manages the database pool and memory all modules share.
//!
//! ## Module Organization
//!
//! - [`worker`] - Worker contract and the batch-loop runner
//! - [`state`] - Cycle and module progress with database + JSON file persistence
//! - [`resources`] - Connection pool, scoped sessions, memory monitoring
//! - [`health`] - Heartbeat tracking and stuck detection
//! - [`orchestration`] - The cycle supervisor and per-module activity logs
//! - [`config`] - Configuration loading and validation
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured diagnostic logging
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use cycle_orchestrator::config::ConfigManager;
//! use cycle_orchestrator::orchestration::Orchestrator;
//! use cycle_orchestrator::resources::ResourceManager;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example(workers: Vec<Arc<dyn cycle_orchestrator::Worker>>) -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load(None)?;
//! let config = manager.config().clone();
//! cycle_orchestrator::logging::init_structured_logging(&config.paths.log_dir);
//!
//! let resources = Arc::new(
//!     ResourceManager::connect(config.database.clone(), config.resources.clone()).await,
//! );
//! let orchestrator = Orchestrator::new(config, resources).await?;
//! for worker in workers {
//!     orchestrator.register_worker(worker)?;
//! }
//!
//! orchestrator.start().await?;
//! tokio::signal::ctrl_c().await?;
//! orchestrator.stop(Duration::from_secs(30)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! No test needs a live database; the relational backend is covered through
//! its degradation path.
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod health;
pub mod logging;
pub mod orchestration;
pub mod resources;
pub mod state;
pub mod utils;
pub mod worker;

pub use config::{ConfigManager, CycleConfig};
pub use constants::{CycleStatus, HealthStatus, ItemId, ModuleStatus};
pub use error::{CycleError, OrchestratorError, ResourceError, Result, StateError, WorkerError};
pub use health::{HealthMonitor, ModuleHealth};
pub use orchestration::{ActivityLog, CycleReport, Orchestrator, OrchestratorStatus};
pub use resources::ResourceManager;
pub use state::{CycleState, ModuleState, StateStore};
pub use worker::{Worker, WorkerResult, WorkerRunner, WorkerStats};
