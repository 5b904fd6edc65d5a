//! # Health Monitoring
//!
//! Per-module heartbeat tracking, stuck detection with a background check
//! loop, and consecutive-failure accounting.

pub mod monitor;
pub mod types;

pub use monitor::HealthMonitor;
pub use types::{HealthCallback, ModuleHealth};
