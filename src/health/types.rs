//! Health monitor data types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use crate::constants::HealthStatus;

/// Monitor-local view of one module
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleHealth {
    pub module: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Start of the current run; the liveness baseline until a heartbeat arrives
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub is_stuck: bool,
    pub status: HealthStatus,
    /// Only active modules are checked for liveness
    pub active: bool,
}

impl ModuleHealth {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            last_heartbeat: None,
            started_at: None,
            consecutive_failures: 0,
            is_stuck: false,
            status: HealthStatus::Unknown,
            active: false,
        }
    }

    /// Most recent sign of life: last heartbeat, else run start
    pub fn liveness_baseline(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat.or(self.started_at)
    }

    /// Seconds since the liveness baseline
    pub fn seconds_since_baseline(&self, now: DateTime<Utc>) -> Option<f64> {
        self.liveness_baseline()
            .map(|baseline| (now - baseline).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

/// Health transition callback, invoked with the module name
pub type HealthCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Transitions produced by one evaluation, delivered after the lock is released
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HealthEvent {
    Stuck(String),
    Recovered(String),
    Failed(String),
}
