//! # System Constants
//!
//! Status enums shared by the state store, health monitor and dashboard views,
//! plus the default tuning values used when configuration omits a field.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonically increasing identifier of a unit of work
pub type ItemId = i64;

/// Default tuning values
pub mod defaults {
    pub const HEARTBEAT_TIMEOUT_SECONDS: u64 = 300;
    pub const HEALTH_CHECK_INTERVAL_SECONDS: u64 = 30;
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;
    pub const DELAY_BETWEEN_CYCLES_SECONDS: u64 = 60;
    pub const DELAY_BETWEEN_MODULES_SECONDS: u64 = 5;
    pub const ERROR_BACKOFF_SECONDS: u64 = 60;
    pub const STOP_GRACE_PERIOD_SECONDS: u64 = 5;
    pub const FAILURE_RATIO_THRESHOLD: f64 = 0.5;
    pub const BATCH_SIZE: usize = 100;
    pub const DELAY_BETWEEN_ITEMS_MS: u64 = 1000;
    pub const MEMORY_WARNING_THRESHOLD: f64 = 0.80;
    pub const MEMORY_CRITICAL_THRESHOLD: f64 = 0.90;
    pub const CLEANUP_PASSES: u32 = 3;
    /// Upper bound on any cooperative sleep before the stop flag is re-checked
    pub const STOP_POLL_INTERVAL_MS: u64 = 1000;
    /// Minimum spacing of heartbeat-only state writes; progress writes always stamp one
    pub const HEARTBEAT_PERSIST_INTERVAL_SECONDS: u64 = 5;
}

/// Activity log name used for orchestrator-level events
pub const ORCHESTRATOR_LOG: &str = "orchestrator";

/// Per-module progress status within one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModuleStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
}

impl ModuleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleStatus::Pending => "pending",
            ModuleStatus::Running => "running",
            ModuleStatus::Completed => "completed",
            ModuleStatus::Failed => "failed",
        }
    }

    /// Completed and failed modules have been attempted in the current rotation
    pub fn is_terminal(&self) -> bool {
        matches!(self, ModuleStatus::Completed | ModuleStatus::Failed)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ModuleStatus::Pending),
            "running" => Ok(ModuleStatus::Running),
            "completed" => Ok(ModuleStatus::Completed),
            "failed" => Ok(ModuleStatus::Failed),
            other => Err(format!("Unknown module status: {other}")),
        }
    }
}

/// Status of the whole run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Failed,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Running => "running",
            CycleStatus::Paused => "paused",
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for CycleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(CycleStatus::Running),
            "paused" => Ok(CycleStatus::Paused),
            "completed" => Ok(CycleStatus::Completed),
            "failed" => Ok(CycleStatus::Failed),
            other => Err(format!("Unknown cycle status: {other}")),
        }
    }
}

/// Health monitor's view of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    #[default]
    Unknown,
    Healthy,
    Warning,
    Stuck,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Stuck => "stuck",
            HealthStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
