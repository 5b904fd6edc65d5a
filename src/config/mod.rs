//! # Orchestrator Configuration
//!
//! Explicit, validated configuration for every component of the cycle
//! orchestrator. Components receive the slice they need at construction time;
//! nothing reads global state after loading.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use cycle_orchestrator::config::ConfigManager;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load(Some(Path::new("config/orchestrator.toml")))?;
//! let timeout = manager.config().health.heartbeat_timeout();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::defaults;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration for the orchestrator and its collaborators
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CycleConfig {
    pub paths: PathsConfig,
    pub database: DatabaseConfig,
    pub orchestrator: OrchestratorConfig,
    pub worker: WorkerConfig,
    pub health: HealthConfig,
    pub resources: ResourceConfig,
}

/// Filesystem locations used by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PathsConfig {
    /// Directory holding the per-module activity logs
    pub log_dir: PathBuf,
    /// JSON mirror of the cycle state
    pub state_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            state_file: PathBuf::from("data/cycle_state.json"),
        }
    }
}

/// Connection pool settings. A missing `url` runs the system file-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
    pub max_lifetime_seconds: u64,
    pub slow_acquire_threshold_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: 10,
            min_connections: 1,
            acquire_timeout_seconds: 10,
            idle_timeout_seconds: 300,
            max_lifetime_seconds: 1800,
            slow_acquire_threshold_ms: 100,
        }
    }
}

impl DatabaseConfig {
    /// Database URL trimmed to a loggable prefix, credentials masked
    pub fn sanitized_url(&self) -> Option<String> {
        self.url.as_deref().map(|url| match url.split_once('@') {
            Some((_, host)) => match url.split_once("://") {
                Some((scheme, _)) => format!("{scheme}://***@{host}"),
                None => format!("***@{host}"),
            },
            None => url.chars().take(30).collect(),
        })
    }
}

/// Cycle loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Fixed rotation order of module names
    pub modules: Vec<String>,
    pub delay_between_cycles_seconds: u64,
    pub delay_between_modules_seconds: u64,
    /// Backoff after an unexpected error inside a cycle
    pub error_backoff_seconds: u64,
    /// How long a cycle waits for module tasks after a stop request
    pub stop_grace_period_seconds: u64,
    /// A module is failed when `failed > threshold * processed`
    pub failure_ratio_threshold: f64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            modules: Vec::new(),
            delay_between_cycles_seconds: defaults::DELAY_BETWEEN_CYCLES_SECONDS,
            delay_between_modules_seconds: defaults::DELAY_BETWEEN_MODULES_SECONDS,
            error_backoff_seconds: defaults::ERROR_BACKOFF_SECONDS,
            stop_grace_period_seconds: defaults::STOP_GRACE_PERIOD_SECONDS,
            failure_ratio_threshold: defaults::FAILURE_RATIO_THRESHOLD,
        }
    }
}

impl OrchestratorConfig {
    pub fn delay_between_cycles(&self) -> Duration {
        Duration::from_secs(self.delay_between_cycles_seconds)
    }

    pub fn delay_between_modules(&self) -> Duration {
        Duration::from_secs(self.delay_between_modules_seconds)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_seconds)
    }

    pub fn stop_grace_period(&self) -> Duration {
        Duration::from_secs(self.stop_grace_period_seconds)
    }
}

/// Worker runner settings shared by every module
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    pub batch_size: usize,
    pub delay_between_items_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: defaults::BATCH_SIZE,
            delay_between_items_ms: defaults::DELAY_BETWEEN_ITEMS_MS,
        }
    }
}

impl WorkerConfig {
    pub fn delay_between_items(&self) -> Duration {
        Duration::from_millis(self.delay_between_items_ms)
    }
}

/// Heartbeat and failure tracking thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthConfig {
    pub heartbeat_timeout_seconds: u64,
    pub check_interval_seconds: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_seconds: defaults::HEARTBEAT_TIMEOUT_SECONDS,
            check_interval_seconds: defaults::HEALTH_CHECK_INTERVAL_SECONDS,
            max_consecutive_failures: defaults::MAX_CONSECUTIVE_FAILURES,
        }
    }
}

impl HealthConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

/// Memory thresholds are fractions of total system memory
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ResourceConfig {
    pub memory_warning_threshold: f64,
    pub memory_critical_threshold: f64,
    /// Number of cleanup passes performed between cycles
    pub cleanup_passes: u32,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            memory_warning_threshold: defaults::MEMORY_WARNING_THRESHOLD,
            memory_critical_threshold: defaults::MEMORY_CRITICAL_THRESHOLD,
            cleanup_passes: defaults::CLEANUP_PASSES,
        }
    }
}

impl CycleConfig {
    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.orchestrator.modules.is_empty() {
            return Err(ConfigurationError::invalid_value(
                "orchestrator.modules",
                "[]",
                "at least one module must be configured",
            ));
        }

        let mut seen = HashSet::new();
        for module in &self.orchestrator.modules {
            if module.trim().is_empty() {
                return Err(ConfigurationError::invalid_value(
                    "orchestrator.modules",
                    module,
                    "module names must not be blank",
                ));
            }
            if !seen.insert(module.as_str()) {
                return Err(ConfigurationError::invalid_value(
                    "orchestrator.modules",
                    module,
                    "module names must be unique",
                ));
            }
        }

        let ratio = self.orchestrator.failure_ratio_threshold;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(ConfigurationError::invalid_value(
                "orchestrator.failure_ratio_threshold",
                ratio,
                "must be between 0.0 and 1.0",
            ));
        }

        if self.worker.batch_size == 0 {
            return Err(ConfigurationError::invalid_value(
                "worker.batch_size",
                0,
                "must be greater than zero",
            ));
        }

        if self.health.heartbeat_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "health.heartbeat_timeout_seconds",
                0,
                "must be greater than zero",
            ));
        }

        if self.health.check_interval_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "health.check_interval_seconds",
                0,
                "must be greater than zero",
            ));
        }

        let warning = self.resources.memory_warning_threshold;
        let critical = self.resources.memory_critical_threshold;
        for (field, value) in [
            ("resources.memory_warning_threshold", warning),
            ("resources.memory_critical_threshold", critical),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value,
                    "must be in (0.0, 1.0]",
                ));
            }
        }
        if warning >= critical {
            return Err(ConfigurationError::invalid_value(
                "resources.memory_warning_threshold",
                warning,
                "must be lower than the critical threshold",
            ));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(ConfigurationError::invalid_value(
                "database.min_connections",
                self.database.min_connections,
                "must not exceed max_connections",
            ));
        }

        Ok(())
    }
}
