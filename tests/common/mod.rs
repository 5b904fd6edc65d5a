#![allow(dead_code)]

pub mod workers;

pub use workers::*;

use cycle_orchestrator::config::{CycleConfig, PathsConfig, ResourceConfig};
use cycle_orchestrator::resources::{ResourceManager, StaticMemoryProbe};
use std::sync::Arc;
use tempfile::TempDir;

/// Configuration with every delay zeroed and all files under `dir`
pub fn test_config(dir: &TempDir, modules: &[&str]) -> CycleConfig {
    let mut config = CycleConfig {
        paths: PathsConfig {
            log_dir: dir.path().join("logs"),
            state_file: dir.path().join("data/cycle_state.json"),
        },
        ..CycleConfig::default()
    };
    config.orchestrator.modules = modules.iter().map(|m| m.to_string()).collect();
    config.orchestrator.delay_between_cycles_seconds = 0;
    config.orchestrator.delay_between_modules_seconds = 0;
    config.orchestrator.error_backoff_seconds = 0;
    config.orchestrator.stop_grace_period_seconds = 1;
    config.worker.delay_between_items_ms = 0;
    config.worker.batch_size = 2;
    config
}

/// Resource manager without a database, reporting `memory_usage` of total memory
pub fn test_resources(memory_usage: f64) -> Arc<ResourceManager> {
    Arc::new(
        ResourceManager::without_database(ResourceConfig::default())
            .with_memory_probe(Box::new(StaticMemoryProbe::new(memory_usage))),
    )
}

pub fn module_names(modules: &[&str]) -> Vec<String> {
    modules.iter().map(|m| m.to_string()).collect()
}
