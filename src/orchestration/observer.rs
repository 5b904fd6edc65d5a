//! Wires a module's runner callbacks into the health monitor, the state store
//! and the activity log.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::activity_log::{ActivityEvent, ActivityLog};
use crate::constants::defaults;
use crate::health::HealthMonitor;
use crate::state::{ModuleUpdate, RotationId, StateStore};
use crate::worker::{ItemOutcome, ProgressUpdate, RunObserver, WorkerResult};

/// Counters persisted for a module before the current run started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BaseCounts {
    pub processed: u64,
    pub errors: u64,
    pub crashed: u64,
}

/// Observer for one module run.
///
/// The runner counts from zero on every run; the counters persisted before a
/// resume are added so the stored totals cover the whole cycle.
///
/// The health monitor sees every heartbeat. The state store only sees one when
/// nothing was persisted for `heartbeat_persist_interval`, since every progress
/// write already stamps the heartbeat.
pub struct ModuleObserver {
    module: String,
    state: Arc<StateStore>,
    health: Arc<HealthMonitor>,
    activity: Arc<ActivityLog>,
    base: BaseCounts,
    rotation: Option<RotationId>,
    heartbeat_persist_interval: Duration,
    last_persisted: Mutex<Option<Instant>>,
}

impl ModuleObserver {
    pub fn new(
        module: impl Into<String>,
        state: Arc<StateStore>,
        health: Arc<HealthMonitor>,
        activity: Arc<ActivityLog>,
    ) -> Self {
        Self {
            module: module.into(),
            state,
            health,
            activity,
            base: BaseCounts::default(),
            rotation: None,
            heartbeat_persist_interval: Duration::from_secs(defaults::HEARTBEAT_PERSIST_INTERVAL_SECONDS),
            last_persisted: Mutex::new(None),
        }
    }

    /// Counters already persisted for this cycle
    pub fn with_base_counts(mut self, base: BaseCounts) -> Self {
        self.base = base;
        self
    }

    /// Drop progress once `rotation` is no longer the current one
    pub fn with_rotation(mut self, rotation: RotationId) -> Self {
        self.rotation = Some(rotation);
        self
    }

    pub fn with_heartbeat_persist_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_persist_interval = interval;
        self
    }

    fn heartbeat_write_due(&self) -> bool {
        let last = self.last_persisted.lock();
        last.map_or(true, |at| at.elapsed() >= self.heartbeat_persist_interval)
    }

    fn mark_persisted(&self) {
        *self.last_persisted.lock() = Some(Instant::now());
    }
}

#[async_trait]
impl RunObserver for ModuleObserver {
    async fn on_heartbeat(&self) {
        self.health.record_heartbeat(&self.module);
        if !self.heartbeat_write_due() {
            return;
        }
        match self.state.heartbeat(&self.module).await {
            Ok(()) => self.mark_persisted(),
            Err(e) => warn!(module = %self.module, error = %e, "Failed to persist heartbeat"),
        }
    }

    async fn on_progress(&self, progress: ProgressUpdate) {
        let update = ModuleUpdate::progress(
            progress.last_id,
            self.base.processed + progress.processed,
            self.base.errors + progress.errors,
        )
        .with_crashed(self.base.crashed + progress.crashed)
        .with_heartbeat();
        let written = match &self.rotation {
            Some(rotation) => self.state.update_module_in_rotation(&self.module, update, rotation).await,
            None => self.state.update_module_progress(&self.module, update).await.map(|()| true),
        };
        match written {
            Ok(true) => self.mark_persisted(),
            Ok(false) => debug!(module = %self.module, last_id = progress.last_id, "Rotation no longer current; progress dropped"),
            Err(e) => {
                warn!(module = %self.module, last_id = progress.last_id, error = %e, "Failed to persist progress")
            }
        }
    }

    async fn on_item_result(&self, result: &WorkerResult, outcome: ItemOutcome) {
        let (event, line) = match outcome {
            ItemOutcome::Succeeded => (
                ActivityEvent::Ok,
                format!("item {}: {}", result.item_id, result.message),
            ),
            ItemOutcome::Failed | ItemOutcome::Crashed => {
                let event = if outcome == ItemOutcome::Crashed {
                    ActivityEvent::Crash
                } else {
                    ActivityEvent::Fail
                };
                (
                    event,
                    format!(
                        "item {}: {} ({})",
                        result.item_id,
                        result.message,
                        result.error.as_deref().unwrap_or("no detail")
                    ),
                )
            }
        };
        self.activity.record(&self.module, event, &line).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use tempfile::TempDir;

    fn fixture(dir: &TempDir) -> (Arc<StateStore>, Arc<HealthMonitor>, Arc<ActivityLog>) {
        (
            Arc::new(StateStore::file_only(dir.path().join("state.json"), vec!["maps".to_string()])),
            Arc::new(HealthMonitor::new(HealthConfig::default())),
            Arc::new(ActivityLog::new(dir.path().join("logs"))),
        )
    }

    #[tokio::test]
    async fn test_progress_adds_base_counts() {
        let dir = TempDir::new().unwrap();
        let (state, health, activity) = fixture(&dir);

        let observer = ModuleObserver::new("maps", state.clone(), health.clone(), activity.clone())
            .with_base_counts(BaseCounts { processed: 42, errors: 2, crashed: 1 });
        observer
            .on_progress(ProgressUpdate { last_id: 43, processed: 1, errors: 0, crashed: 0 })
            .await;
        observer.on_heartbeat().await;
        observer
            .on_item_result(&WorkerResult::failure(44, "lookup", "timeout"), ItemOutcome::Failed)
            .await;

        let cycle = state.get_or_create_cycle().await.unwrap();
        let maps = cycle.module("maps").unwrap();
        assert_eq!(maps.last_processed_id, Some(43));
        assert_eq!(maps.items_processed, 43);
        assert_eq!(maps.items_errored, 2);
        assert_eq!(maps.items_crashed, 1);
        assert!(maps.last_heartbeat.is_some());
        assert!(health.get_health("maps").unwrap().last_heartbeat.is_some());

        let lines = activity.tail("maps", 5).await.unwrap();
        assert!(lines[0].ends_with("[FAIL] item 44: lookup (timeout)"));
    }

    #[tokio::test]
    async fn test_heartbeats_between_writes_are_not_persisted() {
        let dir = TempDir::new().unwrap();
        let (state, health, activity) = fixture(&dir);
        let observer = ModuleObserver::new("maps", state.clone(), health.clone(), activity)
            .with_heartbeat_persist_interval(Duration::from_secs(60));

        observer.on_heartbeat().await;
        let first = state.get_or_create_cycle().await.unwrap().module("maps").unwrap().last_heartbeat;
        assert!(first.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        observer.on_heartbeat().await;
        let second = state.get_or_create_cycle().await.unwrap().module("maps").unwrap().last_heartbeat;
        assert_eq!(second, first);
        assert!(health.get_health("maps").unwrap().last_heartbeat.is_some());

        tokio::time::sleep(Duration::from_millis(20)).await;
        observer
            .on_progress(ProgressUpdate { last_id: 1, processed: 1, errors: 0, crashed: 0 })
            .await;
        let third = state.get_or_create_cycle().await.unwrap().module("maps").unwrap().last_heartbeat;
        assert!(third > first);
    }
}
