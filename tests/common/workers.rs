//! Scripted workers and observers for driving the runner and orchestrator.

use async_trait::async_trait;
use cycle_orchestrator::worker::{ItemOutcome, ProgressUpdate, RunObserver, Worker, WorkerResult};
use cycle_orchestrator::{ItemId, WorkerError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What a [`ScriptedWorker`] does with one item
#[derive(Debug, Clone, Copy)]
pub enum Behavior {
    Succeed,
    /// Returns an unsuccessful result
    Reject,
    /// Returns `Err`
    Error,
    Panic,
    /// Sleeps, then succeeds
    Sleep(Duration),
}

/// Worker over a fixed ascending item list with per-item behaviour
pub struct ScriptedWorker {
    name: String,
    items: Vec<ItemId>,
    behaviors: HashMap<ItemId, Behavior>,
    attempted: Mutex<Vec<ItemId>>,
    fetches: AtomicUsize,
}

impl ScriptedWorker {
    pub fn new(name: &str, items: impl IntoIterator<Item = ItemId>) -> Self {
        let mut items: Vec<ItemId> = items.into_iter().collect();
        items.sort_unstable();
        items.dedup();
        Self {
            name: name.to_string(),
            items,
            behaviors: HashMap::new(),
            attempted: Mutex::new(Vec::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, item_id: ItemId, behavior: Behavior) -> Self {
        self.behaviors.insert(item_id, behavior);
        self
    }

    /// Items handed to `process_item`, in call order
    pub fn attempted(&self) -> Vec<ItemId> {
        self.attempted.lock().clone()
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    fn module_name(&self) -> &str {
        &self.name
    }

    async fn get_items_to_process(&self, limit: usize, after_id: Option<ItemId>) -> Result<Vec<ItemId>, WorkerError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .items
            .iter()
            .copied()
            .filter(|id| after_id.map_or(true, |after| *id > after))
            .take(limit)
            .collect())
    }

    async fn process_item(&self, item_id: ItemId) -> Result<WorkerResult, WorkerError> {
        self.attempted.lock().push(item_id);
        match self.behaviors.get(&item_id).copied().unwrap_or(Behavior::Succeed) {
            Behavior::Succeed => Ok(WorkerResult::success(item_id, "listing enriched")),
            Behavior::Reject => Ok(WorkerResult::failure(item_id, "listing rejected", "no phone number")),
            Behavior::Error => Err(WorkerError::item_failed(item_id, "upstream returned 503")),
            Behavior::Panic => panic!("scripted crash on item {item_id}"),
            Behavior::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                Ok(WorkerResult::success(item_id, "slow listing enriched"))
            }
        }
    }
}

/// Worker whose batch fetch always fails
pub struct BrokenSourceWorker {
    pub name: String,
}

#[async_trait]
impl Worker for BrokenSourceWorker {
    fn module_name(&self) -> &str {
        &self.name
    }

    async fn get_items_to_process(&self, _limit: usize, _after_id: Option<ItemId>) -> Result<Vec<ItemId>, WorkerError> {
        Err(WorkerError::fetch_failed(&self.name, "directory site unreachable"))
    }

    async fn process_item(&self, item_id: ItemId) -> Result<WorkerResult, WorkerError> {
        Ok(WorkerResult::success(item_id, "unreachable"))
    }
}

/// Observer that records every callback in order
#[derive(Default)]
pub struct RecordingObserver {
    pub events: Mutex<Vec<String>>,
    pub progress: Mutex<Vec<ProgressUpdate>>,
    pub heartbeats: AtomicUsize,
}

impl RecordingObserver {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn progress(&self) -> Vec<ProgressUpdate> {
        self.progress.lock().clone()
    }
}

#[async_trait]
impl RunObserver for RecordingObserver {
    async fn on_heartbeat(&self) {
        self.heartbeats.fetch_add(1, Ordering::SeqCst);
        self.events.lock().push("heartbeat".to_string());
    }

    async fn on_progress(&self, progress: ProgressUpdate) {
        self.events.lock().push(format!("progress:{}", progress.last_id));
        self.progress.lock().push(progress);
    }

    async fn on_item_result(&self, result: &WorkerResult, outcome: ItemOutcome) {
        self.events.lock().push(format!("result:{}:{:?}", result.item_id, outcome));
    }
}
