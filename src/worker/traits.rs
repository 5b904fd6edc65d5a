//! # Worker Contract
//!
//! The interface every module implements, plus the callback seam the runner
//! uses to report liveness and progress.
//!
//! ## Obligations on implementers
//!
//! - [`Worker::get_items_to_process`] returns identifiers strictly greater than
//!   `after_id`, in ascending order, so the last processed identifier is a valid
//!   resume boundary.
//! - [`Worker::process_item`] may be called again for an item that was in
//!   flight when the process crashed. The runner never assumes idempotence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::ItemId;
use crate::error::WorkerError;

/// A named, independently schedulable job type
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    /// Module name used as the identity in state, health and logs
    fn module_name(&self) -> &str;

    /// Up to `limit` identifiers greater than `after_id`, ascending
    async fn get_items_to_process(
        &self,
        limit: usize,
        after_id: Option<ItemId>,
    ) -> Result<Vec<ItemId>, WorkerError>;

    /// Process one unit of work
    async fn process_item(&self, item_id: ItemId) -> Result<WorkerResult, WorkerError>;
}

/// Outcome of processing one unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub item_id: ItemId,
    pub success: bool,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub duration: Duration,
    pub error: Option<String>,
}

impl WorkerResult {
    pub fn success(item_id: ItemId, message: impl Into<String>) -> Self {
        Self {
            item_id,
            success: true,
            message: message.into(),
            payload: None,
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn failure(item_id: ItemId, message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item_id,
            success: false,
            message: message.into(),
            payload: None,
            duration: Duration::ZERO,
            error: Some(error.into()),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }
}

/// How the runner classified one item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemOutcome {
    /// `process_item` returned a successful result
    Succeeded,
    /// `process_item` returned `Err` or an unsuccessful result
    Failed,
    /// `process_item` panicked
    Crashed,
}

/// Progress reported after every item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub last_id: ItemId,
    pub processed: u64,
    /// Failed items, crashes included
    pub errors: u64,
    pub crashed: u64,
}

/// Callbacks injected by whoever drives a [`WorkerRunner`](super::WorkerRunner).
///
/// Calls for item N complete before item N+1 starts.
#[async_trait]
pub trait RunObserver: Send + Sync {
    /// Liveness signal, emitted before each batch fetch and each item
    async fn on_heartbeat(&self);

    /// Cursor and counters after an item was attempted
    async fn on_progress(&self, progress: ProgressUpdate);

    /// Per-item result, emitted before `on_progress` for the same item
    async fn on_item_result(&self, _result: &WorkerResult, _outcome: ItemOutcome) {}
}

/// Observer that ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

#[async_trait]
impl RunObserver for NoopObserver {
    async fn on_heartbeat(&self) {}

    async fn on_progress(&self, _progress: ProgressUpdate) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_result_builders() {
        let ok = WorkerResult::success(7, "enriched")
            .with_payload(serde_json::json!({"rating": 4.5}))
            .with_duration(Duration::from_millis(12));
        assert!(ok.success);
        assert_eq!(ok.error, None);
        assert_eq!(ok.payload.unwrap()["rating"], 4.5);

        let failed = WorkerResult::failure(8, "page not found", "HTTP 404");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("HTTP 404"));
    }

    #[test]
    fn test_worker_trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn Worker) {}
        fn _assert_observer_object_safe(_: &dyn RunObserver) {}
    }
}
