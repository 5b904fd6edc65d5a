//! # Worker Runner
//!
//! Wraps any [`Worker`] with the batch loop every module shares: fetch a batch
//! after the resume cursor, process items one at a time with per-item failure
//! isolation, report heartbeats and progress, and honour cooperative stop
//! requests between items.
//!
//! ## Lifecycle
//!
//! ```text
//! Idle -> Running -> Stopping -> Stopped
//!                 \-> Finished
//! ```
//!
//! Both `Stopped` and `Finished` hand back a final [`WorkerStats`]. A runner
//! can be run again once it has left `Running`/`Stopping`.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::traits::{ItemOutcome, ProgressUpdate, RunObserver, Worker, WorkerResult};
use crate::config::WorkerConfig;
use crate::constants::ItemId;
use crate::error::WorkerError;
use crate::utils::{panic_message, sleep_unless_stopped};

/// Runner lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Finished,
}

impl RunnerState {
    pub fn is_active(&self) -> bool {
        matches!(self, RunnerState::Running | RunnerState::Stopping)
    }
}

/// Aggregate counters for one `run()` invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub module: String,
    /// Items attempted, whatever their outcome
    pub items_processed: u64,
    pub items_succeeded: u64,
    /// Failed items, crashes included
    pub items_failed: u64,
    /// Items whose processing panicked
    pub items_crashed: u64,
    pub last_item_id: Option<ItemId>,
    pub total_duration: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `Stopped` or `Finished`
    pub final_state: RunnerState,
}

impl WorkerStats {
    fn new(module: &str) -> Self {
        Self {
            module: module.to_string(),
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
            items_crashed: 0,
            last_item_id: None,
            total_duration: Duration::ZERO,
            started_at: Utc::now(),
            finished_at: None,
            final_state: RunnerState::Running,
        }
    }

    fn record(&mut self, item_id: ItemId, outcome: ItemOutcome) {
        self.items_processed += 1;
        self.last_item_id = Some(item_id);
        match outcome {
            ItemOutcome::Succeeded => self.items_succeeded += 1,
            ItemOutcome::Failed => self.items_failed += 1,
            ItemOutcome::Crashed => {
                self.items_failed += 1;
                self.items_crashed += 1;
            }
        }
    }

    /// Fraction of attempted items that failed
    pub fn failure_ratio(&self) -> f64 {
        if self.items_processed == 0 {
            0.0
        } else {
            self.items_failed as f64 / self.items_processed as f64
        }
    }
}

/// Batch loop around a single [`Worker`]
pub struct WorkerRunner {
    worker: Arc<dyn Worker>,
    config: WorkerConfig,
    state: Mutex<RunnerState>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
}

impl std::fmt::Debug for WorkerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRunner")
            .field("module", &self.worker.module_name())
            .field("state", &*self.state.lock())
            .field("batch_size", &self.config.batch_size)
            .field("delay_between_items_ms", &self.config.delay_between_items_ms)
            .finish()
    }
}

/// Resets the runner out of `Running`/`Stopping` if the run future is dropped
/// or unwinds before reaching its normal exit.
struct RunGuard<'a> {
    state: &'a Mutex<RunnerState>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.is_active() {
            *state = RunnerState::Stopped;
        }
    }
}

impl WorkerRunner {
    pub fn new(worker: Arc<dyn Worker>, config: WorkerConfig) -> Self {
        Self {
            worker,
            config,
            state: Mutex::new(RunnerState::Idle),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
        }
    }

    pub fn module_name(&self) -> &str {
        self.worker.module_name()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state().is_active()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    /// Ask the loop to stop before its next item. Not preemptive: an item that
    /// is already executing runs to completion.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        {
            let mut state = self.state.lock();
            if *state == RunnerState::Running {
                *state = RunnerState::Stopping;
            }
        }
        self.stop_notify.notify_waiters();
        debug!(module = %self.module_name(), "Stop requested");
    }

    /// Process every item after `resume_from` until the worker runs dry or a
    /// stop is requested.
    ///
    /// Item-level errors and panics are counted and never propagate. Only a
    /// failure to fetch the next batch ends the run with an error.
    pub async fn run(
        &self,
        resume_from: Option<ItemId>,
        observer: &dyn RunObserver,
    ) -> Result<WorkerStats, WorkerError> {
        {
            let mut state = self.state.lock();
            if state.is_active() {
                return Err(WorkerError::AlreadyRunning(self.module_name().to_string()));
            }
            *state = RunnerState::Running;
        }
        self.stop_requested.store(false, Ordering::Release);
        let _guard = RunGuard { state: &self.state };

        let module = self.module_name().to_string();
        let run_started = Instant::now();
        let mut stats = WorkerStats::new(&module);
        let mut cursor = resume_from;

        info!(module = %module, resume_from = ?resume_from, batch_size = self.config.batch_size, "Worker run starting");

        'batches: loop {
            if self.is_stop_requested() {
                break;
            }

            observer.on_heartbeat().await;
            let items = self.fetch_batch(cursor).await?;

            // Items at or below the cursor would break the resume guarantee
            let fresh: Vec<ItemId> = items
                .into_iter()
                .filter(|id| cursor.map_or(true, |c| *id > c))
                .collect();

            if fresh.is_empty() {
                debug!(module = %module, cursor = ?cursor, "No more items to process");
                break;
            }

            for item_id in fresh {
                if cursor.is_some_and(|c| item_id <= c) {
                    warn!(module = %module, item_id, cursor = ?cursor, "Skipping out-of-order item");
                    continue;
                }
                if self.is_stop_requested() {
                    break 'batches;
                }

                observer.on_heartbeat().await;
                let (result, outcome) = self.process_one(item_id).await;

                stats.record(item_id, outcome);
                cursor = Some(item_id);

                observer.on_item_result(&result, outcome).await;
                observer
                    .on_progress(ProgressUpdate {
                        last_id: item_id,
                        processed: stats.items_processed,
                        errors: stats.items_failed,
                        crashed: stats.items_crashed,
                    })
                    .await;

                let delay = self.config.delay_between_items();
                if !delay.is_zero()
                    && sleep_unless_stopped(delay, &self.stop_requested, &self.stop_notify).await
                {
                    break 'batches;
                }
            }
        }

        let final_state = if self.is_stop_requested() {
            RunnerState::Stopped
        } else {
            RunnerState::Finished
        };
        *self.state.lock() = final_state;

        stats.total_duration = run_started.elapsed();
        stats.finished_at = Some(Utc::now());
        stats.final_state = final_state;

        info!(
            module = %module,
            state = ?final_state,
            processed = stats.items_processed,
            succeeded = stats.items_succeeded,
            failed = stats.items_failed,
            crashed = stats.items_crashed,
            duration_ms = stats.total_duration.as_millis() as u64,
            "Worker run ended"
        );

        Ok(stats)
    }

    async fn fetch_batch(&self, cursor: Option<ItemId>) -> Result<Vec<ItemId>, WorkerError> {
        let fetch = self
            .worker
            .get_items_to_process(self.config.batch_size, cursor);

        match AssertUnwindSafe(fetch).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => Err(WorkerError::fetch_failed(
                self.module_name(),
                format!("panicked: {}", panic_message(payload.as_ref())),
            )),
        }
    }

    async fn process_one(&self, item_id: ItemId) -> (WorkerResult, ItemOutcome) {
        let started = Instant::now();
        let outcome = AssertUnwindSafe(self.worker.process_item(item_id))
            .catch_unwind()
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Ok(result)) => {
                let kind = if result.success {
                    ItemOutcome::Succeeded
                } else {
                    ItemOutcome::Failed
                };
                debug!(module = %self.module_name(), item_id, success = result.success, "Item processed");
                let result = if result.duration.is_zero() {
                    result.with_duration(elapsed)
                } else {
                    result
                };
                (result, kind)
            }
            Ok(Err(e)) => {
                warn!(module = %self.module_name(), item_id, error = %e, "Item failed");
                (
                    WorkerResult::failure(item_id, "processing error", e.to_string())
                        .with_duration(elapsed),
                    ItemOutcome::Failed,
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(module = %self.module_name(), item_id, panic = %message, "Item processing crashed");
                (
                    WorkerResult::failure(item_id, "processing crashed", message)
                        .with_duration(elapsed),
                    ItemOutcome::Crashed,
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::traits::NoopObserver;
    use async_trait::async_trait;

    struct RangeWorker {
        ids: Vec<ItemId>,
    }

    #[async_trait]
    impl Worker for RangeWorker {
        fn module_name(&self) -> &str {
            "range"
        }

        async fn get_items_to_process(
            &self,
            limit: usize,
            after_id: Option<ItemId>,
        ) -> Result<Vec<ItemId>, WorkerError> {
            Ok(self
                .ids
                .iter()
                .copied()
                .filter(|id| after_id.map_or(true, |a| *id > a))
                .take(limit)
                .collect())
        }

        async fn process_item(&self, item_id: ItemId) -> Result<WorkerResult, WorkerError> {
            if item_id % 4 == 0 {
                Err(WorkerError::item_failed(item_id, "divisible by four"))
            } else {
                Ok(WorkerResult::success(item_id, "ok"))
            }
        }
    }

    fn runner(ids: Vec<ItemId>, batch_size: usize) -> WorkerRunner {
        WorkerRunner::new(
            Arc::new(RangeWorker { ids }),
            WorkerConfig {
                batch_size,
                delay_between_items_ms: 0,
            },
        )
    }

    #[tokio::test]
    async fn test_run_spans_multiple_batches() {
        let runner = runner((1..=10).collect(), 3);
        let stats = runner.run(None, &NoopObserver).await.unwrap();

        assert_eq!(stats.items_processed, 10);
        assert_eq!(stats.items_failed, 2);
        assert_eq!(stats.items_succeeded, 8);
        assert_eq!(stats.last_item_id, Some(10));
        assert_eq!(stats.final_state, RunnerState::Finished);
        assert_eq!(runner.state(), RunnerState::Finished);
    }

    #[tokio::test]
    async fn test_run_resumes_after_cursor() {
        let runner = runner((1..=10).collect(), 4);
        let stats = runner.run(Some(7), &NoopObserver).await.unwrap();
        assert_eq!(stats.items_processed, 3);
        assert_eq!(stats.last_item_id, Some(10));
    }

    #[tokio::test]
    async fn test_stop_before_run_is_cleared_on_start() {
        let runner = runner((1..=3).collect(), 10);
        runner.stop();
        let stats = runner.run(None, &NoopObserver).await.unwrap();
        assert_eq!(stats.items_processed, 3);
    }

    #[tokio::test]
    async fn test_runner_can_run_again_after_finishing() {
        let runner = runner((1..=3).collect(), 10);
        runner.run(None, &NoopObserver).await.unwrap();
        let stats = runner.run(Some(1), &NoopObserver).await.unwrap();
        assert_eq!(stats.items_processed, 2);
    }

    #[test]
    fn test_failure_ratio() {
        let mut stats = WorkerStats::new("ratio");
        assert_eq!(stats.failure_ratio(), 0.0);
        stats.record(1, ItemOutcome::Succeeded);
        stats.record(2, ItemOutcome::Crashed);
        assert_eq!(stats.items_failed, 1);
        assert_eq!(stats.items_crashed, 1);
        assert!((stats.failure_ratio() - 0.5).abs() < f64::EPSILON);
    }
}
