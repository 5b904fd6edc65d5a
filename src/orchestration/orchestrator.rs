//! # Orchestrator
//!
//! Composes the worker runners, state store, health monitor, resource manager
//! and activity log into the cycle supervisor.
//!
//! ## Control flow
//!
//! ```text
//! start() -> control loop: run_cycle() -> sleep delay_between_cycles -> run_cycle() ...
//!                              |
//!                              +-- one tokio task per module, in parallel
//!                              +-- wait for all (grace period after stop)
//!                              +-- complete rotation, between-cycle cleanup
//! ```
//!
//! An error inside a cycle is logged and the loop backs off for
//! `error_backoff_seconds`; nothing short of `stop()` ends the loop.
//!
//! The health monitor's stuck callback stops that module's runner. The module
//! keeps its `running` status and is resumed from its cursor when the next
//! rotation begins.
//!
//! A runner left detached by `stop()` may still be busy when a later rotation
//! reaches it. That module is deferred: no state or log writes, and the
//! rotation stays open (uncounted) until the module has actually run. A module
//! task only writes its final status while the rotation it began in is still
//! current.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::activity_log::{ActivityEvent, ActivityLog};
use super::observer::{BaseCounts, ModuleObserver};
use crate::config::{CycleConfig, OrchestratorConfig, WorkerConfig};
use crate::constants::{ModuleStatus, ORCHESTRATOR_LOG};
use crate::error::{OrchestratorError, Result, WorkerError};
use crate::health::{HealthMonitor, ModuleHealth};
use crate::logging::{log_error, log_module_operation};
use crate::resources::{PoolStatus, ResourceManager};
use crate::state::{ModuleState, ModuleUpdate, RotationId, RotationStart, StateStore, StatusSnapshot};
use crate::utils::{panic_message, sleep_unless_stopped};
use crate::worker::{RunnerState, Worker, WorkerRunner, WorkerStats};

/// How one module's run in a rotation ended
#[derive(Debug, Clone, Serialize)]
pub struct ModuleOutcome {
    pub module: String,
    /// Status recorded in the state store
    pub status: ModuleStatus,
    pub stats: Option<WorkerStats>,
    pub error: Option<String>,
    /// `false` when the module's runner never started in this rotation
    pub attempted: bool,
}

impl ModuleOutcome {
    fn new(module: &str, status: ModuleStatus) -> Self {
        Self {
            module: module.to_string(),
            status,
            stats: None,
            error: None,
            attempted: true,
        }
    }

    /// The runner was not started; the module keeps whatever status it had
    fn not_attempted(module: &str, status: ModuleStatus, reason: &str) -> Self {
        Self {
            attempted: false,
            ..Self::new(module, status).with_error(reason)
        }
    }

    fn with_stats(mut self, stats: WorkerStats) -> Self {
        self.stats = Some(stats);
        self
    }

    fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Summary of one `run_cycle` call
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub rotation: RotationStart,
    /// Completed rotations after this one
    pub cycle_count: u64,
    /// Modules that ran, in rotation order
    pub outcomes: Vec<ModuleOutcome>,
    /// Modules already terminal when a resumed rotation began
    pub skipped: Vec<String>,
    /// Modules whose runner was not started this rotation, usually because it
    /// was still busy from an earlier run. The rotation stays open for them.
    pub deferred: Vec<String>,
    /// A stop request cut the rotation short; it was not counted
    pub interrupted: bool,
}

impl CycleReport {
    pub fn outcome(&self, module: &str) -> Option<&ModuleOutcome> {
        self.outcomes.iter().find(|o| o.module == module)
    }
}

/// Runner state as shown on the dashboard
#[derive(Debug, Clone, Serialize)]
pub struct RunnerStatus {
    pub module: String,
    pub state: RunnerState,
}

/// Everything a dashboard needs in one call
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStatus {
    pub running: bool,
    pub cycles_completed_this_run: u64,
    pub cycle: StatusSnapshot,
    pub health: Vec<ModuleHealth>,
    pub runners: Vec<RunnerStatus>,
    pub pool: PoolStatus,
    pub checked_at: DateTime<Utc>,
}

struct Shared {
    config: OrchestratorConfig,
    worker_config: WorkerConfig,
    runners: DashMap<String, Arc<WorkerRunner>>,
    state: Arc<StateStore>,
    health: Arc<HealthMonitor>,
    resources: Arc<ResourceManager>,
    activity: Arc<ActivityLog>,
    running: AtomicBool,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    cycles_completed: AtomicU64,
}

pub struct Orchestrator {
    shared: Arc<Shared>,
    control: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("modules", &self.shared.config.modules)
            .field("registered", &self.shared.runners.len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl Orchestrator {
    /// Build the orchestrator and its collaborators from validated
    /// configuration. The state store uses the resource manager's database
    /// when one is reachable and the JSON file otherwise.
    pub async fn new(config: CycleConfig, resources: Arc<ResourceManager>) -> Result<Self> {
        config.validate()?;

        let state = Arc::new(
            StateStore::open(
                config.paths.state_file.clone(),
                config.orchestrator.modules.clone(),
                Some(resources.clone()),
            )
            .await,
        );
        let health = Arc::new(HealthMonitor::new(config.health.clone()));
        let activity = Arc::new(ActivityLog::new(config.paths.log_dir.clone()));

        for module in &config.orchestrator.modules {
            health.register_module(module);
        }

        let shared = Arc::new(Shared {
            config: config.orchestrator,
            worker_config: config.worker,
            runners: DashMap::new(),
            state,
            health,
            resources,
            activity,
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            cycles_completed: AtomicU64::new(0),
        });
        Shared::wire_health_callbacks(&shared);

        Ok(Self {
            shared,
            control: Mutex::new(None),
        })
    }

    pub fn modules(&self) -> &[String] {
        &self.shared.config.modules
    }

    pub fn state_store(&self) -> &Arc<StateStore> {
        &self.shared.state
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.shared.health
    }

    pub fn activity_log(&self) -> &Arc<ActivityLog> {
        &self.shared.activity
    }

    /// Attach the worker for one configured module. Must happen before
    /// `start()`; registering again replaces the previous worker.
    pub fn register_worker(&self, worker: Arc<dyn Worker>) -> std::result::Result<(), OrchestratorError> {
        let module = worker.module_name().to_string();
        if self.is_running() {
            return Err(OrchestratorError::RunningConflict(format!("register worker {module}")));
        }
        if !self.shared.config.modules.contains(&module) {
            return Err(OrchestratorError::UnknownModule(module));
        }

        let runner = Arc::new(WorkerRunner::new(worker, self.shared.worker_config.clone()));
        if self.shared.runners.insert(module.clone(), runner).is_some() {
            warn!(module = %module, "Replaced previously registered worker");
        }
        info!(module = %module, "Worker registered");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start the health monitor and the background control loop
    pub async fn start(&self) -> std::result::Result<(), OrchestratorError> {
        if self.is_running() {
            return Err(OrchestratorError::AlreadyRunning);
        }
        {
            let mut control = self.control.lock();
            if control.as_ref().is_some_and(|handle| !handle.is_finished()) {
                return Err(OrchestratorError::RunningConflict(
                    "previous control loop still shutting down".to_string(),
                ));
            }
            *control = None;
        }
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(OrchestratorError::AlreadyRunning);
        }
        self.shared.stop_requested.store(false, Ordering::Release);

        let missing: Vec<&String> = self
            .shared
            .config
            .modules
            .iter()
            .filter(|m| !self.shared.runners.contains_key(*m))
            .collect();
        if !missing.is_empty() {
            warn!(modules = ?missing, "Modules without a registered worker will be marked failed each cycle");
        }

        self.shared.health.start();
        self.shared
            .activity
            .record(ORCHESTRATOR_LOG, ActivityEvent::Start, "Orchestrator started")
            .await;

        let shared = Arc::clone(&self.shared);
        *self.control.lock() = Some(tokio::spawn(async move {
            shared.control_loop().await;
        }));

        info!(modules = ?self.shared.config.modules, "Orchestrator started");
        Ok(())
    }

    /// Stop the control loop and every running module, waiting up to
    /// `timeout` for the loop to exit.
    ///
    /// A module that ignores its stop flag is left running detached. The
    /// health monitor is stopped and between-cycle cleanup runs either way;
    /// the timeout is reported as [`OrchestratorError::StopTimeout`] and
    /// `start()` is refused until the old loop has exited.
    pub async fn stop(&self, timeout: Duration) -> std::result::Result<(), OrchestratorError> {
        if !self.is_running() {
            return Ok(());
        }

        info!(timeout_ms = timeout.as_millis() as u64, "Stopping orchestrator");
        self.shared.stop_requested.store(true, Ordering::Release);
        self.shared.stop_notify.notify_waiters();
        for runner in self.shared.runner_list() {
            runner.stop();
        }

        let control = self.control.lock().take();
        let mut result = Ok(());
        if let Some(mut control) = control {
            match tokio::time::timeout(timeout, &mut control).await {
                Ok(Ok(())) => debug!("Control loop exited"),
                Ok(Err(e)) => error!(error = %e, "Control loop ended abnormally"),
                Err(_) => {
                    warn!(timeout_ms = timeout.as_millis() as u64, "Control loop did not stop in time; detaching");
                    *self.control.lock() = Some(control);
                    result = Err(OrchestratorError::StopTimeout(timeout));
                }
            }
        }

        self.shared.health.stop().await;
        self.shared.resources.cleanup_between_cycles().await;
        self.shared.running.store(false, Ordering::Release);
        self.shared
            .activity
            .record(ORCHESTRATOR_LOG, ActivityEvent::Stop, "Orchestrator stopped")
            .await;
        info!("Orchestrator stopped");
        result
    }

    /// Run one full parallel rotation in the caller's task
    pub async fn run_cycle(&self) -> Result<CycleReport> {
        self.shared.run_cycle().await
    }

    /// Ask one module's runner to stop before its next item
    pub fn stop_worker(&self, module: &str) -> std::result::Result<(), OrchestratorError> {
        self.shared.stop_worker(module)
    }

    pub async fn get_status(&self) -> Result<OrchestratorStatus> {
        let cycle = self.shared.state.get_status().await?;
        let mut runners: Vec<RunnerStatus> = self
            .shared
            .runner_list()
            .iter()
            .map(|r| RunnerStatus {
                module: r.module_name().to_string(),
                state: r.state(),
            })
            .collect();
        runners.sort_by(|a, b| a.module.cmp(&b.module));

        Ok(OrchestratorStatus {
            running: self.is_running(),
            cycles_completed_this_run: self.shared.cycles_completed.load(Ordering::Acquire),
            cycle,
            health: self.shared.health.get_all_health(),
            runners,
            pool: self.shared.resources.pool_status(),
            checked_at: Utc::now(),
        })
    }

    /// Last `limit` activity lines for a module or for `"orchestrator"`
    pub async fn get_logs(&self, name: &str, limit: usize) -> std::result::Result<Vec<String>, OrchestratorError> {
        if name != ORCHESTRATOR_LOG && !self.shared.config.modules.iter().any(|m| m == name) {
            return Err(OrchestratorError::UnknownModule(name.to_string()));
        }
        self.shared.activity.tail(name, limit).await
    }

    pub async fn clear_logs(&self) -> std::result::Result<usize, OrchestratorError> {
        let cleared = self.shared.activity.clear_all().await?;
        info!(files = cleared, "Activity logs cleared");
        Ok(cleared)
    }

    /// Discard all persisted progress. Refused while running.
    pub async fn reset_state(&self) -> Result<()> {
        if self.is_running() {
            return Err(OrchestratorError::RunningConflict("reset state".to_string()).into());
        }
        self.shared.state.reset_state().await?;
        for module in &self.shared.config.modules {
            self.shared.health.reset_health(module);
        }
        self.shared
            .activity
            .record(ORCHESTRATOR_LOG, ActivityEvent::Info, "State reset")
            .await;
        Ok(())
    }
}

impl Shared {
    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::Acquire)
    }

    fn runner_list(&self) -> Vec<Arc<WorkerRunner>> {
        self.runners.iter().map(|entry| entry.value().clone()).collect()
    }

    fn stop_worker(&self, module: &str) -> std::result::Result<(), OrchestratorError> {
        let runner = self
            .runners
            .get(module)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| OrchestratorError::UnknownModule(module.to_string()))?;
        runner.stop();
        Ok(())
    }

    /// Callbacks hold a weak reference so the monitor does not keep the
    /// orchestrator alive
    fn wire_health_callbacks(shared: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(shared);
        let on_stuck = weak.clone();
        shared.health.set_on_stuck(Arc::new(move |module: &str| {
            let Some(shared) = on_stuck.upgrade() else {
                return;
            };
            warn!(module = %module, "Stopping stuck module");
            if let Err(e) = shared.stop_worker(module) {
                debug!(module = %module, error = %e, "No runner to stop");
            }
            let timeout = shared.health.config().heartbeat_timeout_seconds;
            shared.activity.record_detached(
                module,
                ActivityEvent::Stuck,
                format!("No heartbeat for over {timeout}s; stop requested"),
            );
        }));

        let on_recovered = weak.clone();
        shared.health.set_on_recovered(Arc::new(move |module: &str| {
            if let Some(shared) = on_recovered.upgrade() {
                shared
                    .activity
                    .record_detached(module, ActivityEvent::Recovered, "Heartbeat resumed".to_string());
            }
        }));

        let on_failure = weak;
        shared.health.set_on_failure(Arc::new(move |module: &str| {
            if let Some(shared) = on_failure.upgrade() {
                let limit = shared.health.config().max_consecutive_failures;
                shared.activity.record_detached(
                    ORCHESTRATOR_LOG,
                    ActivityEvent::Fail,
                    format!("{module} failed {limit} consecutive runs"),
                );
            }
        }));
    }

    async fn control_loop(self: Arc<Self>) {
        if let Err(e) = self.state.get_or_create_cycle().await {
            log_error("orchestrator", "load_cycle", &e.to_string(), None);
        }

        while !self.is_stop_requested() {
            let delay = match self.run_cycle().await {
                Ok(report) => {
                    if report.interrupted {
                        break;
                    }
                    self.config.delay_between_cycles()
                }
                Err(e) => {
                    log_error("orchestrator", "run_cycle", &e.to_string(), Some("backing off"));
                    self.activity
                        .record(ORCHESTRATOR_LOG, ActivityEvent::Fail, &format!("Cycle error: {e}"))
                        .await;
                    self.config.error_backoff()
                }
            };

            if sleep_unless_stopped(delay, &self.stop_requested, &self.stop_notify).await {
                break;
            }
        }
        debug!("Control loop finished");
    }

    async fn run_cycle(self: &Arc<Self>) -> Result<CycleReport> {
        let rotation = self.state.begin_rotation().await?;
        let cycle = self.state.get_or_create_cycle().await?;
        let rotation_id = cycle.rotation_id();
        let cycle_number = cycle.cycle_count + 1;

        info!(cycle_id = %cycle.cycle_id, cycle = cycle_number, rotation = ?rotation, "Cycle starting");
        self.activity
            .record(
                ORCHESTRATOR_LOG,
                ActivityEvent::Start,
                &format!("Cycle {cycle_number} starting ({rotation:?})"),
            )
            .await;

        let mut handles: Vec<(String, JoinHandle<ModuleOutcome>)> = Vec::new();
        let mut outcomes = Vec::new();
        let mut skipped = Vec::new();

        for (index, module) in self.config.modules.iter().enumerate() {
            if self.is_stop_requested() {
                break;
            }
            if cycle.module(module).is_some_and(|m| m.status.is_terminal()) {
                debug!(module = %module, "Already finished this rotation; skipping");
                skipped.push(module.clone());
                continue;
            }

            let Some(runner) = self.runners.get(module).map(|entry| entry.value().clone()) else {
                outcomes.push(self.record_unregistered(module).await);
                continue;
            };

            if index > 0
                && sleep_unless_stopped(self.config.delay_between_modules(), &self.stop_requested, &self.stop_notify)
                    .await
            {
                break;
            }

            if runner.is_running() {
                warn!(module = %module, "Runner still busy from an earlier run; deferring");
                let status = cycle.module(module).map_or(ModuleStatus::Running, |m| m.status);
                outcomes.push(ModuleOutcome::not_attempted(module, status, "runner still busy"));
                continue;
            }

            let shared = Arc::clone(self);
            let rotation_id = rotation_id.clone();
            handles.push((
                module.clone(),
                tokio::spawn(async move { shared.run_module(runner, rotation_id).await }),
            ));
        }

        outcomes.extend(self.join_modules(handles).await);
        let interrupted = self.is_stop_requested();
        let deferred: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.attempted)
            .map(|o| o.module.clone())
            .collect();

        let cycle_count = if interrupted {
            info!(cycle_id = %cycle.cycle_id, "Cycle interrupted by stop request");
            cycle.cycle_count
        } else if !deferred.is_empty() {
            info!(cycle_id = %cycle.cycle_id, deferred = ?deferred, "Rotation left open for busy modules");
            cycle.cycle_count
        } else {
            let count = self.state.complete_rotation().await?;
            self.resources.cleanup_between_cycles().await;
            self.cycles_completed.fetch_add(1, Ordering::AcqRel);
            count
        };

        let failed = outcomes.iter().filter(|o| o.status == ModuleStatus::Failed).count();
        let modules_run = outcomes.len() - deferred.len();
        let verdict = if interrupted {
            "interrupted".to_string()
        } else if deferred.is_empty() {
            "completed".to_string()
        } else {
            format!("left open for {}", deferred.join(", "))
        };
        info!(
            cycle_id = %cycle.cycle_id,
            cycle_count,
            modules_run,
            modules_failed = failed,
            interrupted,
            "Cycle finished"
        );
        self.activity
            .record(
                ORCHESTRATOR_LOG,
                if interrupted { ActivityEvent::Stop } else { ActivityEvent::Info },
                &format!("Cycle {cycle_number} {verdict}: {modules_run} modules run, {failed} failed"),
            )
            .await;

        Ok(CycleReport {
            cycle_id: cycle.cycle_id,
            rotation,
            cycle_count,
            outcomes,
            skipped,
            deferred,
            interrupted,
        })
    }

    /// Wait for every module task. After a stop request each remaining task
    /// gets the grace period; tasks still running after that are detached.
    async fn join_modules(self: &Arc<Self>, handles: Vec<(String, JoinHandle<ModuleOutcome>)>) -> Vec<ModuleOutcome> {
        let mut outcomes = Vec::with_capacity(handles.len());
        let mut grace_exhausted = false;

        for (module, mut handle) in handles {
            if grace_exhausted && !handle.is_finished() {
                warn!(module = %module, "Module still running after grace period; detaching");
                outcomes.push(self.detach(&module).await);
                continue;
            }

            let joined = tokio::select! {
                joined = &mut handle => Some(joined),
                _ = self.stop_grace_elapsed() => None,
            };

            match joined {
                Some(joined) => outcomes.push(self.settle(&module, joined).await),
                None => {
                    grace_exhausted = true;
                    warn!(module = %module, "Module did not honour stop within grace period; detaching");
                    outcomes.push(self.detach(&module).await);
                }
            }
        }
        outcomes
    }

    async fn detach(&self, module: &str) -> ModuleOutcome {
        let grace = self.config.stop_grace_period().as_secs();
        self.activity
            .record(
                module,
                ActivityEvent::Stop,
                &format!("Detached: still running {grace}s after stop request"),
            )
            .await;
        ModuleOutcome::new(module, ModuleStatus::Running).with_error("detached after stop")
    }

    /// Completes once a stop was requested and the grace period has passed
    async fn stop_grace_elapsed(&self) {
        while !sleep_unless_stopped(Duration::from_secs(3600), &self.stop_requested, &self.stop_notify).await {}
        // A runner that started after stop() fanned out has cleared its flag
        for runner in self.runner_list() {
            runner.stop();
        }
        tokio::time::sleep(self.config.stop_grace_period()).await;
    }

    /// Turn a joined module task into an outcome; a panicked task is a crash
    async fn settle(&self, module: &str, joined: std::result::Result<ModuleOutcome, JoinError>) -> ModuleOutcome {
        match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic().as_ref())
                } else {
                    e.to_string()
                };
                error!(module = %module, error = %reason, "Module task crashed");
                self.health.mark_finished(module);
                self.health.record_failure(module);
                self.persist_status(module, ModuleStatus::Failed).await;
                self.activity
                    .record(module, ActivityEvent::Crash, &format!("Module crashed: {reason}"))
                    .await;
                ModuleOutcome::new(module, ModuleStatus::Failed).with_error(reason)
            }
        }
    }

    async fn record_unregistered(&self, module: &str) -> ModuleOutcome {
        warn!(module = %module, "No worker registered; marking module failed");
        self.persist_status(module, ModuleStatus::Failed).await;
        self.activity
            .record(module, ActivityEvent::Fail, "No worker registered")
            .await;
        ModuleOutcome::new(module, ModuleStatus::Failed).with_error("no worker registered")
    }

    async fn persist_status(&self, module: &str, status: ModuleStatus) {
        if let Err(e) = self
            .state
            .update_module_progress(module, ModuleUpdate::status(status))
            .await
        {
            error!(module = %module, status = %status, error = %e, "Failed to persist module status");
        }
    }

    /// Persist `status` unless `rotation` has been completed or reset since
    /// the module started. Returns `false` only in that case; a storage error
    /// is logged and does not stop the module.
    async fn persist_status_in(&self, module: &str, status: ModuleStatus, rotation: &RotationId) -> bool {
        match self
            .state
            .update_module_in_rotation(module, ModuleUpdate::status(status), rotation)
            .await
        {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    module = %module,
                    status = %status,
                    cycle_id = %rotation.cycle_id,
                    "Rotation no longer current; status not written"
                );
                false
            }
            Err(e) => {
                error!(module = %module, status = %status, error = %e, "Failed to persist module status");
                true
            }
        }
    }

    /// Failed on any crash or when failures exceed the configured share of
    /// processed items. Uses the cycle totals, so work done before a resume
    /// counts.
    fn classify(&self, totals: Option<&ModuleState>, stats: &WorkerStats) -> ModuleStatus {
        let failed = match totals {
            Some(totals) => totals.exceeds_failure_limit(self.config.failure_ratio_threshold),
            None => {
                let limit = self.config.failure_ratio_threshold * stats.items_processed as f64;
                stats.items_crashed > 0 || stats.items_failed as f64 > limit
            }
        };
        if failed {
            ModuleStatus::Failed
        } else {
            ModuleStatus::Completed
        }
    }

    /// Persisted counters for `module` while `rotation` is current
    async fn rotation_totals(&self, module: &str, rotation: &RotationId) -> Option<ModuleState> {
        match self.state.get_or_create_cycle().await {
            Ok(cycle) if cycle.rotation_id() == *rotation => cycle.module(module).cloned(),
            Ok(_) => None,
            Err(e) => {
                warn!(module = %module, error = %e, "Could not read module totals; using this run's counters");
                None
            }
        }
    }

    async fn run_module(self: Arc<Self>, runner: Arc<WorkerRunner>, rotation: RotationId) -> ModuleOutcome {
        let module = runner.module_name().to_string();
        if self.is_stop_requested() {
            return ModuleOutcome::not_attempted(&module, ModuleStatus::Pending, "stop requested before start");
        }
        if runner.is_running() {
            return ModuleOutcome::not_attempted(&module, ModuleStatus::Running, "runner still busy");
        }
        let cycle_id = Some(rotation.cycle_id.as_str());

        if !self.persist_status_in(&module, ModuleStatus::Running, &rotation).await {
            return ModuleOutcome::not_attempted(&module, ModuleStatus::Pending, "rotation no longer current");
        }
        let resume_from = match self.state.get_resume_point(&module).await {
            Ok(point) => point,
            Err(e) => {
                error!(module = %module, error = %e, "Could not resolve resume point");
                self.persist_status_in(&module, ModuleStatus::Failed, &rotation).await;
                return ModuleOutcome::new(&module, ModuleStatus::Failed).with_error(e.to_string());
            }
        };
        let base = self
            .rotation_totals(&module, &rotation)
            .await
            .map(|m| BaseCounts {
                processed: m.items_processed,
                errors: m.items_errored,
                crashed: m.items_crashed,
            })
            .unwrap_or_default();

        self.health.mark_started(&module);
        log_module_operation("run", &module, cycle_id, "running", None);
        let start_line = match resume_from {
            Some(cursor) => format!("Resuming after item {cursor}"),
            None => "Starting from the beginning".to_string(),
        };
        self.activity.record(&module, ActivityEvent::Start, &start_line).await;

        let observer = ModuleObserver::new(
            module.clone(),
            self.state.clone(),
            self.health.clone(),
            self.activity.clone(),
        )
        .with_base_counts(base)
        .with_rotation(rotation.clone());

        let result = runner.run(resume_from, &observer).await;
        self.health.mark_finished(&module);

        let outcome = match result {
            Ok(stats) if stats.final_state == RunnerState::Stopped => {
                // Left running so the next rotation resumes it from the cursor
                self.activity
                    .record(
                        &module,
                        ActivityEvent::Stop,
                        &format!("Stopped after {} items ({} failed)", stats.items_processed, stats.items_failed),
                    )
                    .await;
                ModuleOutcome::new(&module, ModuleStatus::Running).with_stats(stats)
            }
            Ok(stats) => {
                let totals = self.rotation_totals(&module, &rotation).await;
                let status = self.classify(totals.as_ref(), &stats);
                self.persist_status_in(&module, status, &rotation).await;
                if status == ModuleStatus::Failed {
                    self.health.record_failure(&module);
                } else {
                    self.health.record_success(&module);
                }
                self.activity
                    .record(
                        &module,
                        ActivityEvent::Stop,
                        &format!(
                            "{status}: {} processed, {} succeeded, {} failed, {} crashed{}",
                            stats.items_processed,
                            stats.items_succeeded,
                            stats.items_failed,
                            stats.items_crashed,
                            totals
                                .as_ref()
                                .filter(|t| t.items_processed != stats.items_processed)
                                .map(|t| format!(
                                    " (cycle totals: {} processed, {} failed, {} crashed)",
                                    t.items_processed, t.items_errored, t.items_crashed
                                ))
                                .unwrap_or_default()
                        ),
                    )
                    .await;
                ModuleOutcome::new(&module, status).with_stats(stats)
            }
            Err(WorkerError::AlreadyRunning(_)) => {
                warn!(module = %module, "Runner still busy from an earlier run; leaving it");
                ModuleOutcome::not_attempted(&module, ModuleStatus::Running, "runner still busy")
            }
            Err(e) => {
                error!(module = %module, error = %e, "Module run failed");
                self.persist_status_in(&module, ModuleStatus::Failed, &rotation).await;
                self.health.record_failure(&module);
                self.activity
                    .record(&module, ActivityEvent::Fail, &format!("Run failed: {e}"))
                    .await;
                ModuleOutcome::new(&module, ModuleStatus::Failed).with_error(e.to_string())
            }
        };

        log_module_operation("run", &module, cycle_id, outcome.status.as_str(), outcome.error.as_deref());
        self.resources.cleanup_between_modules().await;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PathsConfig;
    use crate::constants::ItemId;
    use crate::resources::StaticMemoryProbe;
    use crate::worker::WorkerResult;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct CountingWorker {
        name: String,
        items: Vec<ItemId>,
        fail: Vec<ItemId>,
    }

    #[async_trait]
    impl Worker for CountingWorker {
        fn module_name(&self) -> &str {
            &self.name
        }

        async fn get_items_to_process(&self, limit: usize, after_id: Option<ItemId>) -> std::result::Result<Vec<ItemId>, WorkerError> {
            Ok(self
                .items
                .iter()
                .copied()
                .filter(|id| after_id.map_or(true, |a| *id > a))
                .take(limit)
                .collect())
        }

        async fn process_item(&self, item_id: ItemId) -> std::result::Result<WorkerResult, WorkerError> {
            if self.fail.contains(&item_id) {
                Err(WorkerError::item_failed(item_id, "rejected"))
            } else {
                Ok(WorkerResult::success(item_id, "ok"))
            }
        }
    }

    fn config(dir: &TempDir, modules: &[&str]) -> CycleConfig {
        let mut config = CycleConfig {
            paths: PathsConfig {
                log_dir: dir.path().join("logs"),
                state_file: dir.path().join("state.json"),
            },
            ..CycleConfig::default()
        };
        config.orchestrator.modules = modules.iter().map(|m| m.to_string()).collect();
        config.orchestrator.delay_between_modules_seconds = 0;
        config.orchestrator.delay_between_cycles_seconds = 0;
        config.worker.delay_between_items_ms = 0;
        config
    }

    fn resources() -> Arc<ResourceManager> {
        Arc::new(
            ResourceManager::without_database(Default::default())
                .with_memory_probe(Box::new(StaticMemoryProbe::new(0.3))),
        )
    }

    fn worker(name: &str, items: Vec<ItemId>, fail: Vec<ItemId>) -> Arc<dyn Worker> {
        Arc::new(CountingWorker {
            name: name.to_string(),
            items,
            fail,
        })
    }

    #[tokio::test]
    async fn test_failure_ratio_marks_module_failed() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps"]), resources()).await.unwrap();
        orchestrator.register_worker(worker("maps", vec![1, 2, 3, 4], vec![1, 2, 3])).unwrap();

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.outcome("maps").unwrap().status, ModuleStatus::Failed);
    }

    #[tokio::test]
    async fn test_half_failed_is_still_completed() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps"]), resources()).await.unwrap();
        orchestrator.register_worker(worker("maps", vec![1, 2, 3, 4], vec![1, 2])).unwrap();

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.outcome("maps").unwrap().status, ModuleStatus::Completed);
    }

    #[tokio::test]
    async fn test_unregistered_module_is_failed() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps", "yelp"]), resources()).await.unwrap();
        orchestrator.register_worker(worker("maps", vec![1], vec![])).unwrap();

        let report = orchestrator.run_cycle().await.unwrap();
        assert_eq!(report.outcome("yelp").unwrap().status, ModuleStatus::Failed);
        assert_eq!(report.outcome("maps").unwrap().status, ModuleStatus::Completed);
    }

    #[tokio::test]
    async fn test_register_unknown_module_rejected() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps"]), resources()).await.unwrap();
        let err = orchestrator.register_worker(worker("facebook", vec![], vec![])).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnknownModule(_)));
    }

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let dir = TempDir::new().unwrap();
        let result = Orchestrator::new(config(&dir, &[]), resources()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_get_logs_rejects_unknown_names() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps"]), resources()).await.unwrap();
        assert!(orchestrator.get_logs("orchestrator", 10).await.unwrap().is_empty());
        assert!(matches!(
            orchestrator.get_logs("nope", 10).await,
            Err(OrchestratorError::UnknownModule(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_worker_unknown_module() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::new(config(&dir, &["maps"]), resources()).await.unwrap();
        assert!(matches!(
            orchestrator.stop_worker("maps"),
            Err(OrchestratorError::UnknownModule(_))
        ));
    }
}
