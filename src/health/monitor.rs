//! # Health Monitor
//!
//! Heartbeat bookkeeping and stuck detection for registered modules.
//!
//! All bookkeeping sits behind one mutex. Evaluation collects the transitions it
//! caused and the registered callbacks run after the lock is released, so a
//! callback may call back into the monitor (or stop a worker) without
//! deadlocking.
//!
//! A module is only checked for liveness while it is active, between
//! [`HealthMonitor::mark_started`] and [`HealthMonitor::mark_finished`].

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::types::{HealthCallback, HealthEvent, ModuleHealth};
use crate::config::HealthConfig;
use crate::constants::HealthStatus;
use crate::utils::sleep_unless_stopped;

#[derive(Default)]
struct Callbacks {
    on_stuck: Option<HealthCallback>,
    on_recovered: Option<HealthCallback>,
    on_failure: Option<HealthCallback>,
}

pub struct HealthMonitor {
    config: HealthConfig,
    modules: Mutex<HashMap<String, ModuleHealth>>,
    callbacks: RwLock<Callbacks>,
    stop_requested: AtomicBool,
    stop_notify: Notify,
    check_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("modules", &self.modules.lock().len())
            .field("running", &self.is_running())
            .finish()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            modules: Mutex::new(HashMap::new()),
            callbacks: RwLock::new(Callbacks::default()),
            stop_requested: AtomicBool::new(false),
            stop_notify: Notify::new(),
            check_task: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn set_on_stuck(&self, callback: HealthCallback) {
        self.callbacks.write().on_stuck = Some(callback);
    }

    pub fn set_on_recovered(&self, callback: HealthCallback) {
        self.callbacks.write().on_recovered = Some(callback);
    }

    pub fn set_on_failure(&self, callback: HealthCallback) {
        self.callbacks.write().on_failure = Some(callback);
    }

    /// Start tracking a module. Re-registering keeps existing health.
    pub fn register_module(&self, module: &str) {
        self.modules
            .lock()
            .entry(module.to_string())
            .or_insert_with(|| ModuleHealth::new(module));
    }

    /// Begin liveness tracking for a new run of `module`
    pub fn mark_started(&self, module: &str) {
        let mut modules = self.modules.lock();
        let health = modules
            .entry(module.to_string())
            .or_insert_with(|| ModuleHealth::new(module));
        health.started_at = Some(Utc::now());
        health.last_heartbeat = None;
        health.is_stuck = false;
        health.active = true;
        if health.status != HealthStatus::Failed {
            health.status = HealthStatus::Healthy;
        }
    }

    /// Stop liveness tracking; a finished module can no longer become stuck
    pub fn mark_finished(&self, module: &str) {
        if let Some(health) = self.modules.lock().get_mut(module) {
            health.active = false;
            health.is_stuck = false;
            if matches!(health.status, HealthStatus::Stuck | HealthStatus::Warning) {
                health.status = HealthStatus::Healthy;
            }
        }
    }

    /// Record a sign of life. A heartbeat on a stuck module recovers it.
    pub fn record_heartbeat(&self, module: &str) {
        let recovered = {
            let mut modules = self.modules.lock();
            let health = modules
                .entry(module.to_string())
                .or_insert_with(|| ModuleHealth::new(module));
            health.last_heartbeat = Some(Utc::now());
            let was_stuck = health.is_stuck;
            health.is_stuck = false;
            if health.status != HealthStatus::Failed {
                health.status = HealthStatus::Healthy;
            }
            was_stuck
        };

        if recovered {
            info!(module = %module, "Module recovered after heartbeat");
            self.dispatch(vec![HealthEvent::Recovered(module.to_string())]);
        }
    }

    /// Count a failure; crossing the limit marks the module failed once
    pub fn record_failure(&self, module: &str) {
        let failed = {
            let mut modules = self.modules.lock();
            let health = modules
                .entry(module.to_string())
                .or_insert_with(|| ModuleHealth::new(module));
            health.consecutive_failures += 1;
            let crossed = health.consecutive_failures >= self.config.max_consecutive_failures
                && health.status != HealthStatus::Failed;
            if crossed {
                health.status = HealthStatus::Failed;
            }
            debug!(
                module = %module,
                consecutive_failures = health.consecutive_failures,
                "Failure recorded"
            );
            crossed
        };

        if failed {
            error!(
                module = %module,
                limit = self.config.max_consecutive_failures,
                "Module exceeded consecutive failure limit"
            );
            self.dispatch(vec![HealthEvent::Failed(module.to_string())]);
        }
    }

    /// Any success clears the failure streak
    pub fn record_success(&self, module: &str) {
        let mut modules = self.modules.lock();
        let health = modules
            .entry(module.to_string())
            .or_insert_with(|| ModuleHealth::new(module));
        health.consecutive_failures = 0;
        if health.status == HealthStatus::Failed || health.status == HealthStatus::Unknown {
            health.status = HealthStatus::Healthy;
        }
    }

    /// Evaluate every active module against `now` and fire callbacks for
    /// new stuck transitions. Returns the modules that became stuck.
    pub fn evaluate_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.config.heartbeat_timeout_seconds as f64;
        let mut events = Vec::new();

        {
            let mut modules = self.modules.lock();
            for health in modules.values_mut().filter(|h| h.active) {
                let Some(elapsed) = health.seconds_since_baseline(now) else {
                    continue;
                };

                if elapsed > timeout {
                    if !health.is_stuck {
                        health.is_stuck = true;
                        health.status = HealthStatus::Stuck;
                        warn!(
                            module = %health.module,
                            seconds_since_heartbeat = elapsed,
                            timeout_seconds = timeout,
                            "Module is stuck"
                        );
                        events.push(HealthEvent::Stuck(health.module.clone()));
                    }
                } else if health.status != HealthStatus::Failed && !health.is_stuck {
                    health.status = if elapsed > timeout / 2.0 {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                }
            }
        }

        let stuck = events
            .iter()
            .filter_map(|e| match e {
                HealthEvent::Stuck(module) => Some(module.clone()),
                _ => None,
            })
            .collect();
        self.dispatch(events);
        stuck
    }

    /// Evaluate every active module now
    pub fn check_all(&self) -> Vec<String> {
        self.evaluate_at(Utc::now())
    }

    fn dispatch(&self, events: Vec<HealthEvent>) {
        if events.is_empty() {
            return;
        }
        let (on_stuck, on_recovered, on_failure) = {
            let callbacks = self.callbacks.read();
            (
                callbacks.on_stuck.clone(),
                callbacks.on_recovered.clone(),
                callbacks.on_failure.clone(),
            )
        };

        for event in events {
            let (callback, module) = match &event {
                HealthEvent::Stuck(module) => (&on_stuck, module),
                HealthEvent::Recovered(module) => (&on_recovered, module),
                HealthEvent::Failed(module) => (&on_failure, module),
            };
            if let Some(callback) = callback {
                callback(module);
            }
        }
    }

    pub fn get_health(&self, module: &str) -> Option<ModuleHealth> {
        self.modules.lock().get(module).cloned()
    }

    /// Snapshot of every module, sorted by name
    pub fn get_all_health(&self) -> Vec<ModuleHealth> {
        let mut all: Vec<_> = self.modules.lock().values().cloned().collect();
        all.sort_by(|a, b| a.module.cmp(&b.module));
        all
    }

    /// Forget heartbeat, failure and stuck state for `module`
    pub fn reset_health(&self, module: &str) {
        if let Some(health) = self.modules.lock().get_mut(module) {
            *health = ModuleHealth::new(module);
        }
    }

    pub fn is_running(&self) -> bool {
        self.check_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Spawn the periodic check loop. A second call while running is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.check_task.lock();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        self.stop_requested.store(false, Ordering::Release);

        let monitor = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            info!(
                interval_seconds = monitor.config.check_interval_seconds,
                timeout_seconds = monitor.config.heartbeat_timeout_seconds,
                "Health monitor started"
            );
            loop {
                let stopped = sleep_unless_stopped(
                    monitor.config.check_interval(),
                    &monitor.stop_requested,
                    &monitor.stop_notify,
                )
                .await;
                if stopped {
                    break;
                }
                monitor.check_all();
            }
            info!("Health monitor stopped");
        }));
    }

    /// Stop the check loop and wait for it to exit
    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::Release);
        self.stop_notify.notify_waiters();
        let task = self.check_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Health check loop ended abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn monitor(timeout: u64) -> HealthMonitor {
        HealthMonitor::new(HealthConfig {
            heartbeat_timeout_seconds: timeout,
            check_interval_seconds: 1,
            max_consecutive_failures: 3,
        })
    }

    fn counter() -> (Arc<AtomicUsize>, HealthCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, Arc::new(move |_: &str| {
            inner.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_inactive_modules_never_stuck() {
        let monitor = monitor(10);
        monitor.register_module("maps");
        let stuck = monitor.evaluate_at(Utc::now() + chrono::Duration::hours(1));
        assert!(stuck.is_empty());
        assert_eq!(monitor.get_health("maps").unwrap().status, HealthStatus::Unknown);
    }

    #[test]
    fn test_stuck_fires_once_per_transition() {
        let monitor = monitor(10);
        let (stuck_count, on_stuck) = counter();
        monitor.set_on_stuck(on_stuck);
        monitor.mark_started("maps");

        let later = Utc::now() + chrono::Duration::seconds(11);
        assert_eq!(monitor.evaluate_at(later), vec!["maps".to_string()]);
        assert!(monitor.evaluate_at(later + chrono::Duration::seconds(30)).is_empty());
        assert_eq!(stuck_count.load(Ordering::SeqCst), 1);
        assert!(monitor.get_health("maps").unwrap().is_stuck);
    }

    #[test]
    fn test_heartbeat_recovers_and_rearms() {
        let monitor = monitor(10);
        let (stuck_count, on_stuck) = counter();
        let (recovered_count, on_recovered) = counter();
        monitor.set_on_stuck(on_stuck);
        monitor.set_on_recovered(on_recovered);
        monitor.mark_started("maps");

        monitor.evaluate_at(Utc::now() + chrono::Duration::seconds(11));
        monitor.record_heartbeat("maps");
        assert_eq!(recovered_count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.get_health("maps").unwrap().status, HealthStatus::Healthy);

        monitor.evaluate_at(Utc::now() + chrono::Duration::seconds(11));
        assert_eq!(stuck_count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_warning_past_half_timeout() {
        let monitor = monitor(10);
        monitor.mark_started("maps");
        monitor.evaluate_at(Utc::now() + chrono::Duration::seconds(6));
        assert_eq!(monitor.get_health("maps").unwrap().status, HealthStatus::Warning);
    }

    #[test]
    fn test_finished_module_is_not_evaluated() {
        let monitor = monitor(10);
        monitor.mark_started("maps");
        monitor.mark_finished("maps");
        assert!(monitor.evaluate_at(Utc::now() + chrono::Duration::seconds(60)).is_empty());
    }

    #[test]
    fn test_consecutive_failures_cross_limit_once() {
        let monitor = monitor(10);
        let (failure_count, on_failure) = counter();
        monitor.set_on_failure(on_failure);

        monitor.record_failure("seo_audit");
        monitor.record_failure("seo_audit");
        assert_eq!(failure_count.load(Ordering::SeqCst), 0);
        monitor.record_failure("seo_audit");
        monitor.record_failure("seo_audit");
        assert_eq!(failure_count.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.get_health("seo_audit").unwrap().status, HealthStatus::Failed);

        monitor.record_success("seo_audit");
        let health = monitor.get_health("seo_audit").unwrap();
        assert_eq!(health.consecutive_failures, 0);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_callback_may_reenter_monitor() {
        let monitor = Arc::new(monitor(10));
        let inner = Arc::downgrade(&monitor);
        monitor.set_on_stuck(Arc::new(move |module: &str| {
            if let Some(monitor) = inner.upgrade() {
                monitor.reset_health(module);
            }
        }));
        monitor.mark_started("maps");
        monitor.evaluate_at(Utc::now() + chrono::Duration::seconds(11));
        assert_eq!(monitor.get_health("maps").unwrap(), ModuleHealth::new("maps"));
    }

    #[tokio::test]
    async fn test_background_loop_starts_and_stops() {
        let monitor = Arc::new(monitor(10));
        monitor.start();
        assert!(monitor.is_running());
        monitor.stop().await;
        assert!(!monitor.is_running());
    }
}
