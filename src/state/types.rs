//! # Cycle State Types
//!
//! In-memory model of cycle and module progress. All transition rules live
//! here as plain methods so they can be exercised without any persistence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;
use uuid::Uuid;

use crate::constants::{CycleStatus, ItemId, ModuleStatus};
use crate::error::{StateError, StateResult};

/// Per-module progress within one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub module_name: String,
    pub status: ModuleStatus,
    /// Resume cursor
    pub last_processed_id: Option<ItemId>,
    pub items_processed: u64,
    /// Failed items, crashes included
    pub items_errored: u64,
    /// Items whose processing panicked; any crash fails the module
    #[serde(default)]
    pub items_crashed: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ModuleState {
    pub fn new(module_name: impl Into<String>) -> Self {
        Self {
            module_name: module_name.into(),
            status: ModuleStatus::Pending,
            last_processed_id: None,
            items_processed: 0,
            items_errored: 0,
            items_crashed: 0,
            last_heartbeat: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Return to the fresh-cycle state
    pub fn reset(&mut self) {
        *self = Self::new(std::mem::take(&mut self.module_name));
    }

    /// Whether the counters accumulated this cycle make the module `failed`:
    /// any crash, or more than `failure_ratio` of processed items failed.
    pub fn exceeds_failure_limit(&self, failure_ratio: f64) -> bool {
        self.items_crashed > 0 || self.items_errored as f64 > failure_ratio * self.items_processed as f64
    }
}

/// Partial update applied by [`CycleState::apply_update`]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModuleUpdate {
    pub last_id: Option<ItemId>,
    pub processed: Option<u64>,
    pub errors: Option<u64>,
    pub crashed: Option<u64>,
    pub status: Option<ModuleStatus>,
    /// Stamp `last_heartbeat` with the update time
    pub heartbeat: bool,
}

impl ModuleUpdate {
    pub fn status(status: ModuleStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn progress(last_id: ItemId, processed: u64, errors: u64) -> Self {
        Self {
            last_id: Some(last_id),
            processed: Some(processed),
            errors: Some(errors),
            ..Self::default()
        }
    }

    pub fn with_crashed(mut self, crashed: u64) -> Self {
        self.crashed = Some(crashed);
        self
    }

    pub fn with_heartbeat(mut self) -> Self {
        self.heartbeat = true;
        self
    }

    pub fn with_status(mut self, status: ModuleStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_last_id(mut self, last_id: ItemId) -> Self {
        self.last_id = Some(last_id);
        self
    }
}

/// How a rotation began
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStart {
    /// Every module was reset to pending
    Fresh,
    /// Some modules were still pending or running; their progress was kept
    Resumed,
}

/// One rotation of one cycle. Changes when a rotation completes or the
/// state is reset.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RotationId {
    pub cycle_id: String,
    /// Completed rotations when this one began
    pub cycle_count: u64,
}

/// The whole run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleState {
    pub cycle_id: String,
    pub status: CycleStatus,
    /// Completed full rotations
    pub cycle_count: u64,
    pub current_module_index: usize,
    /// Rotation order
    pub module_order: Vec<String>,
    pub modules: BTreeMap<String, ModuleState>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CycleState {
    /// New running cycle with every module pending
    pub fn new(modules: &[String]) -> Self {
        let now = Utc::now();
        Self {
            cycle_id: Uuid::new_v4().to_string(),
            status: CycleStatus::Running,
            cycle_count: 0,
            current_module_index: 0,
            module_order: modules.to_vec(),
            modules: modules
                .iter()
                .map(|name| (name.clone(), ModuleState::new(name.clone())))
                .collect(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Align a loaded cycle with the configured module list. Missing modules
    /// are added as pending; modules no longer configured are dropped.
    pub fn reconcile_modules(&mut self, modules: &[String]) {
        for name in modules {
            self.modules
                .entry(name.clone())
                .or_insert_with(|| ModuleState::new(name.clone()));
        }
        self.modules.retain(|name, _| modules.contains(name));
        self.module_order = modules.to_vec();
        if self.current_module_index >= self.module_order.len() {
            self.current_module_index = 0;
        }
    }

    pub fn module(&self, name: &str) -> Option<&ModuleState> {
        self.modules.get(name)
    }

    fn module_mut(&mut self, name: &str) -> StateResult<&mut ModuleState> {
        self.modules
            .get_mut(name)
            .ok_or_else(|| StateError::UnknownModule(name.to_string()))
    }

    /// Modules in rotation order
    pub fn ordered_modules(&self) -> Vec<&ModuleState> {
        self.module_order
            .iter()
            .filter_map(|name| self.modules.get(name))
            .collect()
    }

    pub fn current_module(&self) -> Option<&str> {
        self.module_order
            .get(self.current_module_index)
            .map(String::as_str)
    }

    /// Apply a partial update to one module.
    ///
    /// Entering `running` stamps `started_at` once; entering `completed` or
    /// `failed` stamps `completed_at`. A cursor that would move backwards is
    /// ignored.
    pub fn apply_update(&mut self, module: &str, update: ModuleUpdate, now: DateTime<Utc>) -> StateResult<()> {
        let state = self.module_mut(module)?;

        if let Some(last_id) = update.last_id {
            match state.last_processed_id {
                Some(current) if last_id < current => {
                    warn!(
                        module = %module,
                        current_cursor = current,
                        rejected_cursor = last_id,
                        "Ignoring cursor that would move backwards"
                    );
                }
                _ => state.last_processed_id = Some(last_id),
            }
        }
        if let Some(processed) = update.processed {
            state.items_processed = processed;
        }
        if let Some(errors) = update.errors {
            state.items_errored = errors;
        }
        if let Some(crashed) = update.crashed {
            state.items_crashed = crashed;
        }
        if update.heartbeat {
            state.last_heartbeat = Some(now);
        }
        if let Some(status) = update.status {
            match status {
                ModuleStatus::Running => {
                    if state.started_at.is_none() {
                        state.started_at = Some(now);
                    }
                    state.completed_at = None;
                }
                ModuleStatus::Completed | ModuleStatus::Failed => {
                    state.completed_at = Some(now);
                }
                ModuleStatus::Pending => {}
            }
            state.status = status;
        }

        self.updated_at = now;
        Ok(())
    }

    pub fn record_heartbeat(&mut self, module: &str, now: DateTime<Utc>) -> StateResult<()> {
        self.module_mut(module)?.last_heartbeat = Some(now);
        self.updated_at = now;
        Ok(())
    }

    fn reset_modules(&mut self) {
        for state in self.modules.values_mut() {
            state.reset();
        }
    }

    /// Move to the next module in rotation order. Wrapping past the last
    /// module completes a cycle: `cycle_count` increments and every module
    /// returns to the fresh-cycle state. Returns `true` on wrap.
    pub fn advance(&mut self) -> bool {
        self.updated_at = Utc::now();
        let next = self.current_module_index + 1;
        if next >= self.module_order.len() {
            self.current_module_index = 0;
            self.cycle_count += 1;
            self.reset_modules();
            true
        } else {
            self.current_module_index = next;
            false
        }
    }

    /// Start a parallel rotation. When every module of the previous rotation
    /// reached a terminal status the modules are reset; a cycle nobody has
    /// touched yet is also fresh. Otherwise the rotation resumes and keeps
    /// existing progress.
    pub fn begin_rotation(&mut self) -> RotationStart {
        self.updated_at = Utc::now();
        let all_terminal = !self.modules.is_empty()
            && self.modules.values().all(|m| m.status.is_terminal());
        if all_terminal {
            self.reset_modules();
            self.current_module_index = 0;
            return RotationStart::Fresh;
        }

        let untouched = self
            .modules
            .values()
            .all(|m| m.status == ModuleStatus::Pending && m.last_processed_id.is_none());
        if untouched {
            RotationStart::Fresh
        } else {
            RotationStart::Resumed
        }
    }

    /// Record a finished parallel rotation. Module results are kept until the
    /// next [`begin_rotation`](Self::begin_rotation).
    pub fn complete_rotation(&mut self) {
        self.updated_at = Utc::now();
        self.current_module_index = 0;
        self.cycle_count += 1;
    }

    pub fn rotation_id(&self) -> RotationId {
        RotationId {
            cycle_id: self.cycle_id.clone(),
            cycle_count: self.cycle_count,
        }
    }
}

/// Read-only dashboard view of the whole cycle
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub cycle_id: String,
    pub status: CycleStatus,
    pub cycle_count: u64,
    pub current_module_index: usize,
    pub current_module: Option<String>,
    pub modules: Vec<ModuleState>,
    pub persistence: &'static str,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StatusSnapshot {
    pub fn from_cycle(cycle: &CycleState, persistence: &'static str) -> Self {
        Self {
            cycle_id: cycle.cycle_id.clone(),
            status: cycle.status,
            cycle_count: cycle.cycle_count,
            current_module_index: cycle.current_module_index,
            current_module: cycle.current_module().map(str::to_string),
            modules: cycle.ordered_modules().into_iter().cloned().collect(),
            persistence,
            started_at: cycle.started_at,
            updated_at: cycle.updated_at,
        }
    }
}
