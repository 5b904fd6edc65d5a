//! # State Store
//!
//! Durable record of cycle and module progress. The persistence strategy is
//! chosen once in [`StateStore::open`]: database plus JSON mirror when the
//! database is reachable, JSON file only otherwise. Every mutation updates the
//! in-memory cycle under a single async lock and persists it before the lock
//! is released, so concurrent modules never interleave partial writes.

use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::backend::StateBackend;
use super::file::JsonFileBackend;
use super::postgres::{DualWriteBackend, PostgresBackend};
use super::types::{CycleState, ModuleUpdate, RotationId, RotationStart, StatusSnapshot};
use crate::constants::{CycleStatus, ItemId};
use crate::error::{StateError, StateResult};
use crate::resources::ResourceManager;

/// Which persistence strategy the store is using
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistenceMode {
    DatabaseAndFile,
    FileOnly,
}

pub struct StateStore {
    backend: Box<dyn StateBackend>,
    file: JsonFileBackend,
    mode: PersistenceMode,
    modules: Vec<String>,
    cycle: Mutex<Option<CycleState>>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("backend", &self.backend.name())
            .field("state_file", &self.file.path())
            .field("modules", &self.modules)
            .finish()
    }
}

impl StateStore {
    /// Open the store for the given rotation.
    ///
    /// When `resources` has a reachable database the schema is ensured and
    /// writes go to both stores. Any failure here degrades to file-only mode
    /// with a single warning; nothing is retried later.
    pub async fn open(
        state_file: impl Into<PathBuf>,
        modules: Vec<String>,
        resources: Option<Arc<ResourceManager>>,
    ) -> Self {
        let file = JsonFileBackend::new(state_file);

        let database = match resources.filter(|r| r.has_database()) {
            Some(resources) => match PostgresBackend::initialize(resources).await {
                Ok(backend) => Some(backend),
                Err(e) => {
                    warn!(error = %e, "State database unavailable; persisting to state file only");
                    None
                }
            },
            None => {
                info!(path = %file.path().display(), "No database for state; persisting to state file only");
                None
            }
        };

        match database {
            Some(database) => Self::with_backend(
                Box::new(DualWriteBackend::new(database, file.clone())),
                file,
                PersistenceMode::DatabaseAndFile,
                modules,
            ),
            None => Self::with_backend(Box::new(file.clone()), file, PersistenceMode::FileOnly, modules),
        }
    }

    /// File-only store
    pub fn file_only(state_file: impl Into<PathBuf>, modules: Vec<String>) -> Self {
        let file = JsonFileBackend::new(state_file);
        Self::with_backend(Box::new(file.clone()), file, PersistenceMode::FileOnly, modules)
    }

    fn with_backend(
        backend: Box<dyn StateBackend>,
        file: JsonFileBackend,
        mode: PersistenceMode,
        modules: Vec<String>,
    ) -> Self {
        Self {
            backend,
            file,
            mode,
            modules,
            cycle: Mutex::new(None),
        }
    }

    pub fn mode(&self) -> PersistenceMode {
        self.mode
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    async fn load_or_create(&self) -> StateResult<CycleState> {
        let loaded = match self.backend.load_running_cycle().await {
            Ok(loaded) => loaded,
            Err(StateError::Serialization(e)) => {
                error!(error = %e, "State file unreadable; starting a new cycle");
                self.file.quarantine().await?;
                None
            }
            Err(e) => return Err(e),
        };

        match loaded {
            Some(mut cycle) => {
                cycle.reconcile_modules(&self.modules);
                info!(
                    cycle_id = %cycle.cycle_id,
                    cycle_count = cycle.cycle_count,
                    current_module = ?cycle.current_module(),
                    "Resuming running cycle"
                );
                Ok(cycle)
            }
            None => {
                let cycle = CycleState::new(&self.modules);
                info!(cycle_id = %cycle.cycle_id, modules = ?self.modules, "Created new cycle");
                self.backend.save_cycle(&cycle).await?;
                Ok(cycle)
            }
        }
    }

    async fn ensure_loaded<'g>(&self, slot: &'g mut Option<CycleState>) -> StateResult<&'g mut CycleState> {
        if slot.is_none() {
            *slot = Some(self.load_or_create().await?);
        }
        slot.as_mut()
            .ok_or_else(|| StateError::InvalidState("cycle not loaded".to_string()))
    }

    /// Run `f` against the loaded cycle while holding the lock
    async fn with_cycle<R>(&self, f: impl FnOnce(&mut CycleState) -> StateResult<R>) -> StateResult<(R, CycleState)> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        let result = f(cycle)?;
        Ok((result, cycle.clone()))
    }

    /// The running cycle, loading a persisted one or creating a new one
    pub async fn get_or_create_cycle(&self) -> StateResult<CycleState> {
        Ok(self.with_cycle(|_| Ok(())).await?.1)
    }

    /// Apply a partial progress update to one module and persist it
    pub async fn update_module_progress(&self, module: &str, update: ModuleUpdate) -> StateResult<()> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        cycle.apply_update(module, update, Utc::now())?;
        self.backend.save_module(cycle, module).await
    }

    /// Apply `update` only while `rotation` is still the current rotation.
    /// Returns `false`, writing nothing, when the rotation has since completed
    /// or the state was reset.
    pub async fn update_module_in_rotation(
        &self,
        module: &str,
        update: ModuleUpdate,
        rotation: &RotationId,
    ) -> StateResult<bool> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        if cycle.rotation_id() != *rotation {
            return Ok(false);
        }
        cycle.apply_update(module, update, Utc::now())?;
        self.backend.save_module(cycle, module).await?;
        Ok(true)
    }

    /// Cursor to resume `module` from: `None` means start from the beginning
    pub async fn get_resume_point(&self, module: &str) -> StateResult<Option<ItemId>> {
        let (point, _) = self
            .with_cycle(|cycle| {
                cycle
                    .module(module)
                    .map(|m| m.last_processed_id)
                    .ok_or_else(|| StateError::UnknownModule(module.to_string()))
            })
            .await?;
        Ok(point)
    }

    /// Stamp the module's heartbeat and persist
    pub async fn heartbeat(&self, module: &str) -> StateResult<()> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        cycle.record_heartbeat(module, Utc::now())?;
        self.backend.save_module(cycle, module).await
    }

    /// Sequential rotation step. Returns `true` when the rotation wrapped and
    /// a new cycle began.
    pub async fn advance_to_next_module(&self) -> StateResult<bool> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        let wrapped = cycle.advance();
        if wrapped {
            info!(cycle_count = cycle.cycle_count, "Rotation wrapped; new cycle started");
        }
        self.backend.save_cycle(cycle).await?;
        Ok(wrapped)
    }

    /// Begin a parallel rotation, resetting modules only when the previous
    /// rotation finished
    pub async fn begin_rotation(&self) -> StateResult<RotationStart> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        let start = cycle.begin_rotation();
        self.backend.save_cycle(cycle).await?;
        Ok(start)
    }

    /// Record the end of a parallel rotation
    pub async fn complete_rotation(&self) -> StateResult<u64> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        cycle.complete_rotation();
        self.backend.save_cycle(cycle).await?;
        Ok(cycle.cycle_count)
    }

    /// Dashboard snapshot of the whole cycle
    pub async fn get_status(&self) -> StateResult<StatusSnapshot> {
        let (_, cycle) = self.with_cycle(|_| Ok(())).await?;
        Ok(StatusSnapshot::from_cycle(&cycle, self.backend.name()))
    }

    /// Mark the cycle with a new overall status
    pub async fn set_cycle_status(&self, status: CycleStatus) -> StateResult<()> {
        let mut guard = self.cycle.lock().await;
        let cycle = self.ensure_loaded(&mut guard).await?;
        cycle.status = status;
        cycle.updated_at = Utc::now();
        self.backend.save_cycle(cycle).await
    }

    /// Discard all persisted progress. The next access starts a new cycle.
    pub async fn reset_state(&self) -> StateResult<()> {
        let mut guard = self.cycle.lock().await;
        self.backend.clear().await?;
        *guard = None;
        warn!("Cycle state reset; all module progress discarded");
        Ok(())
    }
}
