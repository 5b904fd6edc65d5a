//! # PostgreSQL Backend
//!
//! Stores one row per cycle and one row per (cycle, module). All access goes
//! through [`ResourceManager::session_scope`], so every write commits or rolls
//! back as a unit and never holds a pooled connection past the call.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::backend::StateBackend;
use super::file::JsonFileBackend;
use super::types::{CycleState, ModuleState};
use crate::constants::{CycleStatus, ModuleStatus};
use crate::error::{StateError, StateResult};
use crate::resources::ResourceManager;

const SESSION_TAG: &str = "state_store";

/// Executed one statement at a time; the extended protocol rejects batches.
const SCHEMA_STATEMENTS: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS orchestrator_cycles (
    cycle_id             TEXT PRIMARY KEY,
    status               TEXT NOT NULL,
    cycle_count          BIGINT NOT NULL DEFAULT 0,
    current_module_index INTEGER NOT NULL DEFAULT 0,
    module_order         JSONB NOT NULL DEFAULT '[]'::jsonb,
    started_at           TIMESTAMPTZ NOT NULL,
    updated_at           TIMESTAMPTZ NOT NULL
)"#,
    r#"
CREATE TABLE IF NOT EXISTS orchestrator_module_progress (
    cycle_id          TEXT NOT NULL REFERENCES orchestrator_cycles (cycle_id) ON DELETE CASCADE,
    module_name       TEXT NOT NULL,
    status            TEXT NOT NULL,
    last_processed_id BIGINT,
    items_processed   BIGINT NOT NULL DEFAULT 0,
    items_errored     BIGINT NOT NULL DEFAULT 0,
    items_crashed     BIGINT NOT NULL DEFAULT 0,
    last_heartbeat    TIMESTAMPTZ,
    started_at        TIMESTAMPTZ,
    completed_at      TIMESTAMPTZ,
    PRIMARY KEY (cycle_id, module_name)
)"#,
    "ALTER TABLE orchestrator_module_progress \
     ADD COLUMN IF NOT EXISTS items_crashed BIGINT NOT NULL DEFAULT 0",
    "CREATE INDEX IF NOT EXISTS idx_orchestrator_cycles_status \
     ON orchestrator_cycles (status, updated_at DESC)",
];

const UPSERT_CYCLE_SQL: &str = r#"
INSERT INTO orchestrator_cycles
    (cycle_id, status, cycle_count, current_module_index, module_order, started_at, updated_at)
VALUES ($1, $2, $3, $4, $5, $6, $7)
ON CONFLICT (cycle_id) DO UPDATE SET
    status = EXCLUDED.status,
    cycle_count = EXCLUDED.cycle_count,
    current_module_index = EXCLUDED.current_module_index,
    module_order = EXCLUDED.module_order,
    updated_at = EXCLUDED.updated_at
"#;

const UPSERT_MODULE_SQL: &str = r#"
INSERT INTO orchestrator_module_progress
    (cycle_id, module_name, status, last_processed_id, items_processed, items_errored,
     items_crashed, last_heartbeat, started_at, completed_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
ON CONFLICT (cycle_id, module_name) DO UPDATE SET
    status = EXCLUDED.status,
    last_processed_id = EXCLUDED.last_processed_id,
    items_processed = EXCLUDED.items_processed,
    items_errored = EXCLUDED.items_errored,
    items_crashed = EXCLUDED.items_crashed,
    last_heartbeat = EXCLUDED.last_heartbeat,
    started_at = EXCLUDED.started_at,
    completed_at = EXCLUDED.completed_at
"#;

#[derive(Debug, FromRow)]
struct CycleRow {
    cycle_id: String,
    status: String,
    cycle_count: i64,
    current_module_index: i32,
    module_order: Json<Vec<String>>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct ModuleRow {
    module_name: String,
    status: String,
    last_processed_id: Option<i64>,
    items_processed: i64,
    items_errored: i64,
    items_crashed: i64,
    last_heartbeat: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl ModuleRow {
    fn into_state(self) -> StateResult<ModuleState> {
        let status: ModuleStatus = self.status.parse().map_err(StateError::InvalidState)?;
        Ok(ModuleState {
            module_name: self.module_name,
            status,
            last_processed_id: self.last_processed_id,
            items_processed: self.items_processed.max(0) as u64,
            items_errored: self.items_errored.max(0) as u64,
            items_crashed: self.items_crashed.max(0) as u64,
            last_heartbeat: self.last_heartbeat,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}

fn assemble_cycle(row: CycleRow, modules: Vec<ModuleRow>) -> StateResult<CycleState> {
    let status: CycleStatus = row.status.parse().map_err(StateError::InvalidState)?;
    let modules = modules
        .into_iter()
        .map(|m| m.into_state().map(|s| (s.module_name.clone(), s)))
        .collect::<StateResult<BTreeMap<_, _>>>()?;

    Ok(CycleState {
        cycle_id: row.cycle_id,
        status,
        cycle_count: row.cycle_count.max(0) as u64,
        current_module_index: row.current_module_index.max(0) as usize,
        module_order: row.module_order.0,
        modules,
        started_at: row.started_at,
        updated_at: row.updated_at,
    })
}

async fn upsert_cycle(conn: &mut PgConnection, cycle: &CycleState) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_CYCLE_SQL)
        .bind(&cycle.cycle_id)
        .bind(cycle.status.as_str())
        .bind(cycle.cycle_count as i64)
        .bind(cycle.current_module_index as i32)
        .bind(Json(&cycle.module_order))
        .bind(cycle.started_at)
        .bind(cycle.updated_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn upsert_module(conn: &mut PgConnection, cycle_id: &str, module: &ModuleState) -> Result<(), sqlx::Error> {
    sqlx::query(UPSERT_MODULE_SQL)
        .bind(cycle_id)
        .bind(&module.module_name)
        .bind(module.status.as_str())
        .bind(module.last_processed_id)
        .bind(module.items_processed as i64)
        .bind(module.items_errored as i64)
        .bind(module.items_crashed as i64)
        .bind(module.last_heartbeat)
        .bind(module.started_at)
        .bind(module.completed_at)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Relational cycle storage
#[derive(Debug, Clone)]
pub struct PostgresBackend {
    resources: Arc<ResourceManager>,
}

impl PostgresBackend {
    /// Ensure the schema exists. Fails when the database cannot be reached.
    pub async fn initialize(resources: Arc<ResourceManager>) -> StateResult<Self> {
        resources
            .session_scope(SESSION_TAG, |conn| {
                Box::pin(async move {
                    for statement in SCHEMA_STATEMENTS.iter().copied() {
                        sqlx::query(statement).execute(&mut *conn).await?;
                    }
                    Ok(())
                })
            })
            .await?;
        info!("Cycle state tables ready");
        Ok(Self { resources })
    }
}

#[async_trait]
impl StateBackend for PostgresBackend {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn load_running_cycle(&self) -> StateResult<Option<CycleState>> {
        let loaded = self
            .resources
            .session_scope(SESSION_TAG, |conn| {
                Box::pin(async move {
                    let cycle = sqlx::query_as::<_, CycleRow>(
                        "SELECT cycle_id, status, cycle_count, current_module_index, module_order, \
                         started_at, updated_at FROM orchestrator_cycles \
                         WHERE status = $1 ORDER BY updated_at DESC LIMIT 1",
                    )
                    .bind(CycleStatus::Running.as_str())
                    .fetch_optional(&mut *conn)
                    .await?;

                    let Some(cycle) = cycle else {
                        return Ok(None);
                    };

                    let modules = sqlx::query_as::<_, ModuleRow>(
                        "SELECT module_name, status, last_processed_id, items_processed, items_errored, \
                         items_crashed, last_heartbeat, started_at, completed_at FROM orchestrator_module_progress \
                         WHERE cycle_id = $1",
                    )
                    .bind(&cycle.cycle_id)
                    .fetch_all(&mut *conn)
                    .await?;

                    Ok(Some((cycle, modules)))
                })
            })
            .await?;

        loaded
            .map(|(cycle, modules)| assemble_cycle(cycle, modules))
            .transpose()
    }

    async fn save_cycle(&self, cycle: &CycleState) -> StateResult<()> {
        let cycle = cycle.clone();
        self.resources
            .session_scope(SESSION_TAG, move |conn| {
                Box::pin(async move {
                    upsert_cycle(conn, &cycle).await?;
                    for module in cycle.modules.values() {
                        upsert_module(conn, &cycle.cycle_id, module).await?;
                    }
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn save_module(&self, cycle: &CycleState, module: &str) -> StateResult<()> {
        let state = cycle
            .module(module)
            .cloned()
            .ok_or_else(|| StateError::UnknownModule(module.to_string()))?;
        let cycle = cycle.clone();
        self.resources
            .session_scope(module, move |conn| {
                Box::pin(async move {
                    upsert_cycle(conn, &cycle).await?;
                    upsert_module(conn, &cycle.cycle_id, &state).await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }

    async fn clear(&self) -> StateResult<()> {
        self.resources
            .session_scope(SESSION_TAG, |conn| {
                Box::pin(async move {
                    sqlx::query("DELETE FROM orchestrator_module_progress")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("DELETE FROM orchestrator_cycles")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .await?;
        Ok(())
    }
}

/// Writes the database first and the JSON file second.
///
/// A database write error is logged and does not fail the call; the file is
/// always written so it never lags the last attempted update. Loads prefer the
/// database and fall back to the file when it holds no running cycle.
#[derive(Debug, Clone)]
pub struct DualWriteBackend {
    database: PostgresBackend,
    file: JsonFileBackend,
}

impl DualWriteBackend {
    pub fn new(database: PostgresBackend, file: JsonFileBackend) -> Self {
        Self { database, file }
    }

    pub fn file(&self) -> &JsonFileBackend {
        &self.file
    }

    fn combine(db: StateResult<()>, file: StateResult<()>) -> StateResult<()> {
        if let Err(e) = db {
            warn!(error = %e, "Database state write failed; state file still updated");
        }
        file
    }
}

#[async_trait]
impl StateBackend for DualWriteBackend {
    fn name(&self) -> &'static str {
        "database+file"
    }

    async fn load_running_cycle(&self) -> StateResult<Option<CycleState>> {
        match self.database.load_running_cycle().await {
            Ok(Some(cycle)) => Ok(Some(cycle)),
            Ok(None) => {
                let from_file = self.file.load_running_cycle().await?;
                if from_file.is_some() {
                    debug!("No running cycle in database; resuming from state file");
                }
                Ok(from_file)
            }
            Err(e) => {
                warn!(error = %e, "Database load failed; reading state file");
                self.file.load_running_cycle().await
            }
        }
    }

    async fn save_cycle(&self, cycle: &CycleState) -> StateResult<()> {
        let db = self.database.save_cycle(cycle).await;
        let file = self.file.save_cycle(cycle).await;
        Self::combine(db, file)
    }

    async fn save_module(&self, cycle: &CycleState, module: &str) -> StateResult<()> {
        let db = self.database.save_module(cycle, module).await;
        let file = self.file.save_module(cycle, module).await;
        Self::combine(db, file)
    }

    async fn clear(&self) -> StateResult<()> {
        let db = self.database.clear().await;
        let file = self.file.clear().await;
        Self::combine(db, file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_row_rejects_unknown_status() {
        let row = ModuleRow {
            module_name: "maps".to_string(),
            status: "exploded".to_string(),
            last_processed_id: Some(3),
            items_processed: 3,
            items_errored: 0,
            items_crashed: 0,
            last_heartbeat: None,
            started_at: None,
            completed_at: None,
        };
        assert!(matches!(row.into_state(), Err(StateError::InvalidState(_))));
    }

    #[test]
    fn test_assemble_cycle_from_rows() {
        let now = Utc::now();
        let cycle = CycleRow {
            cycle_id: "c-1".to_string(),
            status: "running".to_string(),
            cycle_count: 4,
            current_module_index: 1,
            module_order: Json(vec!["yelp".to_string(), "maps".to_string()]),
            started_at: now,
            updated_at: now,
        };
        let modules = vec![ModuleRow {
            module_name: "maps".to_string(),
            status: "running".to_string(),
            last_processed_id: Some(42),
            items_processed: 42,
            items_errored: 2,
            items_crashed: 1,
            last_heartbeat: Some(now),
            started_at: Some(now),
            completed_at: None,
        }];

        let state = assemble_cycle(cycle, modules).unwrap();
        assert_eq!(state.cycle_count, 4);
        assert_eq!(state.current_module(), Some("maps"));
        assert_eq!(state.module("maps").unwrap().last_processed_id, Some(42));
        assert_eq!(state.module("maps").unwrap().status, ModuleStatus::Running);
        assert_eq!(state.module("maps").unwrap().items_crashed, 1);
    }

    #[test]
    fn test_combine_follows_file_result() {
        let down = || Err(StateError::Database("down".to_string()));
        assert!(DualWriteBackend::combine(down(), Ok(())).is_ok());
        let file = Err(StateError::InvalidState("disk".to_string()));
        assert!(matches!(DualWriteBackend::combine(down(), file), Err(StateError::InvalidState(_))));
        assert!(DualWriteBackend::combine(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn test_schema_statements_are_single_commands() {
        assert!(SCHEMA_STATEMENTS.iter().all(|sql| !sql.trim().trim_end_matches(';').contains(';')));
        assert!(SCHEMA_STATEMENTS.iter().any(|sql| sql.contains("items_crashed")));
    }
}
