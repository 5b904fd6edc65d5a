//! # Resource Manager
//!
//! Owns the process's single database connection pool and the memory monitor.
//! Constructed once at the composition root and shared by `Arc` with the
//! orchestrator, the state store and every module's persistence helpers.
//!
//! Callers never hold a pooled connection outside [`ResourceManager::session_scope`],
//! which commits on success, rolls back on error and always returns the
//! connection. Between cycles the whole pool is disposed and rebuilt so slow
//! connection leaks cannot accumulate over many-hour runs.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::memory::{MemoryCheck, MemoryLevel, MemoryProbe, SysinfoProbe};
use super::pool_stats::{AtomicPoolStats, PoolStatsSnapshot};
use crate::config::{DatabaseConfig, ResourceConfig};
use crate::error::{ResourceError, ResourceResult};

/// Bookkeeping for one open scoped session
#[derive(Debug)]
struct SessionEntry {
    module: String,
    opened_at: DateTime<Utc>,
    revoked: Arc<AtomicBool>,
}

/// Dashboard view of an open session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub module: String,
    pub opened_at: DateTime<Utc>,
}

/// Pool occupancy plus cumulative statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub database_available: bool,
    /// Connections currently open
    pub size: u32,
    pub idle: u32,
    pub checked_out: u32,
    /// Open connections above the configured resident minimum
    pub overflow: u32,
    pub max_connections: u32,
    pub active_sessions: usize,
    pub stats: PoolStatsSnapshot,
}

/// Removes a session from the registry however the scope exits
struct SessionGuard<'a> {
    sessions: &'a Mutex<HashMap<Uuid, SessionEntry>>,
    session_id: Uuid,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        self.sessions.lock().remove(&self.session_id);
    }
}

pub struct ResourceManager {
    database: DatabaseConfig,
    config: ResourceConfig,
    pool: RwLock<Option<PgPool>>,
    rebuild_lock: tokio::sync::Mutex<()>,
    sessions: Mutex<HashMap<Uuid, SessionEntry>>,
    stats: AtomicPoolStats,
    memory_probe: Box<dyn MemoryProbe>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("database", &self.database.sanitized_url())
            .field("database_available", &self.has_database())
            .field("active_sessions", &self.sessions.lock().len())
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}

impl ResourceManager {
    /// Build the manager, connecting the pool when a database URL is configured.
    ///
    /// An unreachable database is not an error: the manager is returned
    /// without a pool, logging a single warning, and every session request
    /// fails with [`ResourceError::DatabaseUnavailable`].
    pub async fn connect(database: DatabaseConfig, config: ResourceConfig) -> Self {
        let pool = match database.url.as_deref() {
            None => {
                info!("No database configured; resource manager running without a pool");
                None
            }
            Some(url) => match Self::create_pool(&database, url).await {
                Ok(pool) => {
                    info!(
                        database = ?database.sanitized_url(),
                        max_connections = database.max_connections,
                        "Database pool created successfully"
                    );
                    Some(pool)
                }
                Err(e) => {
                    warn!(
                        database = ?database.sanitized_url(),
                        error = %e,
                        "Database unreachable at startup; continuing without a pool"
                    );
                    None
                }
            },
        };

        Self::assemble(database, config, pool)
    }

    /// Manager that never touches a database
    pub fn without_database(config: ResourceConfig) -> Self {
        Self::assemble(DatabaseConfig::default(), config, None)
    }

    fn assemble(database: DatabaseConfig, config: ResourceConfig, pool: Option<PgPool>) -> Self {
        let stats = AtomicPoolStats::new("primary".to_string(), database.max_connections);
        Self {
            database,
            config,
            pool: RwLock::new(pool),
            rebuild_lock: tokio::sync::Mutex::new(()),
            sessions: Mutex::new(HashMap::new()),
            stats,
            memory_probe: Box::new(SysinfoProbe::new()),
        }
    }

    /// Replace the OS memory probe
    pub fn with_memory_probe(mut self, probe: Box<dyn MemoryProbe>) -> Self {
        self.memory_probe = probe;
        self
    }

    async fn create_pool(database: &DatabaseConfig, url: &str) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(database.max_connections)
            .min_connections(database.min_connections)
            .acquire_timeout(Duration::from_secs(database.acquire_timeout_seconds))
            .idle_timeout(Some(Duration::from_secs(database.idle_timeout_seconds)))
            .max_lifetime(Some(Duration::from_secs(database.max_lifetime_seconds)))
            .connect(url)
            .await
    }

    pub fn has_database(&self) -> bool {
        self.pool.read().is_some()
    }

    fn current_pool(&self) -> Option<PgPool> {
        self.pool.read().clone()
    }

    /// Run `operation` inside a transaction tagged with `module`.
    ///
    /// Commits when the operation succeeds, rolls back when it fails, and
    /// rolls back if the session was revoked by a cleanup while it ran.
    pub async fn session_scope<T, F>(&self, module: &str, operation: F) -> ResourceResult<T>
    where
        T: Send,
        F: for<'c> FnOnce(&'c mut PgConnection) -> BoxFuture<'c, Result<T, sqlx::Error>> + Send,
    {
        let pool = self.current_pool().ok_or_else(|| {
            ResourceError::DatabaseUnavailable("no connection pool available".to_string())
        })?;

        let acquire_started = Instant::now();
        let mut tx = match pool.begin().await {
            Ok(tx) => {
                self.stats.record_acquire(
                    acquire_started.elapsed().as_micros() as u64,
                    self.database.slow_acquire_threshold_ms * 1000,
                );
                tx
            }
            Err(e) => {
                self.stats.record_error();
                return Err(ResourceError::Database(e));
            }
        };

        let (session_id, revoked) = self.register_session(module);
        let _guard = SessionGuard {
            sessions: &self.sessions,
            session_id,
        };

        match operation(&mut *tx).await {
            Ok(value) => {
                if revoked.load(Ordering::Acquire) {
                    if let Err(e) = tx.rollback().await {
                        warn!(module = %module, error = %e, "Rollback of revoked session failed");
                    }
                    self.stats.record_rollback();
                    return Err(ResourceError::SessionRevoked {
                        session_id,
                        module: module.to_string(),
                    });
                }
                tx.commit().await?;
                self.stats.record_commit();
                Ok(value)
            }
            Err(e) => {
                debug!(module = %module, error = %e, "Session operation failed; rolling back");
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(module = %module, error = %rollback_err, "Rollback failed");
                }
                self.stats.record_rollback();
                Err(ResourceError::Database(e))
            }
        }
    }

    pub(crate) fn register_session(&self, module: &str) -> (Uuid, Arc<AtomicBool>) {
        let session_id = Uuid::new_v4();
        let revoked = Arc::new(AtomicBool::new(false));
        self.sessions.lock().insert(
            session_id,
            SessionEntry {
                module: module.to_string(),
                opened_at: Utc::now(),
                revoked: revoked.clone(),
            },
        );
        (session_id, revoked)
    }

    pub fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, entry)| SessionInfo {
                session_id: *id,
                module: entry.module.clone(),
                opened_at: entry.opened_at,
            })
            .collect()
    }

    /// Revoke every outstanding session; each rolls back instead of committing.
    /// Returns the number of sessions revoked.
    pub fn close_all_sessions(&self) -> usize {
        let drained: Vec<SessionEntry> = self.sessions.lock().drain().map(|(_, e)| e).collect();
        for entry in &drained {
            entry.revoked.store(true, Ordering::Release);
            debug!(module = %entry.module, opened_at = %entry.opened_at, "Session revoked");
        }
        if !drained.is_empty() {
            self.stats.record_revoked(drained.len() as u64);
            info!(count = drained.len(), "Closed outstanding sessions");
        }
        drained.len()
    }

    /// Sample memory and classify it against the configured thresholds
    pub fn check_memory(&self) -> MemoryCheck {
        let check = MemoryCheck::classify(
            self.memory_probe.sample(),
            self.config.memory_warning_threshold,
            self.config.memory_critical_threshold,
        );

        match check.level {
            MemoryLevel::Critical => error!(
                usage_percent = check.usage_fraction * 100.0,
                rss_bytes = ?check.sample.process_rss_bytes,
                "Memory usage critical"
            ),
            MemoryLevel::Warning => warn!(
                usage_percent = check.usage_fraction * 100.0,
                rss_bytes = ?check.sample.process_rss_bytes,
                "Memory usage high"
            ),
            MemoryLevel::Normal => debug!(
                usage_percent = check.usage_fraction * 100.0,
                "Memory usage normal"
            ),
        }

        check
    }

    /// Light cleanup after a module finishes; escalates when memory is critical
    pub async fn cleanup_between_modules(&self) -> MemoryCheck {
        let check = self.check_memory();
        if check.is_critical() {
            self.aggressive_cleanup().await;
        }
        check
    }

    /// Full cleanup after a cycle: revoke sessions, sample memory over the
    /// configured passes and rebuild the pool.
    pub async fn cleanup_between_cycles(&self) {
        info!("Running between-cycle resource cleanup");
        self.close_all_sessions();

        let passes = self.config.cleanup_passes.max(1);
        let mut last = self.check_memory();
        for _ in 1..passes {
            tokio::task::yield_now().await;
            last = self.check_memory();
        }

        if let Err(e) = self.rebuild_pool().await {
            warn!(error = %e, "Pool rebuild failed; keeping existing pool");
        }

        info!(
            usage_percent = last.usage_fraction * 100.0,
            pool = ?self.pool_status().size,
            "Between-cycle cleanup complete"
        );
    }

    async fn aggressive_cleanup(&self) {
        warn!("Memory critical; running aggressive cleanup");
        self.stats.record_aggressive_cleanup();
        self.close_all_sessions();
        if let Err(e) = self.rebuild_pool().await {
            warn!(error = %e, "Pool rebuild during aggressive cleanup failed");
        }
        let after = self.check_memory();
        info!(usage_percent = after.usage_fraction * 100.0, "Aggressive cleanup complete");
    }

    /// Dispose of the current pool and replace it with a fresh one.
    ///
    /// Only one rebuild runs at a time; a concurrent request is skipped. The
    /// old pool is closed in the background so a connection held by a hung
    /// module cannot block the caller.
    pub async fn rebuild_pool(&self) -> ResourceResult<()> {
        let Some(url) = self.database.url.clone() else {
            return Ok(());
        };
        if !self.has_database() {
            // Degraded at startup; stays degraded for the process lifetime
            return Ok(());
        }

        let Ok(_rebuild) = self.rebuild_lock.try_lock() else {
            debug!("Pool rebuild already in progress; skipping");
            return Ok(());
        };

        let fresh = Self::create_pool(&self.database, &url).await?;
        let old = self.pool.write().replace(fresh);
        if let Some(old) = old {
            tokio::spawn(async move {
                old.close().await;
            });
        }
        self.stats.record_rebuild();
        info!("Database pool rebuilt");
        Ok(())
    }

    pub fn pool_status(&self) -> PoolStatus {
        let pool = self.current_pool();
        let (size, idle) = pool
            .as_ref()
            .map(|p| (p.size(), p.num_idle() as u32))
            .unwrap_or((0, 0));
        let checked_out = size.saturating_sub(idle);

        PoolStatus {
            database_available: pool.is_some(),
            size,
            idle,
            checked_out,
            overflow: size.saturating_sub(self.database.min_connections),
            max_connections: self.database.max_connections,
            active_sessions: self.sessions.lock().len(),
            stats: self.stats.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::memory::StaticMemoryProbe;

    fn manager(usage: f64) -> ResourceManager {
        ResourceManager::without_database(ResourceConfig::default())
            .with_memory_probe(Box::new(StaticMemoryProbe::new(usage)))
    }

    #[tokio::test]
    async fn test_session_scope_without_database_is_unavailable() {
        let manager = manager(0.1);
        let result = manager
            .session_scope("yelp", |_conn| Box::pin(async { Ok(()) }))
            .await;
        assert!(matches!(result, Err(ResourceError::DatabaseUnavailable(_))));
    }

    #[tokio::test]
    async fn test_unparsable_url_degrades_without_pool() {
        let database = DatabaseConfig {
            url: Some("definitely not a database url".to_string()),
            ..DatabaseConfig::default()
        };
        let manager = ResourceManager::connect(database, ResourceConfig::default()).await;
        assert!(!manager.has_database());
        assert!(!manager.pool_status().database_available);
    }

    #[test]
    fn test_close_all_sessions_revokes_registered_sessions() {
        let manager = manager(0.1);
        let (_, first) = manager.register_session("maps");
        let (_, second) = manager.register_session("seo_audit");
        assert_eq!(manager.active_sessions().len(), 2);

        assert_eq!(manager.close_all_sessions(), 2);
        assert!(first.load(Ordering::Acquire));
        assert!(second.load(Ordering::Acquire));
        assert!(manager.active_sessions().is_empty());
        assert_eq!(manager.pool_status().stats.sessions_revoked, 2);
    }

    #[tokio::test]
    async fn test_critical_memory_triggers_aggressive_cleanup() {
        let manager = manager(0.92);
        manager.register_session("maps");

        let check = manager.cleanup_between_modules().await;
        assert!(check.is_critical());

        let status = manager.pool_status();
        assert_eq!(status.stats.aggressive_cleanups, 1);
        assert_eq!(status.active_sessions, 0);
    }

    #[tokio::test]
    async fn test_warning_memory_does_not_escalate() {
        let manager = manager(0.85);
        manager.register_session("maps");

        let check = manager.cleanup_between_modules().await;
        assert_eq!(check.level, MemoryLevel::Warning);
        assert_eq!(manager.pool_status().stats.aggressive_cleanups, 0);
        assert_eq!(manager.pool_status().active_sessions, 1);
    }

    #[tokio::test]
    async fn test_between_cycle_cleanup_without_pool_is_safe() {
        let manager = manager(0.3);
        manager.register_session("yelp");
        manager.cleanup_between_cycles().await;
        let status = manager.pool_status();
        assert_eq!(status.active_sessions, 0);
        assert_eq!(status.stats.pool_rebuilds, 0);
    }
}
