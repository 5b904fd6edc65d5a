//! # Connection Pool Statistics
//!
//! SWMR (Single Writer, Multiple Reader) atomic statistics for connection pool
//! observability. Uses `AtomicU64` with relaxed ordering for hot-path recording
//! and provides snapshot DTOs for readers.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic connection pool and session statistics.
///
/// Writers record on hot paths using `Relaxed` ordering. Readers call
/// `snapshot()` to get a consistent-enough view.
#[derive(Debug)]
pub struct AtomicPoolStats {
    /// Pool identifier
    pool_name: String,

    /// Maximum connections configured for this pool
    max_connections: u32,

    /// Total successful acquires
    total_acquires: AtomicU64,

    /// Total acquire time in microseconds (for average computation)
    total_acquire_time_us: AtomicU64,

    /// Number of acquires exceeding slow threshold
    slow_acquires: AtomicU64,

    /// Maximum acquire time observed (in microseconds)
    max_acquire_time_us: AtomicU64,

    /// Total acquire errors (timeouts, pool exhaustion)
    acquire_errors: AtomicU64,

    sessions_committed: AtomicU64,
    sessions_rolled_back: AtomicU64,
    sessions_revoked: AtomicU64,

    /// Completed dispose-and-rebuild cycles
    pool_rebuilds: AtomicU64,

    /// Cleanups escalated because memory was critical
    aggressive_cleanups: AtomicU64,
}

impl AtomicPoolStats {
    /// Create a new stats tracker for a named pool.
    pub fn new(pool_name: String, max_connections: u32) -> Self {
        Self {
            pool_name,
            max_connections,
            total_acquires: AtomicU64::new(0),
            total_acquire_time_us: AtomicU64::new(0),
            slow_acquires: AtomicU64::new(0),
            max_acquire_time_us: AtomicU64::new(0),
            acquire_errors: AtomicU64::new(0),
            sessions_committed: AtomicU64::new(0),
            sessions_rolled_back: AtomicU64::new(0),
            sessions_revoked: AtomicU64::new(0),
            pool_rebuilds: AtomicU64::new(0),
            aggressive_cleanups: AtomicU64::new(0),
        }
    }

    /// Record a successful connection acquire.
    #[inline]
    pub fn record_acquire(&self, duration_us: u64, slow_threshold_us: u64) {
        self.total_acquires.fetch_add(1, Ordering::Relaxed);
        self.total_acquire_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
        self.max_acquire_time_us
            .fetch_max(duration_us, Ordering::Relaxed);

        if duration_us >= slow_threshold_us {
            self.slow_acquires.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record an acquire error (timeout, pool exhaustion).
    #[inline]
    pub fn record_error(&self) {
        self.acquire_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_commit(&self) {
        self.sessions_committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rollback(&self) {
        self.sessions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_revoked(&self, count: u64) {
        self.sessions_revoked.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_rebuild(&self) {
        self.pool_rebuilds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aggressive_cleanup(&self) {
        self.aggressive_cleanups.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a snapshot of current statistics.
    ///
    /// Individual loads are relaxed, so values may be slightly stale but are
    /// always monotonically increasing.
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        let total_acquires = self.total_acquires.load(Ordering::Relaxed);
        let total_acquire_time_us = self.total_acquire_time_us.load(Ordering::Relaxed);

        let average_acquire_time_us = if total_acquires > 0 {
            total_acquire_time_us as f64 / total_acquires as f64
        } else {
            0.0
        };

        PoolStatsSnapshot {
            pool_name: self.pool_name.clone(),
            max_connections: self.max_connections,
            total_acquires,
            slow_acquires: self.slow_acquires.load(Ordering::Relaxed),
            acquire_errors: self.acquire_errors.load(Ordering::Relaxed),
            average_acquire_time_us,
            max_acquire_time_us: self.max_acquire_time_us.load(Ordering::Relaxed),
            sessions_committed: self.sessions_committed.load(Ordering::Relaxed),
            sessions_rolled_back: self.sessions_rolled_back.load(Ordering::Relaxed),
            sessions_revoked: self.sessions_revoked.load(Ordering::Relaxed),
            pool_rebuilds: self.pool_rebuilds.load(Ordering::Relaxed),
            aggressive_cleanups: self.aggressive_cleanups.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatsSnapshot {
    pub pool_name: String,
    pub max_connections: u32,
    pub total_acquires: u64,
    pub slow_acquires: u64,
    pub acquire_errors: u64,
    pub average_acquire_time_us: f64,
    pub max_acquire_time_us: u64,
    pub sessions_committed: u64,
    pub sessions_rolled_back: u64,
    pub sessions_revoked: u64,
    pub pool_rebuilds: u64,
    pub aggressive_cleanups: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slow_threshold_tracking() {
        let stats = AtomicPoolStats::new("state".to_string(), 10);

        stats.record_acquire(500, 1000); // not slow
        stats.record_acquire(1500, 1000); // slow
        stats.record_acquire(1000, 1000); // exactly at threshold = slow

        let snap = stats.snapshot();
        assert_eq!(snap.total_acquires, 3);
        assert_eq!(snap.slow_acquires, 2);
        assert_eq!(snap.max_acquire_time_us, 1500);
    }

    #[test]
    fn test_average_with_no_acquires() {
        let stats = AtomicPoolStats::new("state".to_string(), 10);
        assert_eq!(stats.snapshot().average_acquire_time_us, 0.0);
    }

    #[test]
    fn test_session_and_maintenance_counters() {
        let stats = AtomicPoolStats::new("leads".to_string(), 25);

        stats.record_commit();
        stats.record_commit();
        stats.record_rollback();
        stats.record_revoked(3);
        stats.record_rebuild();
        stats.record_aggressive_cleanup();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.pool_name, "leads");
        assert_eq!(snap.max_connections, 25);
        assert_eq!(snap.sessions_committed, 2);
        assert_eq!(snap.sessions_rolled_back, 1);
        assert_eq!(snap.sessions_revoked, 3);
        assert_eq!(snap.pool_rebuilds, 1);
        assert_eq!(snap.aggressive_cleanups, 1);
        assert_eq!(snap.acquire_errors, 1);
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AtomicPoolStats>();
    }
}
