//! # Shared Resources
//!
//! Process-wide database connection pool and memory monitoring, owned by a
//! single [`ResourceManager`] built at the composition root.

pub mod manager;
pub mod memory;
pub mod pool_stats;

pub use manager::{PoolStatus, ResourceManager, SessionInfo};
pub use memory::{MemoryCheck, MemoryLevel, MemoryProbe, MemorySample, StaticMemoryProbe, SysinfoProbe};
pub use pool_stats::{AtomicPoolStats, PoolStatsSnapshot};
