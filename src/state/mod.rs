//! # Cycle State
//!
//! Durable cycle and module progress: the in-memory model, the persistence
//! strategy trait with its database and JSON file implementations, and the
//! [`StateStore`] that serializes all mutations.

pub mod backend;
pub mod file;
pub mod postgres;
pub mod store;
pub mod types;

pub use backend::StateBackend;
pub use file::JsonFileBackend;
pub use postgres::{DualWriteBackend, PostgresBackend};
pub use store::{PersistenceMode, StateStore};
pub use types::{CycleState, ModuleState, ModuleUpdate, RotationId, RotationStart, StatusSnapshot};
