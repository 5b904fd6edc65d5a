//! Error types for the cycle orchestrator.
//!
//! Each component owns a narrow error enum; [`CycleError`] aggregates them for
//! callers that drive the whole system.

use thiserror::Error;

use crate::config::ConfigurationError;

/// Errors raised by a worker implementation or the worker runner.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WorkerError {
    /// Fetching the next batch of items failed
    #[error("Failed to fetch items for {module}: {reason}")]
    FetchFailed { module: String, reason: String },
    /// Processing a single item failed
    #[error("Failed to process item {item_id}: {reason}")]
    ItemFailed { item_id: i64, reason: String },
    /// A runner was started while it was already running
    #[error("Worker {0} is already running")]
    AlreadyRunning(String),
    #[error("Worker error: {0}")]
    Other(String),
}

impl WorkerError {
    pub fn item_failed(item_id: i64, reason: impl Into<String>) -> Self {
        Self::ItemFailed {
            item_id,
            reason: reason.into(),
        }
    }

    pub fn fetch_failed(module: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FetchFailed {
            module: module.into(),
            reason: reason.into(),
        }
    }
}

/// Errors produced by the state store and its persistence backends.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("State file I/O error at {path}: {error}")]
    Io { path: String, error: String },
    #[error("State serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Unknown module: {0}")]
    UnknownModule(String),
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        StateError::Database(err.to_string())
    }
}

impl From<ResourceError> for StateError {
    fn from(err: ResourceError) -> Self {
        StateError::Database(err.to_string())
    }
}

/// Errors produced by the resource manager.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// No connection pool is available (never configured or unreachable at startup)
    #[error("Database unavailable: {0}")]
    DatabaseUnavailable(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// The session was revoked by a between-cycle cleanup before it could commit
    #[error("Session {session_id} for {module} was revoked during cleanup")]
    SessionRevoked { session_id: uuid::Uuid, module: String },
    #[error("Session operation failed: {0}")]
    Operation(String),
}

/// Errors returned by the orchestrator's operational API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Orchestrator is already running")]
    AlreadyRunning,
    #[error("Operation not allowed while the orchestrator is running: {0}")]
    RunningConflict(String),
    #[error("Module {0} is not part of the configured rotation")]
    UnknownModule(String),
    #[error("Timed out after {0:?} waiting for the control loop to stop")]
    StopTimeout(std::time::Duration),
    #[error("Activity log error: {0}")]
    ActivityLog(String),
}

/// Crate-level error aggregating every component error.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),
}

pub type Result<T> = std::result::Result<T, CycleError>;
pub type StateResult<T> = std::result::Result<T, StateError>;
pub type ResourceResult<T> = std::result::Result<T, ResourceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_failed_display() {
        let err = WorkerError::item_failed(42, "timeout");
        assert_eq!(err.to_string(), "Failed to process item 42: timeout");
    }

    #[test]
    fn test_state_error_wraps_into_cycle_error() {
        let err: CycleError = StateError::UnknownModule("maps".to_string()).into();
        assert!(err.to_string().contains("maps"));
    }

    #[test]
    fn test_resource_error_converts_to_state_error() {
        let err: StateError = ResourceError::DatabaseUnavailable("no url".to_string()).into();
        assert!(matches!(err, StateError::Database(_)));
    }
}
