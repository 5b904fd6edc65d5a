//! State backend trait definition.
//!
//! [`StateBackend`] is the persistence strategy behind the
//! [`StateStore`](super::StateStore). One implementation is selected when the
//! store is opened and kept for the process lifetime; no per-call fallback
//! decisions are made.

use async_trait::async_trait;

use super::types::CycleState;
use crate::error::StateResult;

/// Storage contract for cycle state.
///
/// Implementations must be `Send + Sync` for use behind `Box<dyn StateBackend>`.
#[async_trait]
pub trait StateBackend: Send + Sync {
    /// Short name shown in status views
    fn name(&self) -> &'static str;

    /// Most recent cycle whose status is `running`, if any
    async fn load_running_cycle(&self) -> StateResult<Option<CycleState>>;

    /// Persist the cycle row and every module
    async fn save_cycle(&self, cycle: &CycleState) -> StateResult<()>;

    /// Persist one module's progress. Backends that cannot write a single
    /// module may rewrite the whole cycle.
    async fn save_module(&self, cycle: &CycleState, module: &str) -> StateResult<()>;

    /// Remove all persisted state
    async fn clear(&self) -> StateResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trait_is_object_safe() {
        fn _assert_object_safe(_: &dyn StateBackend) {}
    }
}
