//! Shared application state.

use std::sync::Arc;

use ledger::LifecycleMachine;

/// State held by the API and shared across request handlers.
///
/// The lifecycle machine is internally synchronized (per-sheet locks
/// plus the chain's append lock), so handlers call it directly
/// without an outer mutex.
pub struct AppState {
    pub machine: LifecycleMachine,
}

/// Thread-safe alias for `AppState`.
pub type SharedState = Arc<AppState>;
