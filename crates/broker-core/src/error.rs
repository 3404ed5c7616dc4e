//! Error kinds surfaced by the broker and the module lifecycle.
//!
//! Handler failures and unsubscribe failures during `destroy` are
//! deliberately *not* represented here: per the propagation policy, those
//! are caught, logged via `tracing::warn!`, and never handed back to a
//! caller. Only the error kinds that are re-raised get a type.

use std::time::Duration;

use crate::module::ModuleStatus;

/// Errors from [`crate::Broker::wait_for`].
#[derive(Debug, thiserror::Error)]
pub enum WaitForError {
    /// The deadline passed before a matching event was emitted.
    #[error("wait_for timed out after {0:?}")]
    Timeout(Duration),
    /// The wait was cancelled by the host scheduler before it resolved.
    #[error("wait_for was cancelled")]
    Cancelled,
}

/// Errors from the module lifecycle (`Module::init`).
#[derive(Debug, thiserror::Error)]
pub enum ModuleInitError {
    /// `user_init` returned an error; the module has transitioned to
    /// [`ModuleStatus::Error`] and emitted `module:error` before this is
    /// returned to the caller.
    #[error("module '{module}' failed to initialize: {source}")]
    UserInitFailed {
        module: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// `init()` was called on a module that was not `UNINITIALIZED`.
    #[error("init() called on a module in state {0:?}, expected Uninitialized")]
    InvalidState(ModuleStatus),
}
