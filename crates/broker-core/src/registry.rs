//! The handler registry: type → ordered list of handler records.
//!
//! Mutated by `subscribe`/unsubscribe, read via a defensive snapshot by
//! `emit` (see [`Registry::snapshot`]). Snapshot-on-dispatch is mandatory:
//! handlers may add or remove subscriptions during dispatch and must never
//! cause iteration to fault.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{RwLock, Weak};

use futures::future::BoxFuture;

use crate::broker::Broker;
use crate::event::Event;

/// An error returned by a handler. Logged and swallowed — never
/// propagated back to the emitter.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A synchronous handler: invoked immediately, `emit` blocks on it.
pub type SyncHandlerFn = dyn Fn(&Event) -> Result<(), HandlerError> + Send + Sync;

/// An asynchronous handler: scheduled as a background task, `emit` does
/// not await it.
pub type AsyncHandlerFn =
    dyn Fn(Event) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync;

/// The two handler kinds a subscription may register: a tagged variant
/// rather than a uniform "returns optional future" contract, since that
/// reads more plainly at the call site.
#[derive(Clone)]
pub enum HandlerKind {
    Sync(std::sync::Arc<SyncHandlerFn>),
    Async(std::sync::Arc<AsyncHandlerFn>),
}

impl fmt::Debug for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerKind::Sync(_) => f.write_str("HandlerKind::Sync(..)"),
            HandlerKind::Async(_) => f.write_str("HandlerKind::Async(..)"),
        }
    }
}

/// `(event_type, handler_ref, is_once, owner_module_name_or_null)`, plus
/// the id an [`UnsubscribeToken`] targets.
#[derive(Clone, Debug)]
pub(crate) struct HandlerRecord {
    pub id: u64,
    pub handler: HandlerKind,
    pub once: bool,
    pub owner: Option<String>,
}

/// An idempotent, infallible handle returned by `subscribe`/`subscribe_once`.
///
/// Invoking it removes exactly the handler record it was issued for.
/// Invoking it again (or after the handler already fired via `once`) is a
/// no-op. Holds a `Weak` reference to the broker rather than unsubscribing
/// on `Drop`: module teardown invokes these explicitly and exactly once
/// during `destroy`, so auto-unsubscribe-on-drop would be surprising here.
#[derive(Clone)]
pub struct UnsubscribeToken {
    broker: Weak<Broker>,
    event_type: String,
    id: u64,
}

impl UnsubscribeToken {
    pub(crate) fn new(broker: Weak<Broker>, event_type: String, id: u64) -> Self {
        Self {
            broker,
            event_type,
            id,
        }
    }

    /// Remove the targeted handler record, if still present. Never fails.
    pub fn unsubscribe(&self) {
        if let Some(broker) = self.broker.upgrade() {
            let removed = broker.registry().remove(&self.event_type, self.id);
            if removed && broker.debug_enabled() {
                tracing::debug!(event_type = %self.event_type, handler_id = self.id, "unsubscribe");
            }
        }
    }
}

impl fmt::Debug for UnsubscribeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsubscribeToken")
            .field("event_type", &self.event_type)
            .field("id", &self.id)
            .finish()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    handlers: RwLock<HashMap<String, Vec<HandlerRecord>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &self,
        event_type: &str,
        handler: HandlerKind,
        once: bool,
        owner: Option<String>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = HandlerRecord {
            id,
            handler,
            once,
            owner,
        };
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(event_type.to_string())
            .or_default()
            .push(record);
        id
    }

    /// Remove the record with `id` from `event_type`'s list. No-op if it
    /// is not present (already unsubscribed, or already fired once).
    pub fn remove(&self, event_type: &str, id: u64) -> bool {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(list) = guard.get_mut(event_type) {
            let before = list.len();
            list.retain(|r| r.id != id);
            return list.len() != before;
        }
        false
    }

    /// A defensive copy of the current handler list for `event_type`, in
    /// subscription order. Dispatch iterates this, never the live list.
    pub fn snapshot(&self, event_type: &str) -> Vec<HandlerRecord> {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(event_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Remove every handler record owned by `owner`. Used by
    /// `Module::destroy` as a defensive backstop; in ordinary operation
    /// the module's own `unsubs` list already removes each record by id.
    pub fn remove_owned_by(&self, owner: &str) {
        let mut guard = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        for list in guard.values_mut() {
            list.retain(|r| r.owner.as_deref() != Some(owner));
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_snapshot_preserve_subscription_order() {
        let registry = Registry::new();
        for _ in 0..3 {
            registry.insert(
                "t",
                HandlerKind::Sync(std::sync::Arc::new(|_| Ok(()))),
                false,
                None,
            );
        }
        assert_eq!(registry.snapshot("t").len(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = Registry::new();
        let id = registry.insert(
            "t",
            HandlerKind::Sync(std::sync::Arc::new(|_| Ok(()))),
            false,
            None,
        );
        assert!(registry.remove("t", id));
        assert!(!registry.remove("t", id));
        assert!(registry.snapshot("t").is_empty());
    }

    #[test]
    fn snapshot_of_unknown_type_is_empty() {
        let registry = Registry::new();
        assert!(registry.snapshot("nothing-subscribed").is_empty());
    }
}
