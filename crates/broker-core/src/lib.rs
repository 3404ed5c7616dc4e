//! broker-core: in-process publish/subscribe event broker and module
//! lifecycle protocol.
//!
//! This crate is the communication backbone for a modular toolkit: every
//! module publishes typed events and subscribes to event types through a
//! single process-wide [`Broker`], never invoking another module
//! directly.
//!
//! ```
//! use broker_core::Broker;
//!
//! let broker = Broker::with_config(Default::default());
//! let _token = broker.subscribe("midi:note-on", |event| {
//!     println!("note: {:?}", event.detail);
//!     Ok(())
//! });
//! broker.emit("midi:note-on", serde_json::json!({ "note": 60 }), None, None);
//! ```
//!
//! Out of scope for this crate: cross-process transport, persistent
//! storage, guaranteed delivery/replay, priority queues or topic
//! wildcards, and backpressure against fast publishers — see the
//! project's design notes for the external adapters that build on top.

mod awaiter;
mod broker;
mod error;
mod event;
mod log;
mod module;
mod registry;

pub use broker::{Broker, BrokerConfig};
pub use error::{ModuleInitError, WaitForError};
pub use event::{Event, EventMeta, UNKNOWN_SOURCE, UNVERSIONED};
pub use log::DEFAULT_LOG_CAPACITY;
pub use module::{
    Module, ModuleBase, ModuleHandle, ModuleHooks, ModuleStatus, ModuleStatusSnapshot,
    EVENT_MODULE_DESTROYED, EVENT_MODULE_ERROR, EVENT_MODULE_INITIALIZING, EVENT_MODULE_READY,
};
pub use registry::{AsyncHandlerFn, HandlerError, HandlerKind, SyncHandlerFn, UnsubscribeToken};
