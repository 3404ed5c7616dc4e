//! The process-wide pub/sub dispatcher.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use crate::awaiter::{AwaiterTable, SlotGuard};
use crate::error::WaitForError;
use crate::event::{Event, UNKNOWN_SOURCE, UNVERSIONED};
use crate::log::{EventLog, DEFAULT_LOG_CAPACITY};
use crate::module::ModuleHandle;
use crate::registry::{HandlerError, HandlerKind, Registry, UnsubscribeToken};

/// Tunable knobs for a [`Broker`]. The log bound is pulled out into a
/// config struct (rather than hardcoded) purely so tests can exercise
/// eviction without 1000 emissions.
#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub log_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

/// The process-wide pub/sub broker.
///
/// Always held behind an `Arc` — [`UnsubscribeToken`] and [`SlotGuard`]
/// both need a way to reach back into the broker without keeping it alive
/// forever, so construction always returns an `Arc<Broker>` rather than a
/// bare value.
pub struct Broker {
    registry: Registry,
    log: EventLog,
    awaiters: AwaiterTable,
    modules: RwLock<HashMap<String, Arc<dyn ModuleHandle>>>,
    debug: AtomicBool,
}

static GLOBAL: OnceLock<Arc<Broker>> = OnceLock::new();

impl Broker {
    fn build(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: Registry::new(),
            log: EventLog::new(config.log_capacity),
            awaiters: AwaiterTable::new(),
            modules: RwLock::new(HashMap::new()),
            debug: AtomicBool::new(false),
        })
    }

    /// Construct a fresh, independent broker (config knobs only — see
    /// [`BrokerConfig`]). Most callers want [`Broker::global`] instead;
    /// this exists for tests that want full isolation without touching
    /// the process singleton.
    pub fn with_config(config: BrokerConfig) -> Arc<Self> {
        Self::build(config)
    }

    /// The process-wide singleton, constructed on first access. Any two
    /// calls in the same process return handles to the same underlying
    /// registries.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL.get_or_init(|| Self::build(BrokerConfig::default())))
    }

    /// Testing seam: replace the singleton's registries with empty ones.
    /// Not part of the public contract; gated behind `test-util` so
    /// production code can't reach for it as a shortcut.
    #[cfg(any(test, feature = "test-util"))]
    pub fn reset() {
        let broker = Self::global();
        broker.registry.clear();
        broker.log.clear();
        broker.awaiters.clear();
        broker.modules.write().unwrap_or_else(|e| e.into_inner()).clear();
        broker.debug.store(false, Ordering::Relaxed);
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.registry
    }

    pub(crate) fn debug_enabled(&self) -> bool {
        self.debug.load(Ordering::Relaxed)
    }

    pub(crate) fn weak(self: &Arc<Self>) -> Weak<Self> {
        Arc::downgrade(self)
    }

    // ---- dispatch -----------------------------------------------------

    /// Subscribe a synchronous handler. Returns an idempotent unsubscribe
    /// token.
    pub fn subscribe<F>(self: &Arc<Self>, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_sync_owned(event_type, handler, false, None)
    }

    /// Subscribe a synchronous handler that fires at most once, then is
    /// removed from the registry.
    pub fn subscribe_once<F>(self: &Arc<Self>, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_sync_owned(event_type, handler, true, None)
    }

    /// Subscribe an asynchronous handler, scheduled as a background task
    /// on the currently running scheduler.
    pub fn subscribe_async<F, Fut>(self: &Arc<Self>, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe_async_owned(event_type, handler, false, None)
    }

    /// Asynchronous counterpart to [`Broker::subscribe_once`].
    pub fn subscribe_once_async<F, Fut>(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: F,
    ) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.subscribe_async_owned(event_type, handler, true, None)
    }

    pub(crate) fn subscribe_sync_owned<F>(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: F,
        once: bool,
        owner: Option<String>,
    ) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let event_type = event_type.into();
        let id = self.registry.insert(
            &event_type,
            HandlerKind::Sync(Arc::new(handler)),
            once,
            owner.clone(),
        );
        if self.debug_enabled() {
            tracing::debug!(
                event_type = %event_type,
                handler_id = id,
                once,
                owner = owner.as_deref().unwrap_or("-"),
                "subscribe"
            );
        }
        UnsubscribeToken::new(self.weak(), event_type, id)
    }

    pub(crate) fn subscribe_async_owned<F, Fut>(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        handler: F,
        once: bool,
        owner: Option<String>,
    ) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let event_type = event_type.into();
        let wrapped = Arc::new(move |event: Event| {
            Box::pin(handler(event)) as futures::future::BoxFuture<'static, Result<(), HandlerError>>
        });
        let id = self
            .registry
            .insert(&event_type, HandlerKind::Async(wrapped), once, owner.clone());
        if self.debug_enabled() {
            tracing::debug!(
                event_type = %event_type,
                handler_id = id,
                once,
                owner = owner.as_deref().unwrap_or("-"),
                "subscribe (async)"
            );
        }
        UnsubscribeToken::new(self.weak(), event_type, id)
    }

    /// Construct and dispatch an event.
    ///
    /// Appends to the log, snapshots the handler list, dispatches each
    /// handler in subscription order, then resolves any pending
    /// `wait_for` awaiters for `event_type`. Never suspends, never
    /// returns an error to the caller — handler failures are logged and
    /// do not abort dispatch.
    pub fn emit(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        detail: serde_json::Value,
        source: Option<&str>,
        version: Option<&str>,
    ) {
        let event_type = event_type.into();
        let event = Event::new(
            event_type.clone(),
            detail,
            source.unwrap_or(UNKNOWN_SOURCE),
            version.unwrap_or(UNVERSIONED),
        );

        self.log.push(event.clone());

        if self.debug_enabled() {
            tracing::debug!(event_type = %event.event_type, source = %event.meta.source, "emit");
        }

        let snapshot = self.registry.snapshot(&event_type);
        for record in snapshot {
            if record.once {
                self.registry.remove(&event_type, record.id);
            }
            match &record.handler {
                HandlerKind::Sync(handler) => {
                    let handler = Arc::clone(handler);
                    let outcome =
                        std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(&event)));
                    match outcome {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => tracing::warn!(
                            event_type = %event_type,
                            handler_id = record.id,
                            owner = record.owner.as_deref().unwrap_or("-"),
                            "handler failed: {err}"
                        ),
                        Err(panic) => tracing::warn!(
                            event_type = %event_type,
                            handler_id = record.id,
                            owner = record.owner.as_deref().unwrap_or("-"),
                            "handler panicked: {}",
                            panic_message(&panic)
                        ),
                    }
                }
                HandlerKind::Async(handler) => {
                    let handler = Arc::clone(handler);
                    let event = event.clone();
                    let event_type = event_type.clone();
                    let id = record.id;
                    let owner = record.owner.clone();
                    match tokio::runtime::Handle::try_current() {
                        Ok(rt) => {
                            rt.spawn(async move {
                                if let Err(err) = handler(event).await {
                                    tracing::warn!(
                                        event_type = %event_type,
                                        handler_id = id,
                                        owner = owner.as_deref().unwrap_or("-"),
                                        "async handler failed: {err}"
                                    );
                                }
                            });
                        }
                        Err(_) => tracing::warn!(
                            event_type = %event_type,
                            handler_id = id,
                            owner = owner.as_deref().unwrap_or("-"),
                            "no scheduler running; async handler dropped"
                        ),
                    }
                }
            }
        }

        self.awaiters.resolve(&event_type, &event);
    }

    /// Suspend until a matching event is emitted, the timeout elapses, or
    /// the caller is cancelled.
    pub async fn wait_for(
        self: &Arc<Self>,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Event, WaitForError> {
        let event_type = event_type.into();
        let (id, rx) = self.awaiters.insert(&event_type);
        let _guard = SlotGuard {
            awaiters: &self.awaiters,
            event_type: &event_type,
            id,
        };

        match timeout {
            Some(duration) => match tokio::time::timeout(duration, rx).await {
                Ok(Ok(event)) => Ok(event),
                Ok(Err(_)) => Err(WaitForError::Cancelled),
                Err(_) => Err(WaitForError::Timeout(duration)),
            },
            None => rx.await.map_err(|_| WaitForError::Cancelled),
        }
    }

    // ---- log/debug ------------------------------------------------------

    pub fn event_log(&self, limit: Option<usize>) -> Vec<Event> {
        self.log.snapshot(limit)
    }

    pub fn clear_event_log(&self) {
        self.log.clear();
    }

    pub fn set_debug(&self, enabled: bool) {
        self.debug.store(enabled, Ordering::Relaxed);
        if enabled {
            tracing::debug!("broker debug logging enabled");
        }
    }

    // ---- module registry ------------------------------------------------

    pub fn register_module(&self, module: Arc<dyn ModuleHandle>) {
        let name = module.name().to_string();
        if self.debug_enabled() {
            tracing::debug!(module = %name, "register_module");
        }
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, module);
    }

    pub fn unregister_module(&self, name: &str) -> Option<Arc<dyn ModuleHandle>> {
        self.modules
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
    }

    pub fn get_module(&self, name: &str) -> Option<Arc<dyn ModuleHandle>> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn list_modules(&self) -> Vec<String> {
        self.modules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

/// Best-effort extraction of a human-readable message from a caught panic.
pub(crate) fn panic_message(payload: &Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
