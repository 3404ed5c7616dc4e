//! The module base protocol: lifecycle + subscription-lifetime binding.
//!
//! `ModuleBase` holds the shared lifecycle state (identity, status,
//! `unsubs`). `Module<H>` composes a `ModuleBase` with a user-supplied
//! [`ModuleHooks`] implementation. `init`/`destroy` are inherent methods
//! on `Module<H>`, never part of the trait concrete modules implement —
//! that is how this crate enforces the "`init` is not overridable"
//! contract structurally rather than by convention.

use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::{self, Either};
use futures::pin_mut;
use tokio::sync::oneshot;

use crate::broker::Broker;
use crate::error::{ModuleInitError, WaitForError};
use crate::event::Event;
use crate::registry::{HandlerError, UnsubscribeToken};

/// Reserved event types emitted only by the module base, never by user
/// code.
pub const EVENT_MODULE_INITIALIZING: &str = "module:initializing";
pub const EVENT_MODULE_READY: &str = "module:ready";
pub const EVENT_MODULE_ERROR: &str = "module:error";
pub const EVENT_MODULE_DESTROYED: &str = "module:destroyed";

/// A module's position in the lifecycle graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
    Destroyed,
}

/// A snapshot of a module's identity and status, returned by
/// `get_status()`. A copy, not a live handle — callers needing fresh
/// state call `get_status()` again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleStatusSnapshot {
    pub name: String,
    pub version: String,
    pub description: String,
    pub status: ModuleStatus,
}

/// Object-safe view over a registered module, used by the broker's module
/// registry (`get_module`/`list_modules`) so modules generic over their
/// hook type can be stored uniformly.
pub trait ModuleHandle: Send + Sync {
    fn name(&self) -> &str;
    fn version(&self) -> &str;
    fn description(&self) -> &str;
    fn status(&self) -> ModuleStatus;
    fn get_status(&self) -> ModuleStatusSnapshot;
    /// Idempotent teardown: invoke every `unsubs` token, unregister from
    /// the broker, emit `module:destroyed`. A no-op if already destroyed.
    fn destroy(&self);
}

/// The single overridable extension point of the module lifecycle.
/// Implementors customize startup only — `init`/`destroy` themselves
/// live on [`Module`] and cannot be overridden.
#[async_trait]
pub trait ModuleHooks: Send + Sync + 'static {
    /// Called between the `INITIALIZING` and `READY` transitions. `base`
    /// exposes the module's own `emit`/`on`/`once`/`wait_for` so startup
    /// can wire up subscriptions under this module's identity.
    async fn user_init(&self, base: &ModuleBase) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let _ = base;
        Ok(())
    }
}

/// A cancellation handle for a module's in-flight `wait_for`. Recorded in
/// `unsubs` alongside ordinary subscription tokens so `destroy()` can tear
/// down a pending wait the same way it tears down a subscription.
/// Idempotent: signalling it twice, or signalling it after the wait has
/// already resolved on its own, is a no-op.
#[derive(Clone)]
struct WaitCancelHandle {
    cancel_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl WaitCancelHandle {
    fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                cancel_tx: Arc::new(Mutex::new(Some(tx))),
            },
            rx,
        )
    }

    fn cancel(&self) {
        if let Some(tx) = self.cancel_tx.lock().unwrap_or_else(|e| e.into_inner()).take() {
            let _ = tx.send(());
        }
    }
}

/// An entry in a module's `unsubs` list: either an ordinary subscription
/// token or a pending `wait_for`'s cancellation handle. Both are torn
/// down the same way on `destroy()`.
enum UnsubKind {
    Subscription(UnsubscribeToken),
    Wait(WaitCancelHandle),
}

impl UnsubKind {
    fn invoke(&self) {
        match self {
            UnsubKind::Subscription(token) => token.unsubscribe(),
            UnsubKind::Wait(handle) => handle.cancel(),
        }
    }
}

/// Removes its module's tracked `wait_for` entry from `unsubs` when the
/// wait resolves, times out, or is dropped on its own — so a wait that
/// completes without the module being destroyed doesn't leave a stale
/// entry behind.
struct WaitTrackGuard<'a> {
    base: &'a ModuleBase,
    handle: WaitCancelHandle,
}

impl Drop for WaitTrackGuard<'_> {
    fn drop(&mut self) {
        self.base
            .unsubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|entry| match entry {
                UnsubKind::Wait(h) => !Arc::ptr_eq(&h.cancel_tx, &self.handle.cancel_tx),
                UnsubKind::Subscription(_) => true,
            });
    }
}

/// Shared lifecycle state for a module: identity, status, and the
/// `unsubs` list binding subscription lifetime to module lifetime. A
/// module exclusively owns its own `unsubs` list.
pub struct ModuleBase {
    broker: Arc<Broker>,
    name: String,
    version: String,
    description: String,
    status: RwLock<ModuleStatus>,
    unsubs: Mutex<Vec<UnsubKind>>,
}

impl ModuleBase {
    fn new(broker: Arc<Broker>, name: String, version: String, description: String) -> Self {
        Self {
            broker,
            name,
            version,
            description,
            status: RwLock::new(ModuleStatus::Uninitialized),
            unsubs: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn status(&self) -> ModuleStatus {
        *self.status.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_status(&self) -> ModuleStatusSnapshot {
        ModuleStatusSnapshot {
            name: self.name.clone(),
            version: self.version.clone(),
            description: self.description.clone(),
            status: self.status(),
        }
    }

    fn set_status(&self, status: ModuleStatus) {
        *self.status.write().unwrap_or_else(|e| e.into_inner()) = status;
    }

    fn track(&self, token: UnsubscribeToken) -> UnsubscribeToken {
        self.unsubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UnsubKind::Subscription(token.clone()));
        token
    }

    /// Emit under this module's identity: `source`/`version` are always
    /// the module's own, never overridable by the caller.
    pub fn emit(&self, event_type: impl Into<String>, detail: serde_json::Value) {
        self.broker
            .emit(event_type, detail, Some(&self.name), Some(&self.version));
    }

    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let token = self
            .broker
            .subscribe_sync_owned(event_type, handler, false, Some(self.name.clone()));
        self.track(token)
    }

    pub fn once<F>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let token = self
            .broker
            .subscribe_sync_owned(event_type, handler, true, Some(self.name.clone()));
        self.track(token)
    }

    pub fn on_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let token =
            self.broker
                .subscribe_async_owned(event_type, handler, false, Some(self.name.clone()));
        self.track(token)
    }

    pub fn once_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let token =
            self.broker
                .subscribe_async_owned(event_type, handler, true, Some(self.name.clone()));
        self.track(token)
    }

    /// As the broker's `wait_for`, but the pending wait is recorded in this
    /// module's `unsubs` list: a subsequent `destroy()` cancels it in place
    /// of letting it dangle until its own timeout.
    pub async fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Event, WaitForError> {
        let (handle, cancel_rx) = WaitCancelHandle::new();
        self.unsubs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(UnsubKind::Wait(handle.clone()));
        let _guard = WaitTrackGuard {
            base: self,
            handle: handle.clone(),
        };

        let wait_fut = self.broker.wait_for(event_type, timeout);
        pin_mut!(wait_fut);
        pin_mut!(cancel_rx);

        match future::select(wait_fut, cancel_rx).await {
            Either::Left((result, _)) => result,
            Either::Right((_, _)) => Err(WaitForError::Cancelled),
        }
    }

    /// Idempotent teardown shared by every path that leads to `DESTROYED`
    /// (from `UNINITIALIZED`, the `unsubs` list is simply empty, so this
    /// is the same code path).
    fn destroy_impl(&self) {
        {
            let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
            if *status == ModuleStatus::Destroyed {
                return;
            }
            *status = ModuleStatus::Destroyed;
        }

        let tokens: Vec<UnsubKind> =
            std::mem::take(&mut *self.unsubs.lock().unwrap_or_else(|e| e.into_inner()));
        for token in tokens {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| token.invoke()));
            if let Err(panic) = outcome {
                tracing::warn!(
                    module = %self.name,
                    "unsubscribe failed during destroy: {}",
                    crate::broker::panic_message(&panic)
                );
            }
        }
        // Defensive backstop: the loop above already removed every handler
        // by id via its own token, so this should find nothing left, but
        // it closes the gap for any record whose owner tag outlives its
        // token (e.g. one registered directly through the broker).
        self.broker.registry().remove_owned_by(&self.name);

        self.broker.unregister_module(&self.name);
        self.emit(EVENT_MODULE_DESTROYED, serde_json::json!({ "name": self.name }));
    }
}

/// A concrete module: shared lifecycle state plus its `user_init` hook.
///
/// Always held behind `Arc` — the broker's module registry stores
/// `Arc<dyn ModuleHandle>`, and a module typically outlives the scope
/// that created it (subscriptions close over it).
pub struct Module<H: ModuleHooks> {
    base: ModuleBase,
    hooks: H,
}

impl<H: ModuleHooks> Module<H> {
    /// Construct a module bound to the process-wide broker and register
    /// it under `name`. Re-registering a name already present replaces
    /// the previous entry (permissive last-write-wins).
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        hooks: H,
    ) -> Arc<Self> {
        Self::with_broker(Broker::global(), name, version, description, hooks)
    }

    /// As [`Module::new`], but bound to an explicit broker instance
    /// rather than the process singleton — primarily for test isolation.
    pub fn with_broker(
        broker: Arc<Broker>,
        name: impl Into<String>,
        version: impl Into<String>,
        description: impl Into<String>,
        hooks: H,
    ) -> Arc<Self> {
        let module = Arc::new(Self {
            base: ModuleBase::new(broker.clone(), name.into(), version.into(), description.into()),
            hooks,
        });
        broker.register_module(module.clone() as Arc<dyn ModuleHandle>);
        module
    }

    /// The lifecycle template method: validate status, transition to
    /// `INITIALIZING`, emit, call `user_init`, transition to
    /// `READY`/`ERROR`, emit. Not part of [`ModuleHooks`] — concrete
    /// modules cannot override this.
    pub async fn init(self: &Arc<Self>) -> Result<(), ModuleInitError> {
        {
            let mut status = self.base.status.write().unwrap_or_else(|e| e.into_inner());
            if *status != ModuleStatus::Uninitialized {
                return Err(ModuleInitError::InvalidState(*status));
            }
            *status = ModuleStatus::Initializing;
        }
        self.base
            .emit(EVENT_MODULE_INITIALIZING, serde_json::json!({ "name": self.base.name }));

        match self.hooks.user_init(&self.base).await {
            Ok(()) => {
                self.base.set_status(ModuleStatus::Ready);
                self.base.emit(EVENT_MODULE_READY, serde_json::json!({ "name": self.base.name }));
                Ok(())
            }
            Err(source) => {
                self.base.set_status(ModuleStatus::Error);
                self.base.emit(
                    EVENT_MODULE_ERROR,
                    serde_json::json!({ "name": self.base.name, "message": source.to_string() }),
                );
                Err(ModuleInitError::UserInitFailed {
                    module: self.base.name.clone(),
                    source,
                })
            }
        }
    }

    /// Idempotent, non-suspending teardown.
    pub fn destroy(&self) {
        self.base.destroy_impl();
    }

    pub fn emit(&self, event_type: impl Into<String>, detail: serde_json::Value) {
        self.base.emit(event_type, detail);
    }

    pub fn on<F>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.base.on(event_type, handler)
    }

    pub fn once<F>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(&Event) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.base.once(event_type, handler)
    }

    pub fn on_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.base.on_async(event_type, handler)
    }

    pub fn once_async<F, Fut>(&self, event_type: impl Into<String>, handler: F) -> UnsubscribeToken
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.base.once_async(event_type, handler)
    }

    pub async fn wait_for(
        &self,
        event_type: impl Into<String>,
        timeout: Option<Duration>,
    ) -> Result<Event, WaitForError> {
        self.base.wait_for(event_type, timeout).await
    }

    pub fn get_status(&self) -> ModuleStatusSnapshot {
        self.base.get_status()
    }

    pub fn name(&self) -> &str {
        self.base.name()
    }

    /// Direct access to the hooks implementation, e.g. for a concrete
    /// module's own inherent methods defined via an extension trait.
    pub fn hooks(&self) -> &H {
        &self.hooks
    }
}

impl<H: ModuleHooks> ModuleHandle for Module<H> {
    fn name(&self) -> &str {
        self.base.name()
    }

    fn version(&self) -> &str {
        self.base.version()
    }

    fn description(&self) -> &str {
        self.base.description()
    }

    fn status(&self) -> ModuleStatus {
        self.base.status()
    }

    fn get_status(&self) -> ModuleStatusSnapshot {
        self.base.get_status()
    }

    fn destroy(&self) {
        self.base.destroy_impl();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NoopHooks;
    #[async_trait]
    impl ModuleHooks for NoopHooks {}

    struct FailingHooks;
    #[async_trait]
    impl ModuleHooks for FailingHooks {
        async fn user_init(&self, _base: &ModuleBase) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("synth failed to load".into())
        }
    }

    fn broker() -> Arc<Broker> {
        Broker::with_config(BrokerConfig { log_capacity: 32 })
    }

    #[tokio::test]
    async fn identity_stamping_on_emit() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "Piano", "1.2.3", "a piano module", NoopHooks);
        module.init().await.unwrap();

        let captured = Arc::new(RwLock::new(None));
        let captured_clone = Arc::clone(&captured);
        broker.subscribe("midi:note-on", move |event: &Event| {
            *captured_clone.write().unwrap() = Some(event.clone());
            Ok(())
        });

        module.emit("midi:note-on", serde_json::json!({ "note": 72 }));

        let event = captured.read().unwrap().clone().unwrap();
        assert_eq!(event.meta.source, "Piano");
        assert_eq!(event.meta.version, "1.2.3");
    }

    #[tokio::test]
    async fn lifecycle_canonical_order_on_success() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "Piano", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        let log = broker.event_log(None);
        let reserved: Vec<&str> = log
            .iter()
            .filter(|e| e.event_type.starts_with("module:"))
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(reserved, vec!["module:initializing", "module:ready"]);
        assert_eq!(module.get_status().status, ModuleStatus::Ready);
    }

    #[tokio::test]
    async fn failed_user_init_transitions_to_error_and_reraises() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "Synth", "0.1.0", "", FailingHooks);
        let result = module.init().await;

        assert!(result.is_err());
        assert_eq!(module.get_status().status, ModuleStatus::Error);
        let log = broker.event_log(None);
        let reserved: Vec<&str> = log
            .iter()
            .filter(|e| e.event_type.starts_with("module:"))
            .map(|e| e.event_type.as_str())
            .collect();
        assert_eq!(reserved, vec!["module:initializing", "module:error"]);
    }

    #[tokio::test]
    async fn destroy_cleans_subscriptions_and_unregisters() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let calls_x = Arc::clone(&calls);
        let calls_y = Arc::clone(&calls);
        module.on("x", move |_event: &Event| {
            calls_x.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        module.on("y", move |_event: &Event| {
            calls_y.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        module.destroy();

        broker.emit("x", serde_json::json!(null), None, None);
        broker.emit("y", serde_json::json!(null), None, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!broker.list_modules().contains(&"M".to_string()));

        let log = broker.event_log(None);
        assert!(log
            .iter()
            .any(|e| e.event_type == "module:destroyed" && e.meta.source == "M"));
    }

    #[tokio::test]
    async fn destroy_is_idempotent() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        module.destroy();
        module.destroy();

        let destroyed_count = broker
            .event_log(None)
            .iter()
            .filter(|e| e.event_type == "module:destroyed")
            .count();
        assert_eq!(destroyed_count, 1);
        assert_eq!(module.get_status().status, ModuleStatus::Destroyed);
    }

    #[tokio::test]
    async fn destroy_from_uninitialized_has_no_unsubs_but_still_emits() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);

        module.destroy();

        assert_eq!(module.get_status().status, ModuleStatus::Destroyed);
        assert!(broker
            .event_log(None)
            .iter()
            .any(|e| e.event_type == "module:destroyed"));
    }

    #[tokio::test]
    async fn reinit_after_ready_is_rejected() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        let err = module.init().await.unwrap_err();
        assert!(matches!(err, ModuleInitError::InvalidState(ModuleStatus::Ready)));
    }

    #[tokio::test]
    async fn destroy_cancels_an_in_flight_wait_for() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        let waiting = Arc::clone(&module);
        let handle = tokio::spawn(async move {
            waiting.wait_for("database:ready", Some(Duration::from_secs(5))).await
        });

        tokio::task::yield_now().await;
        module.destroy();

        let result = handle.await.unwrap();
        assert!(matches!(result, Err(WaitForError::Cancelled)));
    }

    #[tokio::test]
    async fn wait_for_that_resolves_on_its_own_leaves_no_stale_unsubs_entry() {
        let broker = broker();
        let module = Module::with_broker(broker.clone(), "M", "1.0.0", "", NoopHooks);
        module.init().await.unwrap();

        let waiting = Arc::clone(&module);
        let handle = tokio::spawn(async move { waiting.wait_for("x", None).await });

        tokio::task::yield_now().await;
        module.emit("x", serde_json::json!(null));
        handle.await.unwrap().unwrap();

        // Destroying afterward must not try to cancel an already-resolved
        // wait, and must still complete cleanly.
        module.destroy();
        assert_eq!(module.get_status().status, ModuleStatus::Destroyed);
    }
}
