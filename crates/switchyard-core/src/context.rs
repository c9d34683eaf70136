//! Explicit service context.
//!
//! A [`Context`] is a registry of shared services looked up by the interface
//! they provide, plus the dispatchers an application runs on. Components take
//! the context (or just what they need from it) at construction time.
//!
//! One context may be installed as the process-wide default during startup.
//! Installation happens once; later lookups through [`Context::global`] see
//! an immutable registry.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchyard_core::{Context, DispatcherRole, EventBus};
//!
//! trait Clock: Send + Sync {
//!     fn now(&self) -> u64;
//! }
//!
//! struct FixedClock;
//! impl Clock for FixedClock {
//!     fn now(&self) -> u64 {
//!         7
//!     }
//! }
//!
//! let context = Context::builder()
//!     .provide::<dyn Clock>(Arc::new(FixedClock))
//!     .provide(Arc::new(EventBus::new()))
//!     .with_default_dispatcher()
//!     .unwrap()
//!     .build();
//!
//! assert_eq!(context.require::<dyn Clock>().unwrap().now(), 7);
//! assert!(context.get::<EventBus>().is_some());
//! assert!(context.dispatcher(DispatcherRole::Background).is_some());
//! assert!(context.dispatcher(DispatcherRole::Main).is_none());
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use crate::dispatcher::{Dispatcher, WorkerDispatcher};
use crate::error::{ContextError, DispatchError};
use crate::logging::targets;

static GLOBAL_CONTEXT: OnceLock<Context> = OnceLock::new();

/// Name of the worker thread started by
/// [`ContextBuilder::with_default_dispatcher`].
pub const DEFAULT_DISPATCHER_NAME: &str = "switchyard-background";

/// The job a dispatcher does for the application.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DispatcherRole {
    /// The thread that owns user-facing state, usually a UI loop.
    Main,
    /// Where background work and background event delivery happen.
    Background,
}

/// A registry of services and dispatchers.
#[derive(Default)]
pub struct Context {
    /// Each value is an `Arc<C>` for the key `TypeId::of::<C>()`.
    services: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    service_names: HashMap<TypeId, &'static str>,
    dispatchers: HashMap<DispatcherRole, Arc<dyn Dispatcher>>,
}

impl Context {
    /// Start building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Look up the service registered for capability `C`.
    ///
    /// `C` is usually a trait object type such as `dyn Clock`.
    pub fn get<C>(&self) -> Option<Arc<C>>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.services
            .get(&TypeId::of::<C>())
            .and_then(|service| (**service).downcast_ref::<Arc<C>>())
            .cloned()
    }

    /// Like [`get`](Self::get), but a missing service is an error.
    pub fn require<C>(&self) -> Result<Arc<C>, ContextError>
    where
        C: ?Sized + Send + Sync + 'static,
    {
        self.get::<C>()
            .ok_or(ContextError::MissingService(std::any::type_name::<C>()))
    }

    /// The dispatcher registered for `role`.
    pub fn dispatcher(&self, role: DispatcherRole) -> Option<Arc<dyn Dispatcher>> {
        self.dispatchers.get(&role).cloned()
    }

    /// Like [`dispatcher`](Self::dispatcher), but a missing role is an error.
    pub fn require_dispatcher(&self, role: DispatcherRole) -> Result<Arc<dyn Dispatcher>, ContextError> {
        self.dispatcher(role)
            .ok_or(ContextError::MissingDispatcher(role))
    }

    /// Install this context as the process-wide default.
    ///
    /// Fails with [`ContextError::AlreadyInstalled`] on every call after the
    /// first successful one.
    pub fn install(self) -> Result<&'static Context, ContextError> {
        GLOBAL_CONTEXT
            .set(self)
            .map_err(|_| ContextError::AlreadyInstalled)?;
        tracing::debug!(target: targets::CONTEXT, "global context installed");
        GLOBAL_CONTEXT.get().ok_or(ContextError::AlreadyInstalled)
    }

    /// The installed process-wide default, if any.
    pub fn global() -> Option<&'static Context> {
        GLOBAL_CONTEXT.get()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.service_names.values().copied().collect();
        services.sort_unstable();
        let mut roles: Vec<_> = self.dispatchers.keys().map(|role| format!("{role:?}")).collect();
        roles.sort_unstable();
        f.debug_struct("Context")
            .field("services", &services)
            .field("dispatchers", &roles)
            .finish()
    }
}

/// Builder for [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    context: Context,
}

impl ContextBuilder {
    /// Register `service` as the provider of capability `C`.
    ///
    /// A later registration for the same capability replaces the earlier one.
    pub fn provide<C>(mut self, service: Arc<C>) -> Self
    where
        C: ?Sized + Send + Sync + 'static,
    {
        let key = TypeId::of::<C>();
        self.context.services.insert(key, Box::new(service));
        self.context
            .service_names
            .insert(key, std::any::type_name::<C>());
        self
    }

    /// Register the dispatcher for `role`.
    pub fn dispatcher(mut self, role: DispatcherRole, dispatcher: Arc<dyn Dispatcher>) -> Self {
        self.context.dispatchers.insert(role, dispatcher);
        self
    }

    /// Start a [`WorkerDispatcher`] as the background dispatcher, unless one
    /// is already registered.
    ///
    /// The worker is also provided as a service, so it can be shut down
    /// through `context.get::<WorkerDispatcher>()`.
    pub fn with_default_dispatcher(self) -> Result<Self, DispatchError> {
        if self.context.dispatchers.contains_key(&DispatcherRole::Background) {
            return Ok(self);
        }
        let worker = Arc::new(
            WorkerDispatcher::builder()
                .name(DEFAULT_DISPATCHER_NAME)
                .build()?,
        );
        Ok(self
            .provide(worker.clone())
            .dispatcher(DispatcherRole::Background, worker))
    }

    /// Finish the context. It is not global until [`Context::install`].
    pub fn build(self) -> Context {
        self.context
    }
}

static_assertions::assert_impl_all!(Context: Send, Sync);
