//! Typed publish/subscribe on top of a single [`Signal`].
//!
//! An [`EventBus`] carries type-erased [`Event`]s. Subscribers declare the
//! event types they handle up front with a [`SubscriberBuilder`]; each
//! registered subscriber owns exactly one connection on the bus's internal
//! signal, and routing by event type happens inside that connection's slot.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchyard_core::{EventBus, Subscriber};
//!
//! #[derive(Debug)]
//! struct Saved {
//!     path: String,
//! }
//!
//! let bus = EventBus::new();
//! let logger = Subscriber::builder()
//!     .name("logger")
//!     .on::<Saved>(|event| println!("saved {}", event.path))
//!     .build();
//!
//! assert!(bus.register(&logger));
//! assert!(!bus.register(&logger));
//!
//! bus.post(Saved { path: "notes.txt".into() }).unwrap();
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::connection::{ConnectionId, ConnectionType};
use crate::dispatcher::{Dispatcher, same_dispatcher};
use crate::error::{Result, SlotError};
use crate::failure::{self, SlotFailure};
use crate::logging::targets;
use crate::signal::Signal;

/// A posted event: any `Send + Sync` value, shared between subscribers.
#[derive(Clone)]
pub struct Event {
    payload: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Event {
    /// Wrap a value as an event.
    pub fn new<E>(payload: E) -> Self
    where
        E: Any + Send + Sync,
    {
        Self {
            payload: Arc::new(payload),
            type_name: std::any::type_name::<E>(),
        }
    }

    /// Borrow the payload as `E` if that is its runtime type.
    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.payload.downcast_ref::<E>()
    }

    /// Whether the payload's runtime type is `E`.
    pub fn is<E: Any>(&self) -> bool {
        self.payload.is::<E>()
    }

    /// The payload's runtime type.
    pub fn type_id(&self) -> TypeId {
        (*self.payload).type_id()
    }

    /// The payload's type name, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event").field("type", &self.type_name).finish_non_exhaustive()
    }
}

/// Identity of a [`Subscriber`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

static NEXT_SUBSCRIBER_ID: AtomicU64 = AtomicU64::new(1);

type Handler = Box<dyn Fn(&Event) -> std::result::Result<(), SlotError> + Send + Sync>;

struct HandlerEntry {
    /// `None` accepts every event.
    accepts: Option<TypeId>,
    event_type: &'static str,
    handler: Handler,
}

/// A set of event handlers registered with an [`EventBus`] as one unit.
///
/// Built with [`Subscriber::builder`]. Handlers run in the order they were
/// added; every handler whose type matches the posted event runs.
pub struct Subscriber {
    id: SubscriberId,
    name: String,
    handlers: Vec<HandlerEntry>,
}

impl Subscriber {
    /// Start building a subscriber.
    pub fn builder() -> SubscriberBuilder {
        SubscriberBuilder::default()
    }

    /// Identity used by the bus to deduplicate registrations.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The subscriber's name, or `subscriber-<id>` if none was given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether any handler accepts events of type `E`.
    pub fn handles<E: Any>(&self) -> bool {
        let wanted = TypeId::of::<E>();
        self.handlers
            .iter()
            .any(|entry| entry.accepts.is_none_or(|accepts| accepts == wanted))
    }

    /// Run every matching handler, each one isolated from the others.
    fn deliver(&self, event: &Event, exceptions: &Signal<SlotFailure>) {
        let posted = event.type_id();
        for entry in &self.handlers {
            if entry.accepts.is_some_and(|accepts| accepts != posted) {
                continue;
            }
            if let Err(error) = failure::guarded(|| (entry.handler)(event)) {
                tracing::debug!(
                    target: targets::EVENT_BUS,
                    subscriber = %self.name,
                    handler = entry.event_type,
                    error = %error,
                    "event handler failed"
                );
                failure::report(Some(exceptions), SlotFailure::new(None, error));
            }
        }
    }
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let handled: Vec<_> = self.handlers.iter().map(|entry| entry.event_type).collect();
        f.debug_struct("Subscriber")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handles", &handled)
            .finish()
    }
}

/// Builder for [`Subscriber`].
#[derive(Default)]
pub struct SubscriberBuilder {
    name: Option<String>,
    handlers: Vec<HandlerEntry>,
}

impl SubscriberBuilder {
    /// Name used in log output.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Handle events whose runtime type is exactly `E`.
    pub fn on<E: Any>(self, handler: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.try_on::<E>(move |event| {
            handler(event);
            Ok(())
        })
    }

    /// Handle events of type `E` with a handler that may fail.
    pub fn try_on<E: Any>(
        mut self,
        handler: impl Fn(&E) -> std::result::Result<(), SlotError> + Send + Sync + 'static,
    ) -> Self {
        self.handlers.push(HandlerEntry {
            accepts: Some(TypeId::of::<E>()),
            event_type: std::any::type_name::<E>(),
            handler: Box::new(move |event: &Event| match event.downcast_ref::<E>() {
                Some(payload) => handler(payload),
                None => Ok(()),
            }),
        });
        self
    }

    /// Handle every event posted on the bus.
    pub fn on_any<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handlers.push(HandlerEntry {
            accepts: None,
            event_type: "*",
            handler: Box::new(move |event: &Event| {
                handler(event);
                Ok(())
            }),
        });
        self
    }

    /// Finish the subscriber. Each call yields a distinct identity.
    pub fn build(self) -> Arc<Subscriber> {
        let id = SubscriberId(NEXT_SUBSCRIBER_ID.fetch_add(1, Ordering::Relaxed));
        Arc::new(Subscriber {
            id,
            name: self.name.unwrap_or_else(|| format!("subscriber-{}", id.0)),
            handlers: self.handlers,
        })
    }
}

struct Registration {
    connection: ConnectionId,
    dispatcher: Option<Arc<dyn Dispatcher>>,
}

/// Typed event bus built on one [`Signal<Event>`].
///
/// Delivery to a subscriber follows the connection rules of
/// [`Signal::emit`]: a subscriber registered on a dispatcher receives events
/// on that dispatcher's thread.
pub struct EventBus {
    signal: Signal<Event>,
    exceptions: Arc<Signal<SlotFailure>>,
    subscribers: Mutex<HashMap<SubscriberId, Registration>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        Self {
            signal: Signal::new(),
            exceptions: Arc::new(Signal::new()),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber whose handlers run in the posting thread.
    ///
    /// Returns `false` if it was already registered.
    pub fn register(&self, subscriber: &Arc<Subscriber>) -> bool {
        self.attach(subscriber, None, ConnectionType::Auto)
    }

    /// Register a subscriber whose handlers run on `dispatcher`.
    ///
    /// Returns `false` if it was already registered; the existing
    /// registration is left untouched.
    pub fn register_on(
        &self,
        subscriber: &Arc<Subscriber>,
        dispatcher: Arc<dyn Dispatcher>,
        connection_type: ConnectionType,
    ) -> bool {
        self.attach(subscriber, Some(dispatcher), connection_type)
    }

    fn attach(
        &self,
        subscriber: &Arc<Subscriber>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        connection_type: ConnectionType,
    ) -> bool {
        let mut subscribers = self.subscribers.lock();
        if subscribers.contains_key(&subscriber.id()) {
            tracing::trace!(
                target: targets::EVENT_BUS,
                subscriber = %subscriber.name(),
                "subscriber already registered"
            );
            return false;
        }

        let target = Arc::clone(subscriber);
        let exceptions = Arc::clone(&self.exceptions);
        let slot = move |event: &Event| target.deliver(event, &exceptions);
        let connection = match &dispatcher {
            Some(dispatcher) => {
                self.signal
                    .connect_to(slot, Arc::clone(dispatcher), connection_type)
            }
            None => self.signal.connect_with_type(slot, connection_type),
        };

        subscribers.insert(
            subscriber.id(),
            Registration {
                connection,
                dispatcher,
            },
        );
        tracing::debug!(
            target: targets::EVENT_BUS,
            subscriber = %subscriber.name(),
            ?connection_type,
            "subscriber registered"
        );
        true
    }

    /// Remove a subscriber. Returns `false` if it was not registered.
    pub fn unregister(&self, subscriber: &Subscriber) -> bool {
        let removed = self.subscribers.lock().remove(&subscriber.id());
        match removed {
            Some(registration) => self.signal.disconnect(registration.connection),
            None => false,
        }
    }

    /// Remove every subscriber registered on `dispatcher`.
    pub fn unregister_dispatcher<D>(&self, dispatcher: &Arc<D>) -> bool
    where
        D: Dispatcher + ?Sized,
    {
        let removed: Vec<ConnectionId> = {
            let mut subscribers = self.subscribers.lock();
            let matching: Vec<SubscriberId> = subscribers
                .iter()
                .filter(|(_, registration)| {
                    registration
                        .dispatcher
                        .as_ref()
                        .is_some_and(|bound| same_dispatcher(bound, dispatcher))
                })
                .map(|(id, _)| *id)
                .collect();
            matching
                .into_iter()
                .filter_map(|id| subscribers.remove(&id))
                .map(|registration| registration.connection)
                .collect()
        };

        for connection in &removed {
            self.signal.disconnect(*connection);
        }
        !removed.is_empty()
    }

    /// Remove every subscriber.
    ///
    /// Only the connections of the drained registrations are cut, and the
    /// registry stays locked until they are, so a concurrent `register` is
    /// either removed along with the rest or left fully intact.
    pub fn unregister_all(&self) -> bool {
        let mut subscribers = self.subscribers.lock();
        let had_subscribers = !subscribers.is_empty();
        for (_, registration) in subscribers.drain() {
            self.signal.disconnect(registration.connection);
        }
        had_subscribers
    }

    /// Post an event to every registered subscriber.
    ///
    /// Handler failures go to [`on_exception`](Self::on_exception); an `Err`
    /// means a subscriber's dispatcher refused the delivery.
    pub fn post<E>(&self, event: E) -> Result<()>
    where
        E: Any + Send + Sync,
    {
        self.post_event(Event::new(event))
    }

    /// Post an already wrapped event.
    pub fn post_event(&self, event: Event) -> Result<()> {
        tracing::trace!(target: targets::EVENT_BUS, event = event.type_name(), "posting event");
        self.signal.emit(event).map(|_| ())
    }

    /// Signal emitted once per failed handler invocation.
    pub fn on_exception(&self) -> &Signal<SlotFailure> {
        &self.exceptions
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Whether `subscriber` is currently registered on this bus.
    pub fn is_registered(&self, subscriber: &Subscriber) -> bool {
        self.subscribers.lock().contains_key(&subscriber.id())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

static_assertions::assert_impl_all!(EventBus: Send, Sync);
static_assertions::assert_impl_all!(Event: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::LoopDispatcher;

    struct Ping(u32);
    struct Pong;

    fn recorder() -> (Arc<Mutex<Vec<String>>>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = log.clone();
        (log, handle)
    }

    #[test]
    fn test_event_downcast() {
        let event = Event::new(Ping(3));

        assert!(event.is::<Ping>());
        assert!(!event.is::<Pong>());
        assert_eq!(event.type_id(), TypeId::of::<Ping>());
        assert_eq!(event.downcast_ref::<Ping>().map(|ping| ping.0), Some(3));
        assert!(event.type_name().ends_with("Ping"));
    }

    #[test]
    fn test_handlers_match_exact_type() {
        let bus = EventBus::new();
        let (log, log_clone) = recorder();
        let any_log = log.clone();

        let subscriber = Subscriber::builder()
            .on::<Ping>(move |ping| log_clone.lock().push(format!("ping {}", ping.0)))
            .on_any(move |event| any_log.lock().push(format!("any {}", event.is::<Pong>())))
            .build();
        bus.register(&subscriber);

        bus.post(Ping(1)).unwrap();
        bus.post(Pong).unwrap();

        assert_eq!(
            *log.lock(),
            vec!["ping 1", "any false", "any true"]
        );
        assert!(subscriber.handles::<Ping>());
        assert!(subscriber.handles::<String>());
    }

    #[test]
    fn test_register_is_idempotent() {
        let bus = EventBus::new();
        let (log, log_clone) = recorder();

        let subscriber = Subscriber::builder()
            .on::<Ping>(move |_| log_clone.lock().push("ping".into()))
            .build();

        assert!(bus.register(&subscriber));
        assert!(!bus.register(&subscriber));
        assert_eq!(bus.subscriber_count(), 1);

        bus.post(Ping(0)).unwrap();
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_unregister() {
        let bus = EventBus::new();
        let subscriber = Subscriber::builder().on::<Ping>(|_| {}).build();

        bus.register(&subscriber);
        assert!(bus.is_registered(&subscriber));
        assert!(bus.unregister(&subscriber));
        assert!(!bus.unregister(&subscriber));
        assert!(!bus.is_registered(&subscriber));

        assert!(bus.register(&subscriber));
        assert!(bus.unregister_all());
        assert!(!bus.unregister_all());
    }

    #[test]
    fn test_unregister_all_cuts_only_registered_connections() {
        let bus = EventBus::new();
        let (log, log_clone) = recorder();

        // A connection the registry does not know about.
        bus.signal.connect(move |_| log_clone.lock().push("raw".into()));

        let subscriber = Subscriber::builder().on::<Ping>(|_| {}).build();
        bus.register(&subscriber);
        assert_eq!(bus.signal.connection_count(), 2);

        assert!(bus.unregister_all());
        assert_eq!(bus.signal.connection_count(), 1);

        bus.post(Ping(2)).unwrap();
        assert_eq!(*log.lock(), vec!["raw"]);

        assert!(bus.register(&subscriber));
        assert!(bus.is_registered(&subscriber));
        assert_eq!(bus.signal.connection_count(), 2);
    }

    #[test]
    fn test_unregister_all_races_with_register() {
        let bus = Arc::new(EventBus::new());
        let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        for _ in 0..200 {
            let counter = delivered.clone();
            let subscriber = Subscriber::builder()
                .on::<Ping>(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build();

            let clearing = bus.clone();
            let clearer = std::thread::spawn(move || clearing.unregister_all());
            bus.register(&subscriber);
            clearer.join().unwrap();

            // Registered means connected: the registry and the signal agree.
            assert_eq!(bus.signal.connection_count(), bus.subscriber_count());
            delivered.store(0, Ordering::SeqCst);
            bus.post(Ping(0)).unwrap();
            assert_eq!(
                delivered.load(Ordering::SeqCst),
                usize::from(bus.is_registered(&subscriber))
            );
            bus.unregister_all();
        }
    }

    #[test]
    fn test_unregister_dispatcher() {
        let bus = EventBus::new();
        let ui = Arc::new(LoopDispatcher::new());

        let on_ui = Subscriber::builder().name("ui").on::<Ping>(|_| {}).build();
        let inline = Subscriber::builder().name("inline").on::<Ping>(|_| {}).build();

        bus.register_on(&on_ui, ui.clone(), ConnectionType::Queued);
        bus.register(&inline);

        assert!(bus.unregister_dispatcher(&ui));
        assert!(!bus.is_registered(&on_ui));
        assert!(bus.is_registered(&inline));
    }

    #[test]
    fn test_dispatcher_subscriber_runs_on_pump() {
        let bus = EventBus::new();
        let ui = Arc::new(LoopDispatcher::new());
        let (log, log_clone) = recorder();

        let subscriber = Subscriber::builder()
            .on::<Ping>(move |ping| log_clone.lock().push(format!("ping {}", ping.0)))
            .build();
        bus.register_on(&subscriber, ui.clone(), ConnectionType::Queued);

        bus.post(Ping(7)).unwrap();
        assert!(log.lock().is_empty());

        ui.pump();
        assert_eq!(*log.lock(), vec!["ping 7"]);
    }

    #[test]
    fn test_failing_handler_does_not_stop_others() {
        let bus = EventBus::new();
        let (log, log_clone) = recorder();
        let failures = Arc::new(Mutex::new(Vec::new()));

        let failures_clone = failures.clone();
        bus.on_exception().connect(move |failure: &SlotFailure| {
            failures_clone.lock().push(failure.error().to_string());
        });

        let failing = Subscriber::builder()
            .try_on::<Ping>(|_| Err(SlotError::msg("handler refused")))
            .build();
        let second_log = log_clone.clone();
        let healthy = Subscriber::builder()
            .on::<Ping>(move |_| log_clone.lock().push("first".into()))
            .on::<Ping>(move |_| second_log.lock().push("second".into()))
            .build();

        bus.register(&failing);
        bus.register(&healthy);
        bus.post(Ping(1)).unwrap();

        assert_eq!(*log.lock(), vec!["first", "second"]);
        assert_eq!(*failures.lock(), vec!["handler refused"]);
    }
}
