//! Typed multicast signals.
//!
//! A [`Signal`] holds an insertion-ordered set of connections. Emitting visits
//! every live connection in that order and delivers the arguments according to
//! the connection's [`ConnectionType`] and dispatcher.
//!
//! # Key Types
//!
//! - [`Signal<Args, R>`] - the emitter; `R` is the slot return type
//! - [`ConnectionId`] - returned by every `connect*` method
//! - [`ConnectionType`] - how a slot is invoked (Direct, Queued, Auto, BlockingQueued)
//! - [`ConnectionGuard`] - disconnects when dropped
//!
//! # Return Values
//!
//! A signal built with [`Signal::new`] discards slot return values and
//! [`emit`](Signal::emit) yields `Ok(None)`. A signal built with
//! [`Signal::returning`] keeps them: `emit` yields the value of the last slot
//! that ran in the caller's thread or blocked the caller, and plain `Queued`
//! connections are escalated to `BlockingQueued`.
//!
//! # Thread Safety
//!
//! Connect and disconnect may race with `emit` from any thread. An emission
//! works on a snapshot of the connection set; a connection removed while the
//! emission is in progress is skipped as soon as the removal is visible,
//! including calls already sitting in a dispatcher queue.
//!
//! # Example
//!
//! ```
//! use switchyard_core::Signal;
//!
//! let text_changed = Signal::<String>::new();
//! let id = text_changed.connect(|text| println!("text changed to {text}"));
//!
//! text_changed.emit("Hello, World!".to_string()).unwrap();
//! assert!(text_changed.disconnect(id));
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use slotmap::SlotMap;

use crate::completion::completion_pair;
use crate::connection::{Connection, Delivery, SlotFn};
use crate::dispatcher::{Dispatcher, same_dispatcher};
use crate::error::{Result, SlotError};
use crate::logging::targets;

pub use crate::connection::{ConnectionId, ConnectionType};

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

struct ConnectionSet<Args, R> {
    entries: SlotMap<ConnectionId, Arc<Connection<Args, R>>>,
    /// Insertion order; slotmap iteration order is not stable across reuse.
    order: Vec<ConnectionId>,
}

impl<Args, R> ConnectionSet<Args, R> {
    fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            order: Vec::new(),
        }
    }

    fn remove(&mut self, id: ConnectionId) -> Option<Arc<Connection<Args, R>>> {
        let connection = self.entries.remove(id)?;
        self.order.retain(|entry| *entry != id);
        Some(connection)
    }
}

/// A type-safe signal that can have multiple connected slots.
///
/// # Type Parameters
///
/// - `Args`: the argument passed to slots by reference. Use `()` for no
///   arguments or a tuple for several. Queued delivery clones it once per
///   queued connection.
/// - `R`: the slot return type, `()` by default.
///
/// `Signal` is `Send + Sync` and is usually shared through an `Arc`.
pub struct Signal<Args, R = ()> {
    id: u64,
    connections: Mutex<ConnectionSet<Args, R>>,
    discard_return_value: bool,
    blocked: AtomicBool,
}

impl<Args, R> Default for Signal<Args, R>
where
    Args: Clone + Send + 'static,
    R: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<Args, R> Signal<Args, R>
where
    Args: Clone + Send + 'static,
    R: Send + 'static,
{
    /// Create a signal that discards slot return values.
    pub fn new() -> Self {
        Self::with_discard(true)
    }

    /// Create a signal that hands slot return values back to the emitter.
    ///
    /// # Example
    ///
    /// ```
    /// use switchyard_core::Signal;
    ///
    /// let query = Signal::<i32, i32>::returning();
    /// query.connect(|n| n + 1);
    /// query.connect(|n| n * 10);
    ///
    /// // The last slot in connection order wins.
    /// assert_eq!(query.emit(4).unwrap(), Some(40));
    /// ```
    pub fn returning() -> Self {
        Self::with_discard(false)
    }

    fn with_discard(discard_return_value: bool) -> Self {
        Self {
            id: NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed),
            connections: Mutex::new(ConnectionSet::new()),
            discard_return_value,
            blocked: AtomicBool::new(false),
        }
    }

    /// Whether this signal drops slot return values.
    pub fn discards_return_value(&self) -> bool {
        self.discard_return_value
    }

    /// Connect a slot that runs in the emitting thread.
    ///
    /// Without a dispatcher, [`ConnectionType::Auto`] always resolves to
    /// direct invocation.
    ///
    /// # Example
    ///
    /// ```
    /// use switchyard_core::Signal;
    ///
    /// let signal = Signal::<String>::new();
    /// let id = signal.connect(|s| println!("Got: {s}"));
    /// signal.emit("Hello".to_string()).unwrap();
    /// ```
    pub fn connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
    {
        self.connect_with_type(slot, ConnectionType::Auto)
    }

    /// Connect a slot with an explicit connection type and no dispatcher.
    ///
    /// Queued types have nowhere to queue to and fall back to direct
    /// invocation with a warning.
    pub fn connect_with_type<F>(&self, slot: F, connection_type: ConnectionType) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
    {
        self.insert(Box::new(move |args: &Args| Ok(slot(args))), None, connection_type)
    }

    /// Connect a slot that runs on `dispatcher` according to `connection_type`.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use switchyard_core::{ConnectionType, Signal, WorkerDispatcher};
    ///
    /// let worker = Arc::new(WorkerDispatcher::new().unwrap());
    /// let signal = Signal::<i32>::new();
    /// signal.connect_to(|n| println!("{n} on the worker"), worker.clone(), ConnectionType::Auto);
    ///
    /// signal.emit(1).unwrap();
    /// worker.shutdown_and_join();
    /// ```
    pub fn connect_to<F>(
        &self,
        slot: F,
        dispatcher: Arc<dyn Dispatcher>,
        connection_type: ConnectionType,
    ) -> ConnectionId
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
    {
        self.insert(
            Box::new(move |args: &Args| Ok(slot(args))),
            Some(dispatcher),
            connection_type,
        )
    }

    /// Connect a fallible slot that runs in the emitting thread.
    ///
    /// An `Err` is reported like a panic: to the connection dispatcher's
    /// exception signal, or to the unobserved-failure policy.
    pub fn try_connect<F>(&self, slot: F) -> ConnectionId
    where
        F: Fn(&Args) -> std::result::Result<R, SlotError> + Send + Sync + 'static,
    {
        self.insert(Box::new(slot), None, ConnectionType::Auto)
    }

    /// Connect a fallible slot bound to `dispatcher`.
    pub fn try_connect_to<F>(
        &self,
        slot: F,
        dispatcher: Arc<dyn Dispatcher>,
        connection_type: ConnectionType,
    ) -> ConnectionId
    where
        F: Fn(&Args) -> std::result::Result<R, SlotError> + Send + Sync + 'static,
    {
        self.insert(Box::new(slot), Some(dispatcher), connection_type)
    }

    fn insert(
        &self,
        slot: Box<SlotFn<Args, R>>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        connection_type: ConnectionType,
    ) -> ConnectionId {
        let mut connections = self.connections.lock();
        let id = connections.entries.insert_with_key(|id| {
            Arc::new(Connection::new(
                id,
                self.id,
                slot,
                dispatcher,
                connection_type,
                self.discard_return_value,
            ))
        });
        connections.order.push(id);
        tracing::trace!(
            target: targets::SIGNAL,
            signal = self.id,
            connection = ?id,
            ?connection_type,
            "slot connected"
        );
        id
    }

    /// Disconnect a specific slot by its connection ID.
    ///
    /// Returns `true` if the connection was found and removed. Calls already
    /// queued for it are skipped when their turn comes.
    pub fn disconnect(&self, id: ConnectionId) -> bool {
        let removed = self.connections.lock().remove(id);
        match removed {
            Some(connection) => {
                debug_assert_eq!(connection.signal_id(), self.id);
                connection.mark_disconnected();
                true
            }
            None => false,
        }
    }

    /// Disconnect every slot. Returns `true` if anything was connected.
    pub fn disconnect_all(&self) -> bool {
        let removed: Vec<_> = {
            let mut connections = self.connections.lock();
            connections.order.clear();
            connections.entries.drain().map(|(_, connection)| connection).collect()
        };
        for connection in &removed {
            connection.mark_disconnected();
        }
        !removed.is_empty()
    }

    /// Disconnect every slot bound to `dispatcher`.
    pub fn disconnect_dispatcher<D>(&self, dispatcher: &Arc<D>) -> bool
    where
        D: Dispatcher + ?Sized,
    {
        let removed: Vec<_> = {
            let mut connections = self.connections.lock();
            let matching: Vec<ConnectionId> = connections
                .order
                .iter()
                .copied()
                .filter(|id| {
                    connections.entries.get(*id).is_some_and(|connection| {
                        connection
                            .dispatcher()
                            .is_some_and(|bound| same_dispatcher(bound, dispatcher))
                    })
                })
                .collect();
            matching
                .into_iter()
                .filter_map(|id| connections.remove(id))
                .collect()
        };
        for connection in &removed {
            connection.mark_disconnected();
        }
        !removed.is_empty()
    }

    /// Disconnect `id` only if it is bound to `dispatcher`.
    pub fn disconnect_on<D>(&self, id: ConnectionId, dispatcher: &Arc<D>) -> bool
    where
        D: Dispatcher + ?Sized,
    {
        let removed = {
            let mut connections = self.connections.lock();
            let bound_here = connections.entries.get(id).is_some_and(|connection| {
                connection
                    .dispatcher()
                    .is_some_and(|bound| same_dispatcher(bound, dispatcher))
            });
            if bound_here { connections.remove(id) } else { None }
        };
        match removed {
            Some(connection) => {
                connection.mark_disconnected();
                true
            }
            None => false,
        }
    }

    /// Get the number of connected slots.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().entries.len()
    }

    /// Check if nothing is connected.
    pub fn is_empty(&self) -> bool {
        self.connections.lock().entries.is_empty()
    }

    /// Block signal emission temporarily.
    ///
    /// While blocked, `emit` does nothing and returns `Ok(None)`.
    pub fn set_blocked(&self, blocked: bool) {
        self.blocked.store(blocked, Ordering::SeqCst);
    }

    /// Check if signal emission is currently blocked.
    pub fn is_blocked(&self) -> bool {
        self.blocked.load(Ordering::SeqCst)
    }

    fn snapshot(&self) -> Vec<Arc<Connection<Args, R>>> {
        let connections = self.connections.lock();
        connections
            .order
            .iter()
            .filter_map(|id| connections.entries.get(*id).cloned())
            .collect()
    }

    /// Emit the signal, invoking all connected slots.
    ///
    /// Connections are visited in the order they were made:
    ///
    /// - `Direct`: called immediately in the current thread
    /// - `Auto`: direct on the dispatcher's thread (or with no dispatcher),
    ///   queued otherwise
    /// - `Queued`: pushed onto the dispatcher queue; blocking on signals that
    ///   keep return values
    /// - `BlockingQueued`: queued, then the caller waits until the slot ran
    ///
    /// Slot failures never propagate out of `emit`; they are reported on the
    /// dispatcher's exception signal. An `Err` means a dispatcher refused the
    /// call. The remaining connections are still visited and the first error
    /// is returned.
    #[tracing::instrument(
        skip_all,
        target = "switchyard_core::signal",
        level = "trace",
        fields(signal = self.id)
    )]
    pub fn emit(&self, args: Args) -> Result<Option<R>> {
        if self.is_blocked() {
            tracing::trace!(target: targets::SIGNAL, "signal blocked, skipping emit");
            return Ok(None);
        }

        let snapshot = self.snapshot();
        tracing::trace!(target: targets::SIGNAL, connection_count = snapshot.len(), "emitting signal");

        let mut last = None;
        let mut first_error = None;
        for connection in &snapshot {
            if !connection.is_connected() {
                continue;
            }

            let delivered = match connection.resolve() {
                Delivery::Direct => Ok(connection.invoke_direct(&args)),
                Delivery::Queued(dispatcher) => {
                    Connection::enqueue(connection, dispatcher, args.clone(), None).map(|()| None)
                }
                Delivery::Blocking(dispatcher) => {
                    let (handle, waiter) = completion_pair();
                    Connection::enqueue(connection, dispatcher, args.clone(), Some(handle))
                        .map(|()| waiter.wait())
                }
            };

            match delivered {
                Ok(Some(value)) => last = Some(value),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        target: targets::SIGNAL,
                        connection = ?connection.id(),
                        error = %err,
                        "dispatcher refused queued call"
                    );
                    first_error.get_or_insert(err);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(last),
        }
    }

    /// Emit with every dispatcher-bound slot queued, never blocking.
    ///
    /// Unlike [`emit`](Self::emit), which respects each connection's type,
    /// this defers all dispatcher-bound slots, even on their own thread, and
    /// drops their return values. Slots without a dispatcher still run
    /// directly. Useful for breaking re-entrancy.
    ///
    /// Returns the number of calls queued, or 0 if the signal is blocked.
    pub fn emit_queued(&self, args: Args) -> Result<usize> {
        if self.is_blocked() {
            return Ok(0);
        }

        let mut queued = 0;
        let mut first_error = None;
        for connection in &self.snapshot() {
            if !connection.is_connected() {
                continue;
            }
            match connection.dispatcher() {
                Some(dispatcher) => {
                    match Connection::enqueue(connection, dispatcher, args.clone(), None) {
                        Ok(()) => queued += 1,
                        Err(err) => {
                            first_error.get_or_insert(err);
                        }
                    }
                }
                None => {
                    connection.invoke_direct(&args);
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(queued),
        }
    }

    /// Connect a slot that is disconnected when the returned guard drops.
    ///
    /// The guard holds a weak reference, so it never keeps the signal alive.
    ///
    /// # Example
    ///
    /// ```
    /// use std::sync::Arc;
    /// use std::sync::atomic::{AtomicI32, Ordering};
    /// use switchyard_core::Signal;
    ///
    /// let signal = Arc::new(Signal::<i32>::new());
    /// let counter = Arc::new(AtomicI32::new(0));
    /// {
    ///     let counter = counter.clone();
    ///     let _guard = signal.connect_scoped(move |&n| {
    ///         counter.fetch_add(n, Ordering::SeqCst);
    ///     });
    ///     signal.emit(42).unwrap();
    /// }
    /// signal.emit(43).unwrap();
    /// assert_eq!(counter.load(Ordering::SeqCst), 42);
    /// ```
    pub fn connect_scoped<F>(self: &Arc<Self>, slot: F) -> ConnectionGuard<Args, R>
    where
        F: Fn(&Args) -> R + Send + Sync + 'static,
    {
        let id = self.connect(slot);
        ConnectionGuard {
            signal: Arc::downgrade(self),
            id,
        }
    }
}

impl<Args, R> std::fmt::Debug for Signal<Args, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("connections", &self.connections.lock().entries.len())
            .field("discard_return_value", &self.discard_return_value)
            .field("blocked", &self.blocked.load(Ordering::Relaxed))
            .finish()
    }
}

static_assertions::assert_impl_all!(Signal<i32>: Send, Sync);
static_assertions::assert_impl_all!(Signal<String, String>: Send, Sync);

/// A connection that disconnects when dropped.
///
/// Created by [`Signal::connect_scoped`].
pub struct ConnectionGuard<Args, R = ()>
where
    Args: Clone + Send + 'static,
    R: Send + 'static,
{
    signal: Weak<Signal<Args, R>>,
    id: ConnectionId,
}

impl<Args, R> ConnectionGuard<Args, R>
where
    Args: Clone + Send + 'static,
    R: Send + 'static,
{
    /// The guarded connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Keep the connection for the lifetime of the signal.
    pub fn detach(self) -> ConnectionId {
        let id = self.id;
        let mut this = std::mem::ManuallyDrop::new(self);
        // Release the weak reference without running Drop.
        this.signal = Weak::new();
        id
    }
}

impl<Args, R> Drop for ConnectionGuard<Args, R>
where
    Args: Clone + Send + 'static,
    R: Send + 'static,
{
    fn drop(&mut self) {
        if let Some(signal) = self.signal.upgrade() {
            signal.disconnect(self.id);
        }
    }
}
