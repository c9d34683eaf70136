//! Connections between a signal and a slot.
//!
//! A connection is the live binding of one slot to one signal, together with
//! the dispatcher that should run it and the [`ConnectionType`] that decides
//! how. Connections are created by the `connect*` methods of
//! [`Signal`](crate::Signal) and identified by [`ConnectionId`]; they are
//! compared by identity only.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use slotmap::new_key_type;

use crate::completion::CompletionHandle;
use crate::dispatcher::Dispatcher;
use crate::error::{Result, SlotError};
use crate::failure::{self, SlotFailure};
use crate::logging::targets;

new_key_type! {
    /// A unique identifier for a signal-slot connection.
    ///
    /// Use this ID to disconnect a specific connection via
    /// [`Signal::disconnect`](crate::Signal::disconnect). The ID remains valid
    /// until the connection is disconnected or the signal is dropped.
    pub struct ConnectionId;
}

/// Specifies how a connected slot should be invoked when the signal is emitted.
///
/// # Related
///
/// - [`Signal::connect`](crate::Signal::connect) - Uses [`ConnectionType::Auto`]
/// - [`Signal::connect_to`](crate::Signal::connect_to) - Binds a dispatcher and type
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Invoke the slot immediately in the emitting thread.
    Direct,

    /// Queue the slot invocation onto the connection's dispatcher.
    ///
    /// On a signal that keeps return values this is escalated to
    /// [`BlockingQueued`](Self::BlockingQueued): a value-returning call cannot
    /// be fire-and-forget.
    Queued,

    /// Direct when emitted on the dispatcher's own thread, Queued otherwise.
    ///
    /// Connections without a dispatcher always resolve to Direct. This is the
    /// default and recommended option for most use cases.
    #[default]
    Auto,

    /// Like Queued, but the emitting thread waits until the slot has run.
    ///
    /// Emitting from the dispatcher's own thread would wait on itself; in
    /// that case the slot is run directly and a warning is logged.
    BlockingQueued,
}

/// The callable stored in a connection.
pub(crate) type SlotFn<Args, R> = dyn Fn(&Args) -> std::result::Result<R, SlotError> + Send + Sync;

/// How one emission reaches a connection's slot.
pub(crate) enum Delivery<'a> {
    Direct,
    Queued(&'a Arc<dyn Dispatcher>),
    Blocking(&'a Arc<dyn Dispatcher>),
}

/// Storage for a single connection.
pub(crate) struct Connection<Args, R> {
    id: ConnectionId,
    /// Identity of the owning signal (non-owning back reference).
    signal_id: u64,
    slot: Box<SlotFn<Args, R>>,
    dispatcher: Option<Arc<dyn Dispatcher>>,
    connection_type: ConnectionType,
    discard_return_value: bool,
    connected: AtomicBool,
}

impl<Args, R> Connection<Args, R>
where
    Args: Send + 'static,
    R: Send + 'static,
{
    pub(crate) fn new(
        id: ConnectionId,
        signal_id: u64,
        slot: Box<SlotFn<Args, R>>,
        dispatcher: Option<Arc<dyn Dispatcher>>,
        connection_type: ConnectionType,
        discard_return_value: bool,
    ) -> Self {
        Self {
            id,
            signal_id,
            slot,
            dispatcher,
            connection_type,
            discard_return_value,
            connected: AtomicBool::new(true),
        }
    }

    pub(crate) fn id(&self) -> ConnectionId {
        self.id
    }

    pub(crate) fn signal_id(&self) -> u64 {
        self.signal_id
    }

    pub(crate) fn dispatcher(&self) -> Option<&Arc<dyn Dispatcher>> {
        self.dispatcher.as_ref()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Resolve the effective delivery for an emission from the current thread.
    pub(crate) fn resolve(&self) -> Delivery<'_> {
        let requested = match self.connection_type {
            ConnectionType::Auto => match &self.dispatcher {
                Some(dispatcher) if !dispatcher.is_current_dispatch_thread() => {
                    ConnectionType::Queued
                }
                _ => ConnectionType::Direct,
            },
            other => other,
        };

        let effective = match requested {
            ConnectionType::Queued if !self.discard_return_value => ConnectionType::BlockingQueued,
            other => other,
        };

        match (effective, &self.dispatcher) {
            (ConnectionType::Direct | ConnectionType::Auto, _) => Delivery::Direct,
            (ConnectionType::Queued | ConnectionType::BlockingQueued, None) => {
                tracing::warn!(
                    target: targets::SIGNAL,
                    connection = ?self.id,
                    "queued connection has no dispatcher, invoking directly"
                );
                Delivery::Direct
            }
            (ConnectionType::Queued, Some(dispatcher)) => Delivery::Queued(dispatcher),
            (ConnectionType::BlockingQueued, Some(dispatcher)) => {
                if dispatcher.is_current_dispatch_thread() {
                    tracing::warn!(
                        target: targets::SIGNAL,
                        connection = ?self.id,
                        "blocking queued emit on the dispatch thread, invoking directly"
                    );
                    Delivery::Direct
                } else {
                    Delivery::Blocking(dispatcher)
                }
            }
        }
    }

    /// Invoke the slot, capturing its value unless the signal discards it.
    ///
    /// Errors and panics raised by the slot are returned, never unwound.
    pub(crate) fn actuate(&self, args: &Args) -> std::result::Result<Option<R>, SlotError> {
        let value = failure::guarded(|| (self.slot)(args))?;
        Ok(if self.discard_return_value {
            None
        } else {
            Some(value)
        })
    }

    /// Invoke in the caller's thread, routing a failure to the dispatcher.
    pub(crate) fn invoke_direct(&self, args: &Args) -> Option<R> {
        match self.actuate(args) {
            Ok(value) => value,
            Err(error) => {
                let exceptions = self.dispatcher.as_deref().map(|d| d.on_exception());
                failure::report(exceptions, SlotFailure::new(Some(self.id), error));
                None
            }
        }
    }

    /// Body of a queued call, run by the dispatcher pump.
    fn run_queued(
        &self,
        args: &Args,
        completion: Option<CompletionHandle<R>>,
    ) -> std::result::Result<(), SlotFailure> {
        if !self.is_connected() {
            tracing::trace!(
                target: targets::DISPATCHER,
                connection = ?self.id,
                "connection removed while queued, skipping"
            );
            return Ok(());
        }

        match self.actuate(args) {
            Ok(value) => {
                if let Some(completion) = completion {
                    completion.complete(value);
                }
                Ok(())
            }
            Err(error) => Err(SlotFailure::new(Some(self.id), error)),
        }
    }

    /// Push a call onto `dispatcher` and schedule its pump.
    ///
    /// The connection and its arguments travel together as one queue entry,
    /// and the pump task runs that entry and no other. If the dispatcher
    /// refuses the pump, the entry is taken back out.
    pub(crate) fn enqueue(
        connection: &Arc<Self>,
        dispatcher: &Arc<dyn Dispatcher>,
        args: Args,
        completion: Option<CompletionHandle<R>>,
    ) -> Result<()> {
        let target = Arc::clone(connection);
        let call_id = dispatcher
            .queue()
            .push(Box::new(move || target.run_queued(&args, completion)));

        let pump = Arc::clone(dispatcher);
        if let Err(err) = dispatcher.invoke_later(Box::new(move || {
            pump.queue().dispatch_call(call_id);
        })) {
            if dispatcher.queue().retract(call_id) {
                return Err(err);
            }
            // Already taken by a manual `dispatch` or dropped at shutdown;
            // either way it is no longer ours to refuse.
            tracing::debug!(
                target: targets::DISPATCHER,
                connection = ?connection.id,
                error = %err,
                "pump refused after the call left the queue"
            );
        }
        Ok(())
    }
}
