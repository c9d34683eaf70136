//! Dispatchers: the threads and loops that run queued slots.
//!
//! A [`Dispatcher`] owns exactly one execution context (a dedicated thread or
//! a host event loop) and serially drains a FIFO of pending calls. Signals
//! push `(connection, args)` calls onto the dispatcher's [`DispatchQueue`] and
//! then schedule one pump cycle per call with [`Dispatcher::invoke_later`].
//! Each pump cycle runs exactly the call it was scheduled for, so calls run
//! in the order their pumps were accepted and never concurrently with each
//! other.
//!
//! # Implementations
//!
//! - [`WorkerDispatcher`] - a dedicated worker thread (the desktop default)
//! - [`LoopDispatcher`] - pumped by the host's own loop on its owning thread
//! - `TokioDispatcher` - a current-thread Tokio runtime (feature `tokio`)
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchyard_core::{ConnectionType, Signal, WorkerDispatcher};
//!
//! let worker = Arc::new(WorkerDispatcher::new().unwrap());
//! let answer = Signal::<(), i32>::returning();
//! answer.connect_to(|_| 42, worker.clone(), ConnectionType::Queued);
//!
//! // Queued on a value-returning signal blocks until the worker ran the slot.
//! assert_eq!(answer.emit(()).unwrap(), Some(42));
//! worker.shutdown_and_join();
//! ```

mod event_loop;
#[cfg(feature = "tokio")]
mod tokio_runtime;
mod worker;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::ThreadId;

use parking_lot::Mutex;

use crate::error::Result;
use crate::failure::{self, SlotFailure};
use crate::logging::targets;
use crate::signal::Signal;

pub use event_loop::LoopDispatcher;
#[cfg(feature = "tokio")]
pub use tokio_runtime::TokioDispatcher;
pub use worker::{WorkerDispatcher, WorkerDispatcherBuilder, WorkerDispatcherConfig};

/// A unit of work handed to [`Dispatcher::invoke_later`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A queued `(connection, args)` call, type-erased.
type PendingFn = Box<dyn FnOnce() -> std::result::Result<(), SlotFailure> + Send + 'static>;

/// An execution target for queued slot invocations.
///
/// Implementors supply the host primitives (thread identity and a way to run
/// a task on the owning thread) plus storage for a [`DispatchQueue`]; the
/// pump and failure handling are shared.
pub trait Dispatcher: Send + Sync + 'static {
    /// Whether `thread` is this dispatcher's execution thread.
    fn is_dispatch_thread(&self, thread: ThreadId) -> bool;

    /// Whether the calling thread is this dispatcher's execution thread.
    fn is_current_dispatch_thread(&self) -> bool {
        self.is_dispatch_thread(std::thread::current().id())
    }

    /// Schedule `task` to run on this dispatcher's thread.
    ///
    /// Never blocks. Tasks scheduled from one thread run in FIFO order.
    /// Returns [`DispatchError::ShutDown`](crate::DispatchError::ShutDown)
    /// once the dispatcher stopped accepting work.
    fn invoke_later(&self, task: Task) -> Result<()>;

    /// The pending-call queue and exception signal backing this dispatcher.
    fn queue(&self) -> &DispatchQueue;

    /// Run exactly one pending call. Returns `false` if none was pending.
    ///
    /// Must be called on the dispatch thread; `invoke_later` arranges that.
    fn dispatch(&self) -> bool {
        self.queue().dispatch_one()
    }

    /// Signal emitted with every slot failure raised on this dispatcher.
    ///
    /// If nothing is connected, failures follow the
    /// [unobserved policy](crate::failure::UnobservedFailurePolicy).
    fn on_exception(&self) -> &Signal<SlotFailure> {
        self.queue().on_exception()
    }
}

/// Whether two dispatcher handles point at the same dispatcher.
pub fn same_dispatcher<A, B>(a: &Arc<A>, b: &Arc<B>) -> bool
where
    A: Dispatcher + ?Sized,
    B: Dispatcher + ?Sized,
{
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

struct PendingCall {
    id: u64,
    run: PendingFn,
}

/// FIFO of pending calls shared by all dispatcher implementations.
pub struct DispatchQueue {
    pending: Mutex<VecDeque<PendingCall>>,
    next_id: AtomicU64,
    exceptions: Signal<SlotFailure>,
}

impl Default for DispatchQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            exceptions: Signal::new(),
        }
    }

    /// Number of calls waiting for a pump cycle.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// The exception signal for failures raised by queued calls.
    pub fn on_exception(&self) -> &Signal<SlotFailure> {
        &self.exceptions
    }

    pub(crate) fn push(&self, run: PendingFn) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending.lock().push_back(PendingCall { id, run });
        id
    }

    /// Remove a call that will never get a pump cycle.
    pub(crate) fn retract(&self, id: u64) -> bool {
        let mut pending = self.pending.lock();
        match pending.iter().position(|call| call.id == id) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Drop every pending call, releasing any blocked emitters.
    pub(crate) fn abandon_pending(&self) -> usize {
        let abandoned: Vec<PendingCall> = self.pending.lock().drain(..).collect();
        let count = abandoned.len();
        if count > 0 {
            tracing::warn!(
                target: targets::DISPATCHER,
                count,
                "dispatcher stopped with calls still queued, dropping them"
            );
        }
        count
    }

    /// Pop and run the oldest pending call.
    ///
    /// The queue lock is not held while the call runs, so slots may emit or
    /// enqueue further calls.
    pub fn dispatch_one(&self) -> bool {
        let call = self.pending.lock().pop_front();
        match call {
            Some(call) => {
                self.run(call);
                true
            }
            None => false,
        }
    }

    /// Run the call pushed as `id`, if it is still pending.
    ///
    /// This is the body of a pump cycle: a cycle only ever runs its own call,
    /// so a pump that was refused can take its call back without stranding
    /// anyone else's.
    pub(crate) fn dispatch_call(&self, id: u64) -> bool {
        let call = {
            let mut pending = self.pending.lock();
            // Pumps normally arrive in push order, so this is almost always the front.
            let index = pending.iter().position(|call| call.id == id);
            index.and_then(|index| pending.remove(index))
        };
        match call {
            Some(call) => {
                self.run(call);
                true
            }
            None => false,
        }
    }

    fn run(&self, call: PendingCall) {
        tracing::trace!(target: targets::DISPATCHER, call = call.id, "dispatching queued call");
        if let Err(failure) = (call.run)() {
            failure::report(Some(&self.exceptions), failure);
        }
    }
}

/// Run a task on the dispatch thread, containing panics.
pub(crate) fn run_task(task: Task, queue: &DispatchQueue) {
    let outcome = failure::guarded(|| {
        task();
        Ok(())
    });
    if let Err(error) = outcome {
        failure::report(Some(queue.on_exception()), SlotFailure::new(None, error));
    }
}
