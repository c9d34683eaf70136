//! Core of Switchyard: typed signals, thread-aware dispatch and an event bus.
//!
//! This crate provides:
//!
//! - **Signals**: typed multicast emitters with ordered connections and
//!   optional slot return values
//! - **Dispatchers**: execution targets that own a thread or a host loop and
//!   run queued slots one at a time, in order
//! - **Event Bus**: typed publish/subscribe built on a single signal
//! - **Context**: an explicit registry of services and dispatchers
//!
//! # Connection Types
//!
//! - **Direct**: the slot runs in the emitting thread
//! - **Queued**: the slot runs later on its dispatcher's thread
//! - **Auto**: Direct on the dispatcher's thread, Queued elsewhere (default)
//! - **BlockingQueued**: Queued, and the emitter waits for the slot
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchyard_core::{ConnectionType, Signal, WorkerDispatcher};
//!
//! let worker = Arc::new(WorkerDispatcher::new().unwrap());
//!
//! // Runs in the caller's thread.
//! let progress = Signal::<u32>::new();
//! progress.connect(|percent| println!("{percent}%"));
//! progress.emit(50).unwrap();
//!
//! // Runs on the worker; the caller waits for the answer.
//! let lookup = Signal::<String, usize>::returning();
//! lookup.connect_to(|key| key.len(), worker.clone(), ConnectionType::Queued);
//! assert_eq!(lookup.emit("switchyard".into()).unwrap(), Some(10));
//!
//! worker.shutdown_and_join();
//! ```
//!
//! # Failures
//!
//! Slots never unwind into the code that emitted them. Errors and panics are
//! reported on the `on_exception` signal of the dispatcher (or event bus)
//! involved. A failure nobody observes terminates the process, see
//! [`UnobservedFailurePolicy`].

mod completion;
mod connection;
pub mod context;
pub mod dispatcher;
mod error;
pub mod event_bus;
pub mod failure;
pub mod logging;
pub mod signal;
pub mod thread_check;

pub use connection::{ConnectionId, ConnectionType};
pub use context::{Context, ContextBuilder, DispatcherRole};
#[cfg(feature = "tokio")]
pub use dispatcher::TokioDispatcher;
pub use dispatcher::{
    DispatchQueue, Dispatcher, LoopDispatcher, Task, WorkerDispatcher, WorkerDispatcherBuilder,
    WorkerDispatcherConfig, same_dispatcher,
};
pub use error::{ContextError, DispatchError, Result, SlotError};
pub use event_bus::{Event, EventBus, Subscriber, SubscriberBuilder, SubscriberId};
pub use failure::{
    SlotFailure, UnobservedFailurePolicy, set_unobserved_failure_policy,
    unobserved_failure_policy,
};
pub use signal::{ConnectionGuard, Signal};
