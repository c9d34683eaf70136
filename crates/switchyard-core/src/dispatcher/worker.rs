//! Dispatcher backed by a dedicated worker thread.
//!
//! This is the default dispatcher on desktop hosts: one named thread with its
//! own task channel, processing tasks sequentially. Queued slots connected to
//! a `WorkerDispatcher` always run on that thread.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use switchyard_core::{ConnectionType, Dispatcher, Signal, WorkerDispatcher};
//!
//! let worker = Arc::new(
//!     WorkerDispatcher::builder()
//!         .name("audio-events")
//!         .queue_capacity(64)
//!         .build()
//!         .unwrap(),
//! );
//!
//! let stopped = Signal::<String>::new();
//! stopped.connect_to(
//!     |track| println!("stopped: {track}"),
//!     worker.clone(),
//!     ConnectionType::Queued,
//! );
//! stopped.emit("intro.ogg".to_string()).unwrap();
//!
//! worker.shutdown_and_join();
//! assert!(!worker.is_running());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle, ThreadId};

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use parking_lot::Mutex;

use super::{DispatchQueue, Dispatcher, Task, run_task};
use crate::error::{DispatchError, Result};
use crate::logging::targets;

/// Default capacity for the worker's task queue.
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Configuration for creating a [`WorkerDispatcher`].
#[derive(Debug, Clone)]
pub struct WorkerDispatcherConfig {
    /// Name for the worker thread.
    pub name: String,
    /// Stack size for the worker thread in bytes. `None` uses the default.
    pub stack_size: Option<usize>,
    /// Capacity of the task queue. `None` makes the queue unbounded.
    pub queue_capacity: Option<usize>,
}

impl Default for WorkerDispatcherConfig {
    fn default() -> Self {
        Self {
            name: "switchyard-dispatch".to_string(),
            stack_size: None,
            queue_capacity: Some(DEFAULT_QUEUE_CAPACITY),
        }
    }
}

impl WorkerDispatcherConfig {
    /// Create a new configuration with the given thread name.
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Builder for creating a [`WorkerDispatcher`] with custom configuration.
#[derive(Debug, Default)]
pub struct WorkerDispatcherBuilder {
    config: WorkerDispatcherConfig,
}

impl WorkerDispatcherBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the stack size for the worker thread.
    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    /// Set the task queue capacity.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = Some(capacity);
        self
    }

    /// Remove the task queue bound.
    pub fn unbounded(mut self) -> Self {
        self.config.queue_capacity = None;
        self
    }

    /// Build and start the dispatcher thread.
    pub fn build(self) -> Result<WorkerDispatcher> {
        WorkerDispatcher::with_config(self.config)
    }
}

enum WorkerMessage {
    Run(Task),
    /// Wakes an idle worker so it notices shutdown.
    Shutdown,
}

/// A dispatcher that owns one dedicated thread.
///
/// Tasks are processed in FIFO order on the worker thread. After
/// [`shutdown`](Self::shutdown), already accepted tasks still run; new work
/// is rejected with [`DispatchError::ShutDown`].
pub struct WorkerDispatcher {
    name: String,
    sender: Sender<WorkerMessage>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
    running: Arc<AtomicBool>,
    queue: Arc<DispatchQueue>,
}

impl WorkerDispatcher {
    /// Start a dispatcher thread with the default configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(WorkerDispatcherConfig::default())
    }

    /// Create a builder for a custom configuration.
    pub fn builder() -> WorkerDispatcherBuilder {
        WorkerDispatcherBuilder::new()
    }

    /// Start a dispatcher thread with a custom configuration.
    pub fn with_config(config: WorkerDispatcherConfig) -> Result<Self> {
        let (sender, receiver) = match config.queue_capacity {
            Some(capacity) => bounded(capacity),
            None => unbounded(),
        };
        let running = Arc::new(AtomicBool::new(true));
        let queue = Arc::new(DispatchQueue::new());

        let thread_running = running.clone();
        let thread_queue = queue.clone();

        let mut builder = thread::Builder::new().name(config.name.clone());
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let handle = builder.spawn(move || worker_loop(receiver, thread_running, thread_queue))?;
        let thread_id = handle.thread().id();

        tracing::debug!(target: targets::DISPATCHER, name = %config.name, "worker dispatcher started");

        Ok(Self {
            name: config.name,
            sender,
            handle: Mutex::new(Some(handle)),
            thread_id,
            running,
            queue,
        })
    }

    /// The worker thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check if the dispatcher still accepts work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of queued slot calls not yet dispatched.
    pub fn pending_calls(&self) -> usize {
        self.queue.pending_count()
    }

    /// Stop accepting work. Already accepted tasks still run.
    ///
    /// This is non-blocking; use [`join`](Self::join) to wait for the thread.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::debug!(target: targets::DISPATCHER, name = %self.name, "worker dispatcher shutting down");
            // A full queue means the worker is busy and will see the flag.
            let _ = self.sender.try_send(WorkerMessage::Shutdown);
        }
    }

    /// Wait for the worker thread to finish.
    ///
    /// Returns `true` if the thread was joined, `false` if it was already
    /// joined, panicked, or this is called from the worker thread itself.
    pub fn join(&self) -> bool {
        if self.is_current_dispatch_thread() {
            return false;
        }
        match self.handle.lock().take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Stop the dispatcher and wait for its thread to finish.
    pub fn shutdown_and_join(&self) -> bool {
        self.shutdown();
        self.join()
    }
}

impl Dispatcher for WorkerDispatcher {
    fn is_dispatch_thread(&self, thread: ThreadId) -> bool {
        self.thread_id == thread
    }

    fn invoke_later(&self, task: Task) -> Result<()> {
        if !self.is_running() {
            return Err(DispatchError::ShutDown);
        }
        match self.sender.try_send(WorkerMessage::Run(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatchError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DispatchError::ShutDown),
        }
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for WorkerDispatcher {
    fn drop(&mut self) {
        self.shutdown();
        // Don't block in drop - just request shutdown
    }
}

impl std::fmt::Debug for WorkerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerDispatcher")
            .field("name", &self.name)
            .field("thread_id", &self.thread_id)
            .field("running", &self.is_running())
            .field("pending_calls", &self.pending_calls())
            .finish()
    }
}

/// The worker thread body.
fn worker_loop(receiver: Receiver<WorkerMessage>, running: Arc<AtomicBool>, queue: Arc<DispatchQueue>) {
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Run(task) => run_task(task, &queue),
            WorkerMessage::Shutdown => break,
        }
        if !running.load(Ordering::Acquire) {
            break;
        }
    }

    // Run what was accepted before shutdown.
    while let Ok(message) = receiver.try_recv() {
        if let WorkerMessage::Run(task) = message {
            run_task(task, &queue);
        }
    }

    // Close the channel first so later sends fail and retract their call.
    drop(receiver);
    queue.abandon_pending();

    tracing::debug!(target: targets::DISPATCHER, "worker dispatcher stopped");
}
