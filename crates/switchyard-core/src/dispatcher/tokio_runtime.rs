//! Dispatcher backed by a current-thread Tokio runtime.
//!
//! This module requires the `tokio` feature:
//!
//! ```toml
//! [dependencies]
//! switchyard-core = { version = "0.1", features = ["tokio"] }
//! ```
//!
//! The runtime runs on one dedicated thread. Queued slots and futures spawned
//! through [`TokioDispatcher::spawn`] share that thread, so a slot connected to
//! this dispatcher never races with the async code it cooperates with.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{JoinHandle, ThreadId};

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle};
use tokio::sync::mpsc;

use super::{DispatchQueue, Dispatcher, Task, run_task};
use crate::error::{DispatchError, Result};
use crate::logging::targets;

/// A dispatcher that runs its calls inside a Tokio runtime.
///
/// # Example
///
/// ```
/// # #[cfg(feature = "tokio")]
/// # {
/// use std::sync::Arc;
/// use switchyard_core::{ConnectionType, Signal, TokioDispatcher};
///
/// let dispatcher = Arc::new(TokioDispatcher::new().unwrap());
/// let doubled = Signal::<i32, i32>::returning();
/// doubled.connect_to(|n| n * 2, dispatcher.clone(), ConnectionType::Queued);
///
/// assert_eq!(doubled.emit(21).unwrap(), Some(42));
/// dispatcher.shutdown_and_join();
/// # }
/// ```
pub struct TokioDispatcher {
    name: String,
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    runtime: Handle,
    thread_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
    queue: Arc<DispatchQueue>,
}

impl TokioDispatcher {
    /// Start a runtime thread named `switchyard-tokio`.
    pub fn new() -> Result<Self> {
        Self::with_name("switchyard-tokio")
    }

    /// Start a runtime thread with the given name.
    pub fn with_name(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let queue = Arc::new(DispatchQueue::new());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();
        let (handle_tx, handle_rx) = std::sync::mpsc::channel();

        let loop_queue = queue.clone();
        let thread = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                let runtime = match Builder::new_current_thread().enable_time().build() {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        let _ = handle_tx.send(Err(err));
                        return;
                    }
                };
                let _ = handle_tx.send(Ok(runtime.handle().clone()));

                runtime.block_on(async {
                    while let Some(task) = receiver.recv().await {
                        run_task(task, &loop_queue);
                    }
                });
                loop_queue.abandon_pending();
                tracing::debug!(target: targets::DISPATCHER, "tokio dispatcher exiting");
            })?;

        let thread_id = thread.thread().id();
        let runtime = match handle_rx.recv() {
            Ok(Ok(runtime)) => runtime,
            Ok(Err(err)) => return Err(DispatchError::Spawn(err)),
            Err(_) => return Err(DispatchError::ShutDown),
        };

        tracing::debug!(target: targets::DISPATCHER, name = %name, "tokio dispatcher started");

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            runtime,
            thread_id,
            handle: Mutex::new(Some(thread)),
            running: AtomicBool::new(true),
            queue,
        })
    }

    /// Name of the runtime thread.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Handle to the underlying runtime.
    pub fn handle(&self) -> &Handle {
        &self.runtime
    }

    /// Spawn a future on the dispatcher's thread.
    ///
    /// Futures still pending at shutdown are dropped with the runtime.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.spawn(future)
    }

    /// Check if the dispatcher still accepts work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stop accepting work. Calls already accepted still run.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.sender.lock().take();
            tracing::debug!(target: targets::DISPATCHER, name = %self.name, "tokio dispatcher shutting down");
        }
    }

    /// Wait for the runtime thread to exit.
    ///
    /// Returns `false` if it was already joined or this is the runtime
    /// thread itself.
    pub fn join(&self) -> bool {
        if self.is_current_dispatch_thread() {
            return false;
        }
        match self.handle.lock().take() {
            Some(handle) => handle.join().is_ok(),
            None => false,
        }
    }

    /// Shut down and wait for the runtime thread.
    pub fn shutdown_and_join(&self) -> bool {
        self.shutdown();
        self.join()
    }
}

impl Dispatcher for TokioDispatcher {
    fn is_dispatch_thread(&self, thread: ThreadId) -> bool {
        self.thread_id == thread
    }

    fn invoke_later(&self, task: Task) -> Result<()> {
        let sender = self.sender.lock();
        let sender = sender.as_ref().ok_or(DispatchError::ShutDown)?;
        sender.send(task).map_err(|_| DispatchError::ShutDown)
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl Drop for TokioDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for TokioDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokioDispatcher")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_tasks_run_on_runtime_thread() {
        let dispatcher = Arc::new(TokioDispatcher::new().unwrap());
        let (tx, rx) = std::sync::mpsc::channel();

        let probe = dispatcher.clone();
        dispatcher
            .invoke_later(Box::new(move || {
                tx.send(probe.is_current_dispatch_thread()).unwrap();
            }))
            .unwrap();

        assert!(rx.recv().unwrap());
        assert!(!dispatcher.is_current_dispatch_thread());
        assert!(dispatcher.shutdown_and_join());
    }

    #[test]
    fn test_spawned_futures_share_the_thread() {
        let dispatcher = TokioDispatcher::with_name("tokio-probe").unwrap();

        let (tx, rx) = std::sync::mpsc::channel();

        dispatcher.spawn(async move {
            tokio::task::yield_now().await;
            let _ = tx.send(std::thread::current().name().map(str::to_owned));
        });

        assert_eq!(rx.recv().unwrap().as_deref(), Some("tokio-probe"));
        dispatcher.shutdown_and_join();
    }

    #[test]
    fn test_accepted_tasks_run_before_exit() {
        let dispatcher = TokioDispatcher::new().unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        for _ in 0..5 {
            let count = count.clone();
            dispatcher
                .invoke_later(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }

        assert!(dispatcher.shutdown_and_join());
        assert_eq!(count.load(Ordering::SeqCst), 5);
        assert!(matches!(
            dispatcher.invoke_later(Box::new(|| {})),
            Err(DispatchError::ShutDown)
        ));
    }
}
