//! Dispatcher pumped by a host event loop.
//!
//! A `LoopDispatcher` belongs to the thread that created it, typically a UI
//! thread whose loop the host already runs. Other threads hand work over with
//! [`Dispatcher::invoke_later`]; the owning loop calls [`LoopDispatcher::pump`]
//! (or [`pump_one`](LoopDispatcher::pump_one)) whenever it gets a chance,
//! optionally woken by a host-supplied waker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use super::{DispatchQueue, Dispatcher, Task, run_task};
use crate::error::{DispatchError, Result};
use crate::logging::targets;
use crate::thread_check::ThreadAffinity;

type Waker = Box<dyn Fn() + Send + Sync>;

/// A dispatcher whose tasks are run by its owning thread's loop.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use switchyard_core::{ConnectionType, LoopDispatcher, Signal};
///
/// let ui = Arc::new(LoopDispatcher::new());
/// let clicked = Arc::new(Signal::<u32>::new());
/// clicked.connect_to(|n| println!("clicked {n} times"), ui.clone(), ConnectionType::Auto);
///
/// let background = clicked.clone();
/// std::thread::spawn(move || background.emit(3).unwrap()).join().unwrap();
///
/// // The slot runs once the owning loop pumps.
/// assert_eq!(ui.pump(), 1);
/// ```
pub struct LoopDispatcher {
    affinity: ThreadAffinity,
    tasks: Mutex<VecDeque<Task>>,
    available: Condvar,
    running: AtomicBool,
    waker: Option<Waker>,
    queue: DispatchQueue,
}

impl Default for LoopDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopDispatcher {
    /// Create a dispatcher owned by the current thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Create a dispatcher that calls `waker` after every scheduled task.
    ///
    /// Hosts use the waker to nudge a sleeping event loop, e.g. by posting a
    /// user event to it.
    pub fn with_waker<F>(waker: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self::build(Some(Box::new(waker)))
    }

    fn build(waker: Option<Waker>) -> Self {
        Self {
            affinity: ThreadAffinity::current(),
            tasks: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            running: AtomicBool::new(true),
            waker,
            queue: DispatchQueue::new(),
        }
    }

    /// The thread that owns this dispatcher.
    pub fn thread_id(&self) -> ThreadId {
        self.affinity.thread_id()
    }

    /// Number of scheduled tasks waiting for the loop.
    pub fn pending_tasks(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Check if the dispatcher still accepts work.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run the oldest scheduled task. Returns `false` if none was waiting.
    ///
    /// # Panics
    ///
    /// Panics if called from a thread other than the owning thread.
    pub fn pump_one(&self) -> bool {
        self.affinity
            .assert_same_thread_with_msg("LoopDispatcher::pump_one called off the owning thread");

        let Some(task) = self.tasks.lock().pop_front() else {
            return false;
        };
        run_task(task, &self.queue);
        true
    }

    /// Run the tasks that were waiting when the call started.
    ///
    /// Tasks scheduled while pumping wait for the next call, so a slot that
    /// keeps re-emitting cannot starve the host loop. Returns how many ran.
    pub fn pump(&self) -> usize {
        let waiting = self.pending_tasks();
        let mut processed = 0;
        while processed < waiting && self.pump_one() {
            processed += 1;
        }
        if processed > 0 {
            tracing::trace!(target: targets::DISPATCHER, processed, "loop dispatcher pumped");
        }
        processed
    }

    /// Wait up to `timeout` for work, then [`pump`](Self::pump).
    pub fn pump_timeout(&self, timeout: Duration) -> usize {
        {
            let mut tasks = self.tasks.lock();
            if tasks.is_empty() && self.is_running() {
                let _ = self.available.wait_for(&mut tasks, timeout);
            }
        }
        self.pump()
    }

    /// Stop accepting work and drop everything still scheduled.
    ///
    /// Emitters blocked on a dropped call are released without a value.
    pub fn shutdown(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            let dropped = {
                let mut tasks = self.tasks.lock();
                let count = tasks.len();
                tasks.clear();
                self.available.notify_all();
                count
            };
            self.queue.abandon_pending();
            tracing::debug!(target: targets::DISPATCHER, dropped, "loop dispatcher shut down");
        }
    }
}

impl Dispatcher for LoopDispatcher {
    fn is_dispatch_thread(&self, thread: ThreadId) -> bool {
        self.affinity.is_thread(thread)
    }

    fn invoke_later(&self, task: Task) -> Result<()> {
        {
            let mut tasks = self.tasks.lock();
            // Checked under the lock so shutdown cannot miss this task.
            if !self.is_running() {
                return Err(DispatchError::ShutDown);
            }
            tasks.push_back(task);
            self.available.notify_one();
        }
        if let Some(waker) = &self.waker {
            waker();
        }
        Ok(())
    }

    fn queue(&self) -> &DispatchQueue {
        &self.queue
    }
}

impl std::fmt::Debug for LoopDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopDispatcher")
            .field("thread_id", &self.thread_id())
            .field("running", &self.is_running())
            .field("pending_tasks", &self.pending_tasks())
            .finish()
    }
}
