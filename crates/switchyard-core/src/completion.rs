//! One-shot completion tokens for blocking queued calls.
//!
//! Every `BlockingQueued` call gets its own handle/waiter pair. The handle
//! travels with the queued call; the dispatcher pump completes it after the
//! slot ran. The waiter stays with the emitting thread.
//!
//! A completion stored before the emitter starts waiting is kept in the
//! shared state, so a fast pump can never produce a missed wake-up. Dropping
//! the handle without completing it (the call was skipped, failed, or
//! abandoned by a dispatcher shutdown) releases the waiter with no value.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

enum Outcome<R> {
    Pending,
    Done(Option<R>),
    Abandoned,
}

struct CompletionState<R> {
    outcome: Mutex<Outcome<R>>,
    condvar: Condvar,
}

impl<R> CompletionState<R> {
    fn settle(&self, outcome: Outcome<R>) {
        let mut guard = self.outcome.lock();
        *guard = outcome;
        self.condvar.notify_all();
    }
}

/// The completing side, carried by the queued call.
pub(crate) struct CompletionHandle<R> {
    inner: Option<Arc<CompletionState<R>>>,
}

impl<R> CompletionHandle<R> {
    /// Signal that the call finished, handing its value to the waiter.
    pub(crate) fn complete(mut self, value: Option<R>) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Outcome::Done(value));
        }
    }
}

impl<R> Drop for CompletionHandle<R> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.settle(Outcome::Abandoned);
        }
    }
}

/// The waiting side, kept by the emitting thread.
pub(crate) struct CompletionWaiter<R> {
    inner: Arc<CompletionState<R>>,
}

impl<R> CompletionWaiter<R> {
    /// Block until the call completes or is abandoned.
    ///
    /// There is no timeout: the wait lasts until the dispatcher either runs
    /// the call or drops it.
    pub(crate) fn wait(self) -> Option<R> {
        let mut guard = self.inner.outcome.lock();
        loop {
            match std::mem::replace(&mut *guard, Outcome::Pending) {
                Outcome::Pending => self.inner.condvar.wait(&mut guard),
                Outcome::Done(value) => return value,
                Outcome::Abandoned => return None,
            }
        }
    }

    /// Wait with a timeout. Returns `Err(self)` if the call is still pending.
    #[cfg(test)]
    pub(crate) fn wait_timeout(self, timeout: std::time::Duration) -> Result<Option<R>, Self> {
        {
            let mut guard = self.inner.outcome.lock();
            if matches!(*guard, Outcome::Pending) {
                let _ = self.inner.condvar.wait_for(&mut guard, timeout);
            }
            match std::mem::replace(&mut *guard, Outcome::Pending) {
                Outcome::Pending => {}
                Outcome::Done(value) => return Ok(value),
                Outcome::Abandoned => return Ok(None),
            }
        }
        Err(self)
    }
}

/// Create a handle/waiter pair for one blocking call.
pub(crate) fn completion_pair<R>() -> (CompletionHandle<R>, CompletionWaiter<R>) {
    let state = Arc::new(CompletionState {
        outcome: Mutex::new(Outcome::Pending),
        condvar: Condvar::new(),
    });

    (
        CompletionHandle {
            inner: Some(state.clone()),
        },
        CompletionWaiter { inner: state },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_completion_across_threads() {
        let (handle, waiter) = completion_pair::<i32>();

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            handle.complete(Some(42));
        });

        assert_eq!(waiter.wait(), Some(42));
        thread.join().unwrap();
    }

    #[test]
    fn test_completion_before_wait_is_not_missed() {
        let (handle, waiter) = completion_pair::<&str>();
        handle.complete(Some("early"));
        assert_eq!(waiter.wait(), Some("early"));
    }

    #[test]
    fn test_dropped_handle_releases_waiter() {
        let (handle, waiter) = completion_pair::<i32>();

        let thread = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            drop(handle);
        });

        assert_eq!(waiter.wait(), None);
        thread.join().unwrap();
    }

    #[test]
    fn test_pending_call_has_no_timeout_of_its_own() {
        let (handle, waiter) = completion_pair::<i32>();

        let waiter = match waiter.wait_timeout(Duration::from_millis(20)) {
            Err(waiter) => waiter,
            Ok(value) => panic!("completed without a handle: {value:?}"),
        };

        handle.complete(Some(7));
        assert_eq!(waiter.wait_timeout(Duration::from_millis(20)).ok(), Some(Some(7)));
    }
}
