//! Slot failure reporting.
//!
//! Every failure raised by a slot, an event handler or a task scheduled on a
//! dispatcher ends up in [`report`]. If an observer is connected to the
//! relevant exception signal the failure is emitted there. Otherwise the
//! failure is unobserved: it is logged, printed, and the process terminates
//! according to the [`UnobservedFailurePolicy`].

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};

use crate::connection::ConnectionId;
use crate::error::SlotError;
use crate::logging::targets;
use crate::signal::Signal;

/// A failure raised by a slot, reported through an exception signal.
#[derive(Debug, Clone)]
pub struct SlotFailure {
    connection: Option<ConnectionId>,
    thread: String,
    error: SlotError,
}

impl SlotFailure {
    /// Create a failure record on the current thread.
    pub(crate) fn new(connection: Option<ConnectionId>, error: SlotError) -> Self {
        let current = std::thread::current();
        Self {
            connection,
            thread: current.name().unwrap_or("<unnamed>").to_string(),
            error,
        }
    }

    /// The connection whose slot failed, if the failure came from a signal slot.
    pub fn connection(&self) -> Option<ConnectionId> {
        self.connection
    }

    /// Name of the thread the slot was running on.
    pub fn thread_name(&self) -> &str {
        &self.thread
    }

    /// The underlying slot error.
    pub fn error(&self) -> &SlotError {
        &self.error
    }
}

impl fmt::Display for SlotFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot failed on thread \"{}\": {}", self.thread, self.error)
    }
}

impl std::error::Error for SlotFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// What happens to a failure nobody is observing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum UnobservedFailurePolicy {
    /// Log, print to stderr and exit the process with status 1.
    #[default]
    Exit = 0,
    /// Log, print to stderr and abort the process.
    Abort = 1,
    /// Log only and keep running.
    LogOnly = 2,
}

impl UnobservedFailurePolicy {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Abort,
            2 => Self::LogOnly,
            _ => Self::Exit,
        }
    }
}

/// Process-wide policy for unobserved failures.
static UNOBSERVED_POLICY: AtomicU8 = AtomicU8::new(UnobservedFailurePolicy::Exit as u8);

/// Set the process-wide policy for failures with no exception observer.
///
/// The default, [`UnobservedFailurePolicy::Exit`], terminates the process so
/// that errors in deferred callbacks are never silently swallowed. Subscribe
/// to the relevant `on_exception` signal to handle failures gracefully.
pub fn set_unobserved_failure_policy(policy: UnobservedFailurePolicy) {
    UNOBSERVED_POLICY.store(policy as u8, Ordering::SeqCst);
}

/// The current policy for unobserved failures.
pub fn unobserved_failure_policy() -> UnobservedFailurePolicy {
    UnobservedFailurePolicy::from_u8(UNOBSERVED_POLICY.load(Ordering::SeqCst))
}

/// Run `f`, converting a panic into [`SlotError::Panicked`].
pub(crate) fn guarded<T>(f: impl FnOnce() -> Result<T, SlotError>) -> Result<T, SlotError> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => Err(SlotError::from_panic(payload)),
    }
}

/// Route a failure to its exception signal, or apply the unobserved policy.
pub(crate) fn report(exceptions: Option<&Signal<SlotFailure>>, failure: SlotFailure) {
    match exceptions {
        Some(signal) if !signal.is_empty() => {
            tracing::debug!(target: targets::FAILURE, %failure, "forwarding slot failure to observers");
            if let Err(err) = signal.emit(failure) {
                tracing::error!(target: targets::FAILURE, error = %err, "failed to deliver slot failure");
            }
        }
        _ => unobserved(&failure),
    }
}

#[cold]
#[inline(never)]
fn unobserved(failure: &SlotFailure) {
    tracing::error!(target: targets::FAILURE, %failure, "unobserved slot failure");
    match unobserved_failure_policy() {
        UnobservedFailurePolicy::Exit => {
            eprintln!("switchyard: unobserved slot failure: {failure}");
            std::process::exit(1);
        }
        UnobservedFailurePolicy::Abort => {
            eprintln!("switchyard: unobserved slot failure: {failure}");
            std::process::abort();
        }
        UnobservedFailurePolicy::LogOnly => {}
    }
}
