//! Error types for Switchyard.

use std::any::Any;
use std::sync::Arc;

use crate::context::DispatcherRole;

/// Errors surfaced to callers that schedule work on a dispatcher.
///
/// These are misuse conditions (the dispatcher can no longer accept work),
/// never slot failures. Slot failures travel through
/// [`Dispatcher::on_exception`](crate::Dispatcher::on_exception) instead.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher has been shut down and no longer accepts work.
    #[error("dispatcher has been shut down")]
    ShutDown,

    /// The dispatcher's bounded task queue is full.
    #[error("dispatcher task queue is full")]
    QueueFull,

    /// The dispatcher thread or runtime could not be started.
    #[error("failed to start dispatcher thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// A specialized Result type for dispatch operations.
pub type Result<T> = std::result::Result<T, DispatchError>;

/// An error raised by a slot or event handler.
///
/// Infallible slots can still fail by panicking; the panic is captured at
/// the invocation boundary and reported as [`SlotError::Panicked`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum SlotError {
    /// The slot panicked. Carries the panic message when one was available.
    #[error("slot panicked: {0}")]
    Panicked(String),

    /// The slot returned a plain error message.
    #[error("{0}")]
    Message(String),

    /// The slot returned an error value.
    #[error("{0}")]
    Failed(Arc<dyn std::error::Error + Send + Sync>),
}

impl SlotError {
    /// Create an error from a message.
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Wrap an arbitrary error value.
    pub fn new<E>(error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Failed(Arc::new(error))
    }

    /// Convert a panic payload captured by `catch_unwind`.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "<non-string panic payload>".to_string()
        };
        Self::Panicked(message)
    }

    /// Whether this error came from a captured panic.
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// Errors from the service [`Context`](crate::Context).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// A process-wide context was already installed.
    #[error("a global context has already been installed")]
    AlreadyInstalled,

    /// No service is registered for the requested capability.
    #[error("no service registered for `{0}`")]
    MissingService(&'static str),

    /// No dispatcher is registered for the requested role.
    #[error("no dispatcher registered for role {0:?}")]
    MissingDispatcher(DispatcherRole),
}
