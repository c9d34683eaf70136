//! Logging facilities for Switchyard.
//!
//! Switchyard uses the `tracing` crate for instrumentation and never installs
//! a subscriber itself. To see logs, install one in your application:
//!
//! ```ignore
//! fn main() {
//!     tracing_subscriber::fmt::init();
//!     // ...
//! }
//! ```
//!
//! Every event is emitted under one of the [`targets`] below, so a filter such
//! as `RUST_LOG=switchyard_core::dispatcher=debug` isolates a single
//! subsystem.

/// Target names for log filtering.
///
/// Use these with `tracing` directives to filter logs by subsystem.
pub mod targets {
    /// Signal emission and connection management.
    pub const SIGNAL: &str = "switchyard_core::signal";
    /// Dispatcher queues, pumps and threads.
    pub const DISPATCHER: &str = "switchyard_core::dispatcher";
    /// Event bus registration and delivery.
    pub const EVENT_BUS: &str = "switchyard_core::event_bus";
    /// Slot failure reporting.
    pub const FAILURE: &str = "switchyard_core::failure";
    /// Service context.
    pub const CONTEXT: &str = "switchyard_core::context";
}
