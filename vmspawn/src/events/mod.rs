//! Lifecycle events emitted by the runtime.
//!
//! The runtime reports instance and pipe lifecycle changes to an [`EventSink`].
//! Emission happens while syscalls are being served, so sinks must not block.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// An instance was spawned.
pub const INSTANCE_SPAWNED: &str = "instance.spawned";
/// An instance terminated, normally or by fault.
pub const INSTANCE_EXITED: &str = "instance.exited";
/// A join returned an exit code.
pub const INSTANCE_JOINED: &str = "instance.joined";
/// A pipe was created.
pub const PIPE_CREATED: &str = "pipe.created";
/// An endpoint was closed, explicitly or at exit.
pub const PIPE_CLOSED: &str = "pipe.closed";
