//! # vmspawn
//!
//! Deterministic spawn, pipe and join for VM instances.
//!
//! An instance can spawn child instances, talk to them through bounded
//! byte-stream pipes and wait for their exit codes. Everything runs on one
//! host thread under a cooperative scheduler, so a session is reproducible
//! step for step:
//!
//! - **Pipes**: paired endpoints with single ownership, handed to children at spawn
//! - **Instances**: monotonic identities, parentage, exactly-once exit
//! - **Spawn**: validate everything, then transfer endpoints all at once
//! - **Join**: suspend until the target exits, from any number of joiners
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use vmspawn::prelude::*;
//!
//! let registry = ProgramRegistry::new();
//! registry.register(0, 0, FnProgram::shared(|ctx, _argv| async move {
//!     let (a, b) = ctx.pipe()?;
//!     let child = ctx.spawn(&ProgramDescriptor::new(1, 0), Vec::new(), &[b])?;
//!     let bytes = ctx.read_to_end(a).await?;
//!     Ok(ctx.join(child).await?)
//! }));
//! registry.register(1, 0, FnProgram::shared(|ctx, _argv| async move {
//!     ctx.write_all(ctx.inherited_endpoints()[0], b"ok").await?;
//!     Ok(0)
//! }));
//!
//! let mut scheduler = Scheduler::new(SchedulerConfig::new(), Arc::new(registry))?;
//! scheduler.boot(&ProgramDescriptor::new(0, 0), Vec::new())?;
//! let outcome = scheduler.run(RunMode::Unlimited)?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod instances;
pub mod pipes;
pub mod program;
pub mod runtime;
pub mod scheduler;
pub mod snapshot;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::SchedulerConfig;
    pub use crate::core::{Endpoint, InstanceId, InstanceState};
    pub use crate::errors::{InvariantViolation, SchedulerError, SyscallError};
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::program::{
        Argv, Bounds, Program, ProgramDescriptor, ProgramFault, ProgramLoader, ProgramRegistry,
    };
    pub use crate::runtime::{InstanceContext, Runtime};
    pub use crate::scheduler::{RunMode, RunOutcome, Scheduler};
    pub use crate::snapshot::RuntimeSnapshot;
    pub use crate::testing::FnProgram;
}
