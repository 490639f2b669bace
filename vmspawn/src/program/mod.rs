//! The contract between the scheduler and the code an instance runs.
//!
//! The VM interpreter and image loading live outside this crate. They plug in
//! through two traits: a [`ProgramLoader`] turns a spawn descriptor into a
//! [`Program`], and a [`Program`] is the body of one instance.

mod descriptor;
mod loader;

pub use descriptor::{Bounds, ProgramDescriptor};
pub use loader::{ProgramLoader, ProgramRegistry};

#[cfg(test)]
pub(crate) use loader::MockProgramLoader;

use crate::errors::SyscallError;
use crate::runtime::InstanceContext;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Exit code recorded for an instance whose program faulted.
pub const FAULT_EXIT_CODE: i8 = -1;

/// Command-line style arguments handed to an instance.
pub type Argv = Vec<Vec<u8>>;

/// The body of an instance.
///
/// `run` is polled by the scheduler. Every syscall that can block is an
/// `.await` point on the given [`InstanceContext`]. The returned code is the
/// instance's exit code; an error is recorded as a fault with
/// [`FAULT_EXIT_CODE`].
#[async_trait]
pub trait Program: Send + Sync {
    /// Runs the instance to completion.
    async fn run(self: Arc<Self>, ctx: InstanceContext, argv: Argv) -> Result<i8, ProgramFault>;
}

/// Abnormal termination of a program.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ProgramFault {
    /// What went wrong.
    pub message: String,
}

impl ProgramFault {
    /// Creates a fault with a message.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<SyscallError> for ProgramFault {
    fn from(err: SyscallError) -> Self {
        Self::new(format!("unhandled syscall error: {err}"))
    }
}
