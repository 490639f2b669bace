//! Error types for the spawn/pipe/join subsystem.
//!
//! Three layers are kept apart:
//!
//! - [`SyscallError`] is what an instance sees as the result of a syscall.
//! - [`InvariantViolation`] is a defect in the host runtime; it stops the session.
//! - [`SchedulerError`] is what the host sees from the scheduler.

use crate::core::{Endpoint, InstanceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// ABI result code for success.
pub const SUCCESS: u8 = 0;
/// ABI result code when the spawn target cannot be resolved.
pub const ITEM_MISSING: u8 = 2;
/// ABI result code for malformed requests such as a self-join.
pub const WAIT_FAILURE: u8 = 5;
/// ABI result code for unknown, unowned or closed handles.
pub const INVALID_FD: u8 = 6;
/// ABI result code for writes whose peer endpoint is closed.
pub const OTHER_END_CLOSED: u8 = 7;
/// ABI result code when the instance budget is reached.
pub const MAX_VMS_SPAWNED: u8 = 8;
/// ABI result code when the endpoint budget is reached.
pub const MAX_FDS_CREATED: u8 = 9;

/// A bounded, session-wide resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// Concurrently running instances.
    Instances,
    /// Spawn nesting depth.
    Depth,
    /// Open pipe endpoints.
    Endpoints,
    /// The identity counter itself.
    Identities,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Instances => write!(f, "instances"),
            Self::Depth => write!(f, "depth"),
            Self::Endpoints => write!(f, "endpoints"),
            Self::Identities => write!(f, "identities"),
        }
    }
}

/// Error returned to an instance by a syscall.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    /// The referenced instance or endpoint is unknown, not owned by the caller,
    /// or already closed.
    #[error("Invalid handle: {handle}")]
    InvalidHandle {
        /// The raw handle value.
        handle: u64,
    },

    /// The spawn target could not be resolved into a program.
    #[error("Invalid program (index {index}, source {source_id}): {reason}")]
    InvalidProgram {
        /// Descriptor index.
        index: u64,
        /// Descriptor source.
        source_id: u64,
        /// Why resolution failed.
        reason: String,
    },

    /// The request is malformed.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// What was wrong with the request.
        reason: String,
    },

    /// A session-wide budget is exhausted.
    #[error("Resource exhausted: {resource} (limit {limit})")]
    ResourceExhausted {
        /// The exhausted resource.
        resource: ResourceKind,
        /// The configured limit.
        limit: u64,
    },

    /// The peer endpoint is closed, so nothing written can ever be read.
    #[error("Broken channel: peer of {endpoint} is closed")]
    BrokenChannel {
        /// The endpoint that was written to.
        endpoint: Endpoint,
    },
}

impl SyscallError {
    /// Creates an invalid handle error for an endpoint.
    #[must_use]
    pub const fn invalid_endpoint(endpoint: Endpoint) -> Self {
        Self::InvalidHandle {
            handle: endpoint.get(),
        }
    }

    /// Creates an invalid handle error for an instance.
    #[must_use]
    pub const fn invalid_instance(instance: InstanceId) -> Self {
        Self::InvalidHandle {
            handle: instance.get(),
        }
    }

    /// Creates an invalid program error.
    #[must_use]
    pub fn invalid_program(index: u64, source_id: u64, reason: impl Into<String>) -> Self {
        Self::InvalidProgram {
            index,
            source_id,
            reason: reason.into(),
        }
    }

    /// Creates an invalid argument error.
    #[must_use]
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    /// Creates a resource exhausted error.
    #[must_use]
    pub const fn exhausted(resource: ResourceKind, limit: u64) -> Self {
        Self::ResourceExhausted { resource, limit }
    }

    /// Returns the ABI result code for this error.
    #[must_use]
    pub const fn code(&self) -> u8 {
        match self {
            Self::InvalidHandle { .. } => INVALID_FD,
            Self::InvalidProgram { .. } => ITEM_MISSING,
            Self::InvalidArgument { .. } => WAIT_FAILURE,
            Self::ResourceExhausted {
                resource: ResourceKind::Endpoints,
                ..
            } => MAX_FDS_CREATED,
            Self::ResourceExhausted { .. } => MAX_VMS_SPAWNED,
            Self::BrokenChannel { .. } => OTHER_END_CLOSED,
        }
    }

    /// Returns a short, stable name for the error kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidHandle { .. } => "invalid_handle",
            Self::InvalidProgram { .. } => "invalid_program",
            Self::InvalidArgument { .. } => "invalid_argument",
            Self::ResourceExhausted { .. } => "resource_exhausted",
            Self::BrokenChannel { .. } => "broken_channel",
        }
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("type".to_string(), serde_json::json!(self.kind()));
        map.insert("code".to_string(), serde_json::json!(self.code()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// A broken internal invariant of the host runtime.
///
/// These are never reported to instances; the scheduler stops the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// `mark_exited` was called twice for one instance.
    #[error("Instance {instance} was marked exited twice")]
    DoubleExit {
        /// The instance.
        instance: InstanceId,
    },

    /// `mark_exited` referenced an instance the table never allocated.
    #[error("Instance {instance} is not in the instance table")]
    UnknownInstance {
        /// The instance.
        instance: InstanceId,
    },

    /// A freshly allocated identity was already present in the table.
    #[error("Identity collision on {instance}")]
    IdentityCollision {
        /// The colliding identity.
        instance: InstanceId,
    },

    /// A second root instance was requested.
    #[error("Root instance already booted")]
    DuplicateRoot,
}

/// Error returned by the scheduler to the host.
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    /// A syscall-level failure while booting the session.
    #[error("{0}")]
    Syscall(#[from] SyscallError),

    /// The runtime broke one of its own invariants.
    #[error("Invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    /// Every live instance is suspended and nothing can wake them.
    #[error("Deadlock: {} instance(s) blocked with nothing left to run", blocked.len())]
    Deadlock {
        /// The blocked instances, in identity order.
        blocked: Vec<InstanceId>,
    },

    /// The session used up its step budget before the root exited.
    #[error("Step budget exceeded: {consumed_steps} steps consumed (limit {limit})")]
    StepsExceeded {
        /// Steps consumed when the session was stopped.
        consumed_steps: u64,
        /// The configured budget.
        limit: u64,
    },

    /// The scheduler configuration is unusable.
    #[error("Configuration error: {0}")]
    Config(String),
}
