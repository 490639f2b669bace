//! Opaque handles for instances and pipe endpoints.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU64;

/// Identity of one VM instance.
///
/// Identities are handed out from a monotonically increasing counter and are
/// never reused within a session. The root instance is always [`InstanceId::ROOT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    /// The identity of the entrypoint instance.
    pub const ROOT: Self = Self(0);

    /// Wraps a raw identity value, e.g. one read back from a syscall argument.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw identity value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Returns true for the entrypoint instance.
    #[must_use]
    pub const fn is_root(self) -> bool {
        self.0 == Self::ROOT.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm#{}", self.0)
    }
}

/// One addressable end of a pipe.
///
/// Endpoint values are never zero; zero is the terminator of ABI endpoint lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(NonZeroU64);

impl Endpoint {
    /// Wraps a raw endpoint value. Returns `None` for zero.
    #[must_use]
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    /// Returns the raw endpoint value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0.get()
    }

    /// Decodes a zero-terminated endpoint array as passed through the spawn ABI.
    ///
    /// Decoding stops at the first zero; the zero itself is not part of the list.
    /// A slice without a terminator is taken whole.
    #[must_use]
    pub fn list_from_raw(raw: &[u64]) -> Vec<Self> {
        raw.iter().map_while(|value| Self::new(*value)).collect()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd#{}", self.0)
    }
}
