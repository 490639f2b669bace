//! Instance lifecycle state.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an instance.
///
/// `Running --(execution terminates)--> Exited`. `Exited` is terminal, and the
/// exit code only exists once the instance has exited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum InstanceState {
    /// The instance is executing or suspended in a blocking call.
    #[default]
    Running,
    /// The instance terminated with the given exit code.
    Exited {
        /// Exit code reported by the instance.
        exit_code: i8,
    },
}

impl InstanceState {
    /// Returns the exit code if the instance has exited.
    #[must_use]
    pub const fn exit_code(self) -> Option<i8> {
        match self {
            Self::Running => None,
            Self::Exited { exit_code } => Some(exit_code),
        }
    }

    /// Returns true once the instance has exited.
    #[must_use]
    pub const fn is_exited(self) -> bool {
        matches!(self, Self::Exited { .. })
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Exited { exit_code } => write!(f, "exited({exit_code})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_running() {
        let state = InstanceState::default();
        assert!(!state.is_exited());
        assert_eq!(state.exit_code(), None);
    }

    #[test]
    fn test_exited_carries_code() {
        let state = InstanceState::Exited { exit_code: -3 };
        assert!(state.is_exited());
        assert_eq!(state.exit_code(), Some(-3));
        assert_eq!(state.to_string(), "exited(-3)");
    }

    #[test]
    fn test_serialization() {
        let json = serde_json::to_value(InstanceState::Exited { exit_code: 4 }).unwrap_or_default();
        assert_eq!(json["state"], "exited");
        assert_eq!(json["exit_code"], 4);
    }
}
