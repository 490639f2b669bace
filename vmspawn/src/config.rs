//! Session-wide resource policy for the scheduler.

use crate::errors::SchedulerError;
use serde::{Deserialize, Serialize};

/// Budgets and buffer sizes for one scheduling session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum number of instances running at the same time, root included.
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Maximum number of open pipe endpoints across the session.
    #[serde(default = "default_max_endpoints")]
    pub max_endpoints: usize,
    /// Maximum spawn nesting depth. The root is at depth 0.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Bytes buffered per pipe direction before writers suspend.
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,
}

fn default_max_instances() -> usize {
    16
}

fn default_max_endpoints() -> usize {
    64
}

fn default_max_depth() -> u32 {
    8
}

fn default_pipe_capacity() -> usize {
    4096
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_instances: default_max_instances(),
            max_endpoints: default_max_endpoints(),
            max_depth: default_max_depth(),
            pipe_capacity: default_pipe_capacity(),
        }
    }
}

impl SchedulerConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the running instance budget.
    #[must_use]
    pub fn with_max_instances(mut self, max_instances: usize) -> Self {
        self.max_instances = max_instances;
        self
    }

    /// Sets the open endpoint budget.
    #[must_use]
    pub fn with_max_endpoints(mut self, max_endpoints: usize) -> Self {
        self.max_endpoints = max_endpoints;
        self
    }

    /// Sets the maximum spawn depth.
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Sets the per-direction pipe buffer size.
    #[must_use]
    pub fn with_pipe_capacity(mut self, pipe_capacity: usize) -> Self {
        self.pipe_capacity = pipe_capacity;
        self
    }

    /// Checks that the configuration can run at least a root instance.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.max_instances == 0 {
            return Err(SchedulerError::Config(
                "max_instances must allow the root instance".to_string(),
            ));
        }
        if self.pipe_capacity == 0 {
            return Err(SchedulerError::Config(
                "pipe_capacity must be at least one byte".to_string(),
            ));
        }
        if self.max_endpoints % 2 == 1 {
            tracing::warn!(
                max_endpoints = self.max_endpoints,
                "Odd endpoint budget; pipes are allocated in pairs"
            );
        }
        Ok(())
    }
}
