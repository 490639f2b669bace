//! Deterministic cooperative scheduler.
//!
//! Every instance is a future. The scheduler polls ready instances one at a
//! time on the calling thread, in ascending identity order starting after the
//! instance polled last. One poll is one step. Given the same programs and
//! inputs, two sessions take the same steps in the same order.

mod waker;


use crate::config::SchedulerConfig;
use crate::core::InstanceId;
use crate::errors::SchedulerError;
use crate::events::{EventSink, NoOpEventSink};
use crate::program::{Argv, ProgramDescriptor, ProgramFault, ProgramLoader};
use crate::runtime::{InstanceContext, Runtime};
use crate::snapshot::RuntimeSnapshot;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tracing::{debug, info, warn};
use waker::{instance_waker, ReadySet};

/// How long one call to [`Scheduler::run`] may go on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Run until the root instance exits.
    #[default]
    Unlimited,
    /// Stop after this many steps if the root is still running.
    LimitSteps(u64),
}

/// Result of a call to [`Scheduler::run`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum RunOutcome {
    /// The root instance exited; the session is over.
    Exited {
        /// Exit code of the root.
        exit_code: i8,
        /// Steps consumed over the whole session.
        consumed_steps: u64,
    },
    /// The step limit was reached; call `run` again to continue.
    Paused {
        /// Steps consumed so far.
        consumed_steps: u64,
    },
}

impl RunOutcome {
    /// Steps consumed when the outcome was produced.
    #[must_use]
    pub const fn consumed_steps(&self) -> u64 {
        match self {
            Self::Exited { consumed_steps, .. } | Self::Paused { consumed_steps } => *consumed_steps,
        }
    }

    /// Root exit code, if the session finished.
    #[must_use]
    pub const fn exit_code(&self) -> Option<i8> {
        match self {
            Self::Exited { exit_code, .. } => Some(*exit_code),
            Self::Paused { .. } => None,
        }
    }
}

struct Task {
    future: BoxFuture<'static, Result<i8, ProgramFault>>,
    waker: Waker,
}

/// Drives every instance of one session.
pub struct Scheduler {
    runtime: Arc<Runtime>,
    tasks: BTreeMap<InstanceId, Task>,
    ready: ReadySet,
    root: Option<InstanceId>,
    last_polled: Option<InstanceId>,
    consumed_steps: u64,
    finished: Option<RunOutcome>,
}

impl Scheduler {
    /// Creates a scheduler with a fresh runtime that discards events.
    pub fn new(config: SchedulerConfig, loader: Arc<dyn ProgramLoader>) -> Result<Self, SchedulerError> {
        Self::with_event_sink(config, loader, Arc::new(NoOpEventSink))
    }

    /// Creates a scheduler reporting lifecycle events to `events`.
    pub fn with_event_sink(
        config: SchedulerConfig,
        loader: Arc<dyn ProgramLoader>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self, SchedulerError> {
        Ok(Self::from_runtime(Runtime::new(config, loader, events)?))
    }

    /// Creates a scheduler over an existing runtime.
    #[must_use]
    pub fn from_runtime(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            tasks: BTreeMap::new(),
            ready: ReadySet::default(),
            root: None,
            last_polled: None,
            consumed_steps: 0,
            finished: None,
        }
    }

    /// Registers the entrypoint instance.
    pub fn boot(&mut self, descriptor: &ProgramDescriptor, argv: Argv) -> Result<InstanceId, SchedulerError> {
        let root = self.runtime.boot(descriptor, argv)?;
        self.root = Some(root);
        Ok(root)
    }

    /// The runtime shared by the session's instances.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Steps consumed so far.
    #[must_use]
    pub fn consumed_steps(&self) -> u64 {
        self.consumed_steps
    }

    /// Instances that have been launched and not yet finished.
    #[must_use]
    pub fn live_instances(&self) -> Vec<InstanceId> {
        self.tasks.keys().copied().collect()
    }

    /// Captures the runtime tables.
    #[must_use]
    pub fn snapshot(&self) -> RuntimeSnapshot {
        self.runtime.snapshot(self.consumed_steps)
    }

    /// Polls instances until the root exits or `mode` runs out.
    ///
    /// Once the root has exited every further call returns the same outcome.
    pub fn run(&mut self, mode: RunMode) -> Result<RunOutcome, SchedulerError> {
        if let Some(outcome) = self.finished {
            return Ok(outcome);
        }
        let root = self
            .root
            .ok_or_else(|| SchedulerError::Config("no root instance booted".to_string()))?;
        let budget = match mode {
            RunMode::Unlimited => None,
            RunMode::LimitSteps(limit) => Some(limit),
        };

        let mut steps = 0u64;
        loop {
            if let Some(violation) = self.runtime.fatal() {
                return Err(violation.into());
            }
            if let Some(exit_code) = self.runtime.exit_code(root) {
                return Ok(self.finish(exit_code));
            }
            self.launch_pending();

            if budget.is_some_and(|limit| steps >= limit) {
                debug!(consumed_steps = self.consumed_steps, "Step limit reached");
                return Ok(RunOutcome::Paused {
                    consumed_steps: self.consumed_steps,
                });
            }
            let Some(id) = self.next_ready() else {
                let blocked = self.live_instances();
                warn!(blocked = ?blocked, consumed_steps = self.consumed_steps, "Deadlock detected");
                return Err(SchedulerError::Deadlock { blocked });
            };
            if self.poll_instance(id) {
                steps += 1;
            }
        }
    }

    fn launch_pending(&mut self) {
        while let Some(launch) = self.runtime.next_launch() {
            let ctx = InstanceContext::new(launch.id, Arc::clone(&self.runtime), launch.endpoints);
            let future = launch.program.run(ctx, launch.argv);
            let waker = instance_waker(launch.id, &self.ready);
            self.tasks.insert(launch.id, Task { future, waker });
            self.ready.lock().insert(launch.id);
            debug!(instance = %launch.id, "Launched instance");
        }
    }

    /// Picks the next ready instance after the one polled last, wrapping around.
    fn next_ready(&mut self) -> Option<InstanceId> {
        let mut ready = self.ready.lock();
        let next = self
            .last_polled
            .and_then(|last| {
                ready
                    .range((Bound::Excluded(last), Bound::Unbounded))
                    .next()
                    .copied()
            })
            .or_else(|| ready.first().copied())?;
        ready.remove(&next);
        Some(next)
    }

    /// Polls one instance. Returns false if it had already finished.
    fn poll_instance(&mut self, id: InstanceId) -> bool {
        let Some(task) = self.tasks.get_mut(&id) else {
            return false;
        };
        self.consumed_steps += 1;
        self.last_polled = Some(id);

        let mut cx = Context::from_waker(&task.waker);
        let poll = task.future.as_mut().poll(&mut cx);
        if let Poll::Ready(result) = poll {
            self.tasks.remove(&id);
            if let Err(violation) = self.runtime.exit(id, result) {
                self.runtime.record_fatal(violation);
            }
        }
        true
    }

    /// Tears down what is left once the root has exited.
    fn finish(&mut self, exit_code: i8) -> RunOutcome {
        for (id, task) in std::mem::take(&mut self.tasks) {
            drop(task);
            self.runtime.teardown(id);
        }
        while let Some(launch) = self.runtime.next_launch() {
            self.runtime.teardown(launch.id);
        }
        self.ready.lock().clear();

        let outcome = RunOutcome::Exited {
            exit_code,
            consumed_steps: self.consumed_steps,
        };
        info!(
            session = %self.runtime.session_id(),
            exit_code,
            consumed_steps = self.consumed_steps,
            "Root instance exited"
        );
        self.finished = Some(outcome);
        outcome
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("root", &self.root)
            .field("live", &self.tasks.len())
            .field("consumed_steps", &self.consumed_steps)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}
