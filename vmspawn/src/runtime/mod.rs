//! The coordination service shared by every instance of a session.
//!
//! [`Runtime`] owns the pipe registry and the instance table and serves the
//! spawn, exit and join bookkeeping. Instances reach it through their
//! [`InstanceContext`]; the scheduler drains its launch queue.
//!
//! Lock order is pipes before instances.

mod context;

pub use context::InstanceContext;

use crate::config::SchedulerConfig;
use crate::core::{Endpoint, InstanceId};
use crate::errors::{InvariantViolation, SchedulerError, SyscallError};
use crate::events::{self, EventSink, NoOpEventSink};
use crate::instances::{AllocateError, InstanceTable};
use crate::pipes::{ChannelEnd, PipeRegistry};
use crate::program::{Argv, Program, ProgramDescriptor, ProgramFault, ProgramLoader, FAULT_EXIT_CODE};
use crate::snapshot::{ChannelSnapshot, EndpointSnapshot, InstanceSnapshot, RuntimeSnapshot};
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A spawned instance waiting to be handed to the scheduler.
pub(crate) struct Launch {
    pub(crate) id: InstanceId,
    pub(crate) program: Arc<dyn Program>,
    pub(crate) argv: Argv,
    pub(crate) endpoints: Vec<Endpoint>,
}

impl std::fmt::Debug for Launch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launch")
            .field("id", &self.id)
            .field("argv", &self.argv.len())
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

/// Session-wide tables and the services built on them.
pub struct Runtime {
    session_id: Uuid,
    config: SchedulerConfig,
    loader: Arc<dyn ProgramLoader>,
    pipes: Mutex<PipeRegistry>,
    instances: RwLock<InstanceTable>,
    launches: Mutex<VecDeque<Launch>>,
    events: Arc<dyn EventSink>,
    fatal: Mutex<Option<InvariantViolation>>,
}

impl Runtime {
    /// Creates a runtime with empty tables.
    pub fn new(
        config: SchedulerConfig,
        loader: Arc<dyn ProgramLoader>,
        events: Arc<dyn EventSink>,
    ) -> Result<Arc<Self>, SchedulerError> {
        config.validate()?;
        Ok(Arc::new(Self {
            session_id: Uuid::new_v4(),
            pipes: Mutex::new(PipeRegistry::new(config.pipe_capacity, config.max_endpoints)),
            instances: RwLock::new(InstanceTable::new(config.max_instances, config.max_depth)),
            launches: Mutex::new(VecDeque::new()),
            config,
            loader,
            events,
            fatal: Mutex::new(None),
        }))
    }

    /// Creates a runtime that discards events.
    pub fn with_defaults(
        config: SchedulerConfig,
        loader: Arc<dyn ProgramLoader>,
    ) -> Result<Arc<Self>, SchedulerError> {
        Self::new(config, loader, Arc::new(NoOpEventSink))
    }

    /// Session identifier.
    #[must_use]
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Configuration the session was created with.
    #[must_use]
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Registers and queues the root instance.
    ///
    /// Only [`crate::scheduler::Scheduler::boot`] calls this, so the scheduler
    /// always knows which instance is the root.
    pub(crate) fn boot(&self, descriptor: &ProgramDescriptor, argv: Argv) -> Result<InstanceId, SchedulerError> {
        let program = self.loader.resolve(descriptor)?;
        let id = self.instances.write().allocate_root()?;
        self.launches.lock().push_back(Launch {
            id,
            program,
            argv,
            endpoints: Vec::new(),
        });
        info!(session = %self.session_id, instance = %id, %descriptor, "Booted root instance");
        self.emit_spawned(id, None, &[]);
        Ok(id)
    }

    /// Creates a child of `caller` and queues it for launch.
    ///
    /// Every check runs before anything is mutated, so a failed spawn leaves
    /// the caller's endpoints and the instance table untouched.
    pub(crate) fn spawn(
        &self,
        caller: InstanceId,
        descriptor: &ProgramDescriptor,
        argv: Argv,
        endpoints: &[Endpoint],
    ) -> Result<InstanceId, SyscallError> {
        let program = self.loader.resolve(descriptor)?;

        let id = {
            let mut pipes = self.pipes.lock();
            pipes.check_transfer(caller, endpoints)?;
            let allocated = self.instances.write().allocate(caller);
            let id = match allocated {
                Ok(id) => id,
                Err(AllocateError::Denied(err)) => return Err(err),
                Err(AllocateError::Fatal(violation)) => {
                    let err = SyscallError::invalid_argument(violation.to_string());
                    self.record_fatal(violation);
                    return Err(err);
                }
            };
            pipes.commit_transfer(endpoints, id);
            id
        };

        self.launches.lock().push_back(Launch {
            id,
            program,
            argv,
            endpoints: endpoints.to_vec(),
        });
        debug!(parent = %caller, instance = %id, %descriptor, endpoints = endpoints.len(), "Spawned instance");
        self.emit_spawned(id, Some(caller), endpoints);
        Ok(id)
    }

    /// Records the end of an instance and closes everything it still owns.
    pub(crate) fn exit(&self, id: InstanceId, result: Result<i8, ProgramFault>) -> Result<i8, InvariantViolation> {
        let (exit_code, fault) = match result {
            Ok(code) => (code, None),
            Err(fault) => (FAULT_EXIT_CODE, Some(fault.message)),
        };

        let closed = {
            let mut pipes = self.pipes.lock();
            self.instances.write().mark_exited(id, exit_code, fault.clone())?;
            pipes.close_owned_by(id)
        };

        match &fault {
            Some(message) => info!(instance = %id, exit_code, fault = %message, "Instance faulted"),
            None => debug!(instance = %id, exit_code, "Instance exited"),
        }
        self.events.emit(
            events::INSTANCE_EXITED,
            Some(serde_json::json!({
                "instance": id.get(),
                "exit_code": exit_code,
                "fault": fault,
            })),
        );
        self.emit_closed(id, &closed);
        Ok(exit_code)
    }

    /// Releases the endpoints of an instance that was dropped without exiting.
    ///
    /// The record stays Running.
    pub(crate) fn teardown(&self, id: InstanceId) {
        let closed = self.pipes.lock().close_owned_by(id);
        debug!(instance = %id, closed = closed.len(), "Tore down instance");
        self.emit_closed(id, &closed);
    }

    pub(crate) fn next_launch(&self) -> Option<Launch> {
        self.launches.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn has_pending_launches(&self) -> bool {
        !self.launches.lock().is_empty()
    }

    /// Remembers the first invariant violation of the session.
    pub(crate) fn record_fatal(&self, violation: InvariantViolation) {
        error!(session = %self.session_id, %violation, "Runtime invariant violated");
        self.fatal.lock().get_or_insert(violation);
    }

    pub(crate) fn fatal(&self) -> Option<InvariantViolation> {
        self.fatal.lock().clone()
    }

    /// Exit code of an instance, if it has exited.
    #[must_use]
    pub fn exit_code(&self, id: InstanceId) -> Option<i8> {
        self.instances.read().lookup(id).and_then(|record| record.exit_code())
    }

    /// Direct children of an instance, in identity order.
    #[must_use]
    pub fn children_of(&self, parent: InstanceId) -> Vec<InstanceId> {
        self.instances.read().children_of(parent)
    }

    /// Number of instances still running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.instances.read().running_count()
    }

    /// Number of endpoints currently open.
    #[must_use]
    pub fn open_endpoints(&self) -> usize {
        self.pipes.lock().open_endpoints()
    }

    /// Captures the current tables.
    #[must_use]
    pub fn snapshot(&self, consumed_steps: u64) -> RuntimeSnapshot {
        let pipes = self.pipes.lock();
        let instances = self.instances.read();

        let instance_snapshots = instances
            .records()
            .map(|record| InstanceSnapshot {
                id: record.id,
                parent: record.parent,
                depth: record.depth,
                state: record.state,
                fault: record.fault.clone(),
            })
            .collect();
        let channels = pipes
            .live_channels()
            .map(|channel| {
                let [a, b] = channel.ends();
                ChannelSnapshot {
                    ends: [endpoint_snapshot(a), endpoint_snapshot(b)],
                }
            })
            .collect();

        RuntimeSnapshot {
            session_id: self.session_id,
            captured_at: chrono::Utc::now(),
            consumed_steps,
            open_endpoints: pipes.open_endpoints(),
            instances: instance_snapshots,
            channels,
        }
    }

    fn emit_spawned(&self, id: InstanceId, parent: Option<InstanceId>, endpoints: &[Endpoint]) {
        self.events.emit(
            events::INSTANCE_SPAWNED,
            Some(serde_json::json!({
                "instance": id.get(),
                "parent": parent.map(InstanceId::get),
                "endpoints": endpoints.iter().map(|ep| ep.get()).collect::<Vec<_>>(),
            })),
        );
    }

    fn emit_closed(&self, owner: InstanceId, endpoints: &[Endpoint]) {
        for endpoint in endpoints {
            self.events.emit(
                events::PIPE_CLOSED,
                Some(serde_json::json!({"instance": owner.get(), "endpoint": endpoint.get()})),
            );
        }
    }
}

fn endpoint_snapshot(end: &ChannelEnd) -> EndpointSnapshot {
    EndpointSnapshot {
        endpoint: end.endpoint,
        owner: end.owner,
        open: end.open,
        buffered: EndpointSnapshot::encode(end.inbound.iter().copied()),
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("session_id", &self.session_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::program::{MockProgramLoader, ProgramRegistry};
    use crate::testing::FnProgram;

    fn registry() -> Arc<ProgramRegistry> {
        let registry = ProgramRegistry::new();
        registry.register(0, 0, Arc::new(FnProgram::new(|_ctx, _argv| async { Ok(0) })));
        Arc::new(registry)
    }

    #[test]
    fn test_spawn_failure_leaves_no_trace() {
        let mut loader = MockProgramLoader::new();
        loader
            .expect_resolve()
            .returning(|d| Err(SyscallError::invalid_program(d.index, d.source, "missing")));
        let runtime = Runtime::with_defaults(SchedulerConfig::new(), Arc::new(loader)).unwrap();
        runtime.instances.write().allocate_root().unwrap();
        let (a, _) = runtime.pipes.lock().create(InstanceId::ROOT).unwrap();

        let err = runtime
            .spawn(InstanceId::ROOT, &ProgramDescriptor::new(7, 1), Vec::new(), &[a])
            .unwrap_err();

        assert_eq!(err.kind(), "invalid_program");
        assert_eq!(runtime.children_of(InstanceId::ROOT), Vec::new());
        assert_eq!(runtime.pipes.lock().owned_by(InstanceId::ROOT).len(), 2);
        assert!(!runtime.has_pending_launches());
    }

    #[test]
    fn test_spawn_budget_is_checked_before_transfer() {
        let config = SchedulerConfig::new().with_max_instances(1);
        let runtime = Runtime::with_defaults(config, registry()).unwrap();
        runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        let (a, b) = runtime.pipes.lock().create(InstanceId::ROOT).unwrap();

        let err = runtime
            .spawn(InstanceId::ROOT, &ProgramDescriptor::new(0, 0), Vec::new(), &[b])
            .unwrap_err();

        assert_eq!(err.code(), crate::errors::MAX_VMS_SPAWNED);
        assert_eq!(runtime.pipes.lock().owned_by(InstanceId::ROOT), vec![a, b]);
    }

    #[test]
    fn test_spawn_rejects_closed_endpoint() {
        let runtime = Runtime::with_defaults(SchedulerConfig::new(), registry()).unwrap();
        let root = runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        let (a, b) = runtime.pipes.lock().create(root).unwrap();
        runtime.pipes.lock().close(root, a).unwrap();

        let err = runtime
            .spawn(root, &ProgramDescriptor::new(0, 0), Vec::new(), &[b, a])
            .unwrap_err();

        assert_eq!(err, SyscallError::invalid_endpoint(a));
        assert_eq!(runtime.children_of(root), Vec::new());
        assert_eq!(runtime.running_count(), 1);
        assert_eq!(runtime.pipes.lock().owned_by(root), vec![b]);
    }

    #[test]
    fn test_spawn_depth_budget() {
        let config = SchedulerConfig::new().with_max_depth(1);
        let runtime = Runtime::with_defaults(config, registry()).unwrap();
        let root = runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        let (_, b) = runtime.pipes.lock().create(root).unwrap();
        let child = runtime
            .spawn(root, &ProgramDescriptor::new(0, 0), Vec::new(), &[b])
            .unwrap();

        let err = runtime
            .spawn(child, &ProgramDescriptor::new(0, 0), Vec::new(), &[b])
            .unwrap_err();

        assert_eq!(err, SyscallError::exhausted(crate::errors::ResourceKind::Depth, 1));
        assert_eq!(err.code(), crate::errors::MAX_VMS_SPAWNED);
        assert_eq!(runtime.children_of(child), Vec::new());
        assert_eq!(runtime.pipes.lock().owned_by(child), vec![b]);
    }

    #[test]
    fn test_exit_closes_owned_endpoints_and_emits() {
        let sink = Arc::new(CollectingEventSink::new());
        let runtime = Runtime::new(SchedulerConfig::new(), registry(), sink.clone()).unwrap();
        let root = runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        let (_, b) = runtime.pipes.lock().create(root).unwrap();
        let child = runtime
            .spawn(root, &ProgramDescriptor::new(0, 0), Vec::new(), &[b])
            .unwrap();

        assert_eq!(runtime.exit(child, Err(ProgramFault::new("trap"))), Ok(FAULT_EXIT_CODE));
        assert_eq!(runtime.exit_code(child), Some(FAULT_EXIT_CODE));
        assert_eq!(runtime.open_endpoints(), 1);
        assert_eq!(
            runtime.exit(child, Ok(0)),
            Err(InvariantViolation::DoubleExit { instance: child })
        );

        assert_eq!(sink.events_of_type("instance.spawned").len(), 2);
        assert_eq!(sink.events_of_type("pipe.closed").len(), 1);
        let exited = sink.events_of_type("instance.exited");
        assert_eq!(exited[0].1.as_ref().unwrap()["fault"], "trap");
    }

    #[test]
    fn test_snapshot_lists_buffered_bytes() {
        let runtime = Runtime::with_defaults(SchedulerConfig::new(), registry()).unwrap();
        let root = runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        let (a, b) = runtime.pipes.lock().create(root).unwrap();
        runtime.pipes.lock().try_write(root, a, b"hi").unwrap();

        let snapshot = runtime.snapshot(3);
        assert_eq!(snapshot.consumed_steps, 3);
        assert_eq!(snapshot.instances.len(), 1);
        assert_eq!(snapshot.channels.len(), 1);
        let end_b = &snapshot.channels[0].ends[1];
        assert_eq!(end_b.endpoint, b);
        assert_eq!(end_b.buffered_bytes().unwrap(), b"hi");
    }

    #[test]
    fn test_first_fatal_wins() {
        let runtime = Runtime::with_defaults(SchedulerConfig::new(), registry()).unwrap();
        runtime.record_fatal(InvariantViolation::DuplicateRoot);
        runtime.record_fatal(InvariantViolation::UnknownInstance {
            instance: InstanceId::from_raw(4),
        });
        assert_eq!(runtime.fatal(), Some(InvariantViolation::DuplicateRoot));
    }
}
