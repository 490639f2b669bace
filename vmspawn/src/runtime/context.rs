//! The syscall surface of one instance.

use super::Runtime;
use crate::core::{Endpoint, InstanceId};
use crate::errors::SyscallError;
use crate::events;
use crate::program::{Argv, ProgramDescriptor};
use std::sync::Arc;
use tracing::{debug, trace};

/// Handle an instance uses to reach the runtime.
///
/// Every method acts on behalf of [`InstanceContext::instance_id`]. The
/// blocking calls (`read`, `write`, `join`) are suspension points: they return
/// `Pending` to the scheduler and are woken by the peer that can unblock them.
#[derive(Debug, Clone)]
pub struct InstanceContext {
    id: InstanceId,
    runtime: Arc<Runtime>,
    inherited: Arc<[Endpoint]>,
}

impl InstanceContext {
    pub(crate) fn new(id: InstanceId, runtime: Arc<Runtime>, inherited: Vec<Endpoint>) -> Self {
        Self {
            id,
            runtime,
            inherited: inherited.into(),
        }
    }

    /// Identity of the calling instance. Never fails.
    #[must_use]
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    /// Endpoints handed over by the parent at spawn, in the order given.
    #[must_use]
    pub fn inherited_endpoints(&self) -> &[Endpoint] {
        &self.inherited
    }

    /// The runtime this instance belongs to.
    #[must_use]
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Spawns a child running `descriptor` and hands it `endpoints`.
    ///
    /// Returns as soon as the child is registered; the child runs on a later
    /// scheduler step. On error nothing changed: the caller still owns every
    /// endpoint.
    pub fn spawn(
        &self,
        descriptor: &ProgramDescriptor,
        argv: Argv,
        endpoints: &[Endpoint],
    ) -> Result<InstanceId, SyscallError> {
        self.runtime.spawn(self.id, descriptor, argv, endpoints)
    }

    /// Waits for `target` to exit and returns its exit code.
    ///
    /// Joining an instance that already exited returns at once, and any number
    /// of instances may join the same target.
    pub async fn join(&self, target: InstanceId) -> Result<i8, SyscallError> {
        if target == self.id {
            return Err(SyscallError::invalid_argument("an instance cannot join itself"));
        }
        let mut exit = {
            let instances = self.runtime.instances.read();
            instances
                .lookup(target)
                .ok_or_else(|| SyscallError::invalid_instance(target))?
                .subscribe()
        };

        let exit_code = {
            let observed = exit.wait_for(Option::is_some).await;
            observed.ok().and_then(|code| *code)
        };
        let exit_code = exit_code.ok_or_else(|| SyscallError::invalid_instance(target))?;

        debug!(instance = %self.id, target = %target, exit_code, "Joined instance");
        self.runtime.events.emit(
            events::INSTANCE_JOINED,
            Some(serde_json::json!({
                "instance": self.id.get(),
                "target": target.get(),
                "exit_code": exit_code,
            })),
        );
        Ok(exit_code)
    }

    /// Creates a pipe owned by the caller.
    pub fn pipe(&self) -> Result<(Endpoint, Endpoint), SyscallError> {
        let (a, b) = self.runtime.pipes.lock().create(self.id)?;
        debug!(instance = %self.id, a = %a, b = %b, "Created pipe");
        self.runtime.events.emit(
            events::PIPE_CREATED,
            Some(serde_json::json!({"instance": self.id.get(), "endpoints": [a.get(), b.get()]})),
        );
        Ok((a, b))
    }

    /// Reads at least one byte, or returns 0 at end of stream.
    ///
    /// Suspends while nothing is buffered and the peer is still open. Never
    /// waits to fill `buf`.
    pub async fn read(&self, endpoint: Endpoint, buf: &mut [u8]) -> Result<usize, SyscallError> {
        loop {
            let notify = self.runtime.pipes.lock().read_notifier(self.id, endpoint)?;
            let changed = notify.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let attempt = self.runtime.pipes.lock().try_read(self.id, endpoint, buf)?;
            if let Some(n) = attempt {
                trace!(instance = %self.id, endpoint = %endpoint, n, "Read");
                return Ok(n);
            }
            changed.await;
        }
    }

    /// Writes at least one byte of `data`.
    ///
    /// Suspends while the peer's queue is full. Returns how many bytes were
    /// accepted, which may be fewer than offered.
    pub async fn write(&self, endpoint: Endpoint, data: &[u8]) -> Result<usize, SyscallError> {
        loop {
            let notify = self.runtime.pipes.lock().write_notifier(self.id, endpoint)?;
            let changed = notify.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            let attempt = self.runtime.pipes.lock().try_write(self.id, endpoint, data)?;
            if let Some(n) = attempt {
                trace!(instance = %self.id, endpoint = %endpoint, n, "Wrote");
                return Ok(n);
            }
            changed.await;
        }
    }

    /// Closes an endpoint. Closing it again is a no-op.
    pub fn close(&self, endpoint: Endpoint) -> Result<(), SyscallError> {
        let closed = self.runtime.pipes.lock().close(self.id, endpoint)?;
        if closed {
            debug!(instance = %self.id, endpoint = %endpoint, "Closed endpoint");
            self.runtime.emit_closed(self.id, &[endpoint]);
        }
        Ok(())
    }

    /// Reads until `buf` is full or the stream ends.
    ///
    /// Returns the number of bytes read; less than `buf.len()` only at end of
    /// stream.
    pub async fn read_exact(&self, endpoint: Endpoint, buf: &mut [u8]) -> Result<usize, SyscallError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read(endpoint, &mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }

    /// Writes every byte of `data`, suspending as often as needed.
    pub async fn write_all(&self, endpoint: Endpoint, data: &[u8]) -> Result<(), SyscallError> {
        let mut written = 0;
        while written < data.len() {
            written += self.write(endpoint, &data[written..]).await?;
        }
        Ok(())
    }

    /// Reads until the peer closes and returns everything read.
    pub async fn read_to_end(&self, endpoint: Endpoint) -> Result<Vec<u8>, SyscallError> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            let n = self.read(endpoint, &mut chunk).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::program::{ProgramDescriptor, ProgramRegistry};
    use crate::testing::FnProgram;
    use tokio_test::{assert_pending, assert_ready, assert_ready_eq, task};

    fn root_context(capacity: usize) -> InstanceContext {
        let registry = ProgramRegistry::new();
        registry.register(0, 0, Arc::new(FnProgram::new(|_ctx, _argv| async { Ok(0) })));
        let config = SchedulerConfig::new().with_pipe_capacity(capacity);
        let runtime = Runtime::with_defaults(config, Arc::new(registry)).unwrap();
        let root = runtime.boot(&ProgramDescriptor::new(0, 0), Vec::new()).unwrap();
        InstanceContext::new(root, runtime, Vec::new())
    }

    fn child_context(parent: &InstanceContext, endpoints: &[Endpoint]) -> InstanceContext {
        let id = parent
            .spawn(&ProgramDescriptor::new(0, 0), Vec::new(), endpoints)
            .unwrap();
        InstanceContext::new(id, Arc::clone(parent.runtime()), endpoints.to_vec())
    }

    #[test]
    fn test_read_suspends_until_peer_writes() {
        let ctx = root_context(16);
        let (a, b) = ctx.pipe().unwrap();

        let mut buf = [0u8; 8];
        let mut read = task::spawn(ctx.read(b, &mut buf));
        assert_pending!(read.poll());

        let mut write = task::spawn(ctx.write(a, b"ok"));
        assert_ready_eq!(write.poll(), Ok(2));

        assert!(read.is_woken());
        assert_ready_eq!(read.poll(), Ok(2));
        drop(read);
        assert_eq!(&buf[..2], b"ok");
    }

    #[test]
    fn test_write_suspends_until_reader_drains() {
        let ctx = root_context(4);
        let (a, b) = ctx.pipe().unwrap();

        let mut first = task::spawn(ctx.write(a, b"abcdef"));
        assert_ready_eq!(first.poll(), Ok(4));

        let mut second = task::spawn(ctx.write(a, b"ef"));
        assert_pending!(second.poll());

        let mut buf = [0u8; 3];
        let mut read = task::spawn(ctx.read(b, &mut buf));
        assert_ready_eq!(read.poll(), Ok(3));

        assert!(second.is_woken());
        assert_ready_eq!(second.poll(), Ok(2));
    }

    #[test]
    fn test_close_wakes_reader_with_eof() {
        let ctx = root_context(16);
        let (a, b) = ctx.pipe().unwrap();

        let mut buf = [0u8; 8];
        let mut read = task::spawn(ctx.read(b, &mut buf));
        assert_pending!(read.poll());

        ctx.close(a).unwrap();
        ctx.close(a).unwrap();
        assert!(read.is_woken());
        assert_ready_eq!(read.poll(), Ok(0));
    }

    #[test]
    fn test_close_wakes_writer_with_broken_channel() {
        let ctx = root_context(2);
        let (a, b) = ctx.pipe().unwrap();

        let mut first = task::spawn(ctx.write(a, b"xy"));
        assert_ready_eq!(first.poll(), Ok(2));
        let mut blocked = task::spawn(ctx.write(a, b"z"));
        assert_pending!(blocked.poll());

        ctx.close(b).unwrap();
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Err(SyscallError::BrokenChannel { endpoint: a }));
    }

    #[test]
    fn test_traffic_in_other_direction_does_not_wake_writer() {
        let ctx = root_context(2);
        let (a, b) = ctx.pipe().unwrap();

        assert_ready_eq!(task::spawn(ctx.write(a, b"xy")).poll(), Ok(2));
        let mut blocked = task::spawn(ctx.write(a, b"z"));
        assert_pending!(blocked.poll());

        assert_ready_eq!(task::spawn(ctx.write(b, b"q")).poll(), Ok(1));
        let mut buf = [0u8; 1];
        assert_ready_eq!(task::spawn(ctx.read(a, &mut buf)).poll(), Ok(1));
        assert!(!blocked.is_woken());

        assert_ready_eq!(task::spawn(ctx.read(b, &mut buf)).poll(), Ok(1));
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Ok(1));
    }

    #[test]
    fn test_bytes_written_on_an_end_are_read_from_its_peer() {
        let ctx = root_context(16);
        let (a, b) = ctx.pipe().unwrap();

        assert_ready_eq!(task::spawn(ctx.write(a, b"x")).poll(), Ok(1));

        // The writer's own end never sees its bytes.
        let mut buf = [0u8; 4];
        let mut own = task::spawn(ctx.read(a, &mut buf));
        assert_pending!(own.poll());
        drop(own);

        let mut peer_buf = [0u8; 4];
        assert_ready_eq!(task::spawn(ctx.read(b, &mut peer_buf)).poll(), Ok(1));
        assert_eq!(peer_buf[0], b'x');
    }

    #[test]
    fn test_empty_buffers_return_immediately() {
        let ctx = root_context(16);
        let (a, b) = ctx.pipe().unwrap();

        let mut empty: [u8; 0] = [];
        assert_ready_eq!(task::spawn(ctx.read(b, &mut empty)).poll(), Ok(0));
        assert_ready_eq!(task::spawn(ctx.write(a, b"")).poll(), Ok(0));
    }

    #[test]
    fn test_join_waits_for_exit() {
        let ctx = root_context(16);
        let child = child_context(&ctx, &[]);

        let mut join = task::spawn(ctx.join(child.instance_id()));
        assert_pending!(join.poll());

        ctx.runtime().exit(child.instance_id(), Ok(3)).unwrap();
        assert!(join.is_woken());
        assert_ready_eq!(join.poll(), Ok(3));

        // Joining again after the exit is immediate.
        assert_ready_eq!(task::spawn(ctx.join(child.instance_id())).poll(), Ok(3));
    }

    #[test]
    fn test_concurrent_joiners_see_same_code() {
        let ctx = root_context(16);
        let child = child_context(&ctx, &[]);
        let sibling = child_context(&ctx, &[]);

        let mut from_root = task::spawn(ctx.join(child.instance_id()));
        let mut from_sibling = task::spawn(sibling.join(child.instance_id()));
        assert_pending!(from_root.poll());
        assert_pending!(from_sibling.poll());

        ctx.runtime().exit(child.instance_id(), Ok(-7)).unwrap();
        assert_ready_eq!(from_root.poll(), Ok(-7));
        assert_ready_eq!(from_sibling.poll(), Ok(-7));
    }

    #[test]
    fn test_join_rejects_self_and_unknown() {
        let ctx = root_context(16);

        let err = assert_ready!(task::spawn(ctx.join(ctx.instance_id())).poll()).unwrap_err();
        assert_eq!(err.code(), crate::errors::WAIT_FAILURE);

        let unknown = InstanceId::from_raw(42);
        assert_ready_eq!(
            task::spawn(ctx.join(unknown)).poll(),
            Err(SyscallError::invalid_instance(unknown))
        );
    }

    #[test]
    fn test_transferred_endpoint_is_invalid_for_parent() {
        let ctx = root_context(16);
        let (a, b) = ctx.pipe().unwrap();
        let child = child_context(&ctx, &[b]);

        assert_eq!(child.inherited_endpoints(), &[b]);
        assert_ready_eq!(
            task::spawn(ctx.write(b, b"x")).poll(),
            Err(SyscallError::invalid_endpoint(b))
        );
        assert_ready_eq!(task::spawn(child.write(b, b"x")).poll(), Ok(1));

        let mut buf = [0u8; 1];
        assert_ready_eq!(task::spawn(ctx.read(a, &mut buf)).poll(), Ok(1));
    }

    #[test]
    fn test_helpers_loop_over_partial_transfers() {
        let ctx = root_context(3);
        let (a, b) = ctx.pipe().unwrap();
        let writer = child_context(&ctx, &[a]);

        let mut write_all = task::spawn(writer.write_all(a, b"abcdefg"));
        assert_pending!(write_all.poll());

        let mut buf = [0u8; 5];
        let mut read_exact = task::spawn(ctx.read_exact(b, &mut buf));
        assert_pending!(read_exact.poll());
        assert_pending!(write_all.poll());
        assert_ready_eq!(read_exact.poll(), Ok(5));
        drop(read_exact);
        assert_eq!(&buf, b"abcde");

        assert_ready_eq!(write_all.poll(), Ok(()));
        writer.close(a).unwrap();
        assert_ready_eq!(task::spawn(ctx.read_to_end(b)).poll(), Ok(b"fg".to_vec()));
    }
}
