//! Session-wide table of pipes and endpoint ownership.

use super::channel::{Channel, WriteAttempt};
use super::Side;
use crate::core::{Endpoint, InstanceId};
use crate::errors::{ResourceKind, SyscallError};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Notify;

/// The pipe table.
///
/// All methods are synchronous and never wait; suspension is layered on top by
/// the runtime using [`PipeRegistry::notifier`]. The registry is meant to sit
/// behind one lock so each operation is atomic.
#[derive(Debug)]
pub struct PipeRegistry {
    capacity: usize,
    max_endpoints: usize,
    next_endpoint: u64,
    open_endpoints: usize,
    /// Keyed by the first endpoint of each pipe.
    channels: BTreeMap<Endpoint, Channel>,
    /// Every endpoint ever allocated, closed ones included.
    index: BTreeMap<Endpoint, (Endpoint, Side)>,
}

impl PipeRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new(capacity: usize, max_endpoints: usize) -> Self {
        Self {
            capacity,
            max_endpoints,
            next_endpoint: 1,
            open_endpoints: 0,
            channels: BTreeMap::new(),
            index: BTreeMap::new(),
        }
    }

    /// Allocates a pipe owned by `owner` and returns its two endpoints.
    pub fn create(&mut self, owner: InstanceId) -> Result<(Endpoint, Endpoint), SyscallError> {
        let exhausted = || SyscallError::exhausted(ResourceKind::Endpoints, self.max_endpoints as u64);
        if self.open_endpoints + 2 > self.max_endpoints {
            return Err(exhausted());
        }
        let a = self.next_endpoint;
        let b = a.checked_add(1).ok_or_else(exhausted)?;
        let next = b.checked_add(1).ok_or_else(exhausted)?;
        let (Some(a), Some(b)) = (Endpoint::new(a), Endpoint::new(b)) else {
            return Err(exhausted());
        };

        self.next_endpoint = next;
        self.open_endpoints += 2;
        self.channels.insert(a, Channel::new(a, b, owner, self.capacity));
        self.index.insert(a, (a, Side::A));
        self.index.insert(b, (a, Side::B));
        Ok((a, b))
    }

    /// Resolves an endpoint the caller owns and has not closed.
    fn owned(&self, caller: InstanceId, endpoint: Endpoint) -> Result<(Endpoint, Side), SyscallError> {
        let invalid = || SyscallError::invalid_endpoint(endpoint);
        let &(key, side) = self.index.get(&endpoint).ok_or_else(invalid)?;
        let end = self.channels.get(&key).ok_or_else(invalid)?.end(side);
        if end.owner != caller || !end.open {
            return Err(invalid());
        }
        Ok((key, side))
    }

    fn channel_mut(&mut self, key: Endpoint, endpoint: Endpoint) -> Result<&mut Channel, SyscallError> {
        self.channels
            .get_mut(&key)
            .ok_or_else(|| SyscallError::invalid_endpoint(endpoint))
    }

    /// Returns the wake-up source for a reader suspended on `endpoint`.
    ///
    /// Fails like a read would if the caller cannot use the endpoint.
    pub fn read_notifier(&self, caller: InstanceId, endpoint: Endpoint) -> Result<Arc<Notify>, SyscallError> {
        self.notifier(caller, endpoint, false)
    }

    /// Returns the wake-up source for a writer suspended on `endpoint`.
    ///
    /// Only the peer's queue draining or either end closing signals it.
    pub fn write_notifier(&self, caller: InstanceId, endpoint: Endpoint) -> Result<Arc<Notify>, SyscallError> {
        self.notifier(caller, endpoint, true)
    }

    fn notifier(&self, caller: InstanceId, endpoint: Endpoint, peer: bool) -> Result<Arc<Notify>, SyscallError> {
        let (key, side) = self.owned(caller, endpoint)?;
        let side = if peer { side.peer() } else { side };
        self.channels
            .get(&key)
            .map(|channel| channel.inbound_notifier(side))
            .ok_or_else(|| SyscallError::invalid_endpoint(endpoint))
    }

    /// Reads buffered bytes without waiting.
    ///
    /// `Ok(None)` means the caller has to wait for the peer.
    pub fn try_read(
        &mut self,
        caller: InstanceId,
        endpoint: Endpoint,
        buf: &mut [u8],
    ) -> Result<Option<usize>, SyscallError> {
        let (key, side) = self.owned(caller, endpoint)?;
        Ok(self.channel_mut(key, endpoint)?.read(side, buf))
    }

    /// Writes as many bytes as currently fit without waiting.
    ///
    /// `Ok(None)` means the peer's queue is full.
    pub fn try_write(
        &mut self,
        caller: InstanceId,
        endpoint: Endpoint,
        data: &[u8],
    ) -> Result<Option<usize>, SyscallError> {
        let (key, side) = self.owned(caller, endpoint)?;
        match self.channel_mut(key, endpoint)?.write(side, data) {
            WriteAttempt::Accepted(n) => Ok(Some(n)),
            WriteAttempt::Full => Ok(None),
            WriteAttempt::PeerClosed => Err(SyscallError::BrokenChannel { endpoint }),
        }
    }

    /// Closes an endpoint. Closing an endpoint the caller already closed is a no-op.
    ///
    /// Returns true if this call closed it.
    pub fn close(&mut self, caller: InstanceId, endpoint: Endpoint) -> Result<bool, SyscallError> {
        let invalid = || SyscallError::invalid_endpoint(endpoint);
        let &(key, side) = self.index.get(&endpoint).ok_or_else(invalid)?;
        let channel = self.channels.get_mut(&key).ok_or_else(invalid)?;
        if channel.end(side).owner != caller {
            return Err(invalid());
        }
        let closed = channel.close(side);
        if closed {
            self.open_endpoints -= 1;
        }
        Ok(closed)
    }

    /// Closes every open endpoint owned by `owner`, in endpoint order.
    pub fn close_owned_by(&mut self, owner: InstanceId) -> Vec<Endpoint> {
        let owned = self.owned_by(owner);
        for endpoint in &owned {
            if let Some(&(key, side)) = self.index.get(endpoint) {
                if let Some(channel) = self.channels.get_mut(&key) {
                    if channel.close(side) {
                        self.open_endpoints -= 1;
                    }
                }
            }
        }
        owned
    }

    /// Returns the open endpoints owned by `owner`, in endpoint order.
    #[must_use]
    pub fn owned_by(&self, owner: InstanceId) -> Vec<Endpoint> {
        self.channels
            .values()
            .flat_map(|channel| channel.ends().iter())
            .filter(|end| end.open && end.owner == owner)
            .map(|end| end.endpoint)
            .collect()
    }

    /// Checks that `caller` may hand every endpoint in `endpoints` to a child.
    ///
    /// Nothing is mutated; the first failing endpoint is reported.
    pub fn check_transfer(&self, caller: InstanceId, endpoints: &[Endpoint]) -> Result<(), SyscallError> {
        let mut seen = BTreeSet::new();
        for &endpoint in endpoints {
            self.owned(caller, endpoint)?;
            if !seen.insert(endpoint) {
                // The first occurrence already moved it away from the caller.
                return Err(SyscallError::invalid_endpoint(endpoint));
            }
        }
        Ok(())
    }

    /// Moves ownership of `endpoints` to `to`.
    ///
    /// Callers run [`PipeRegistry::check_transfer`] under the same lock first.
    pub fn commit_transfer(&mut self, endpoints: &[Endpoint], to: InstanceId) {
        for endpoint in endpoints {
            if let Some(&(key, side)) = self.index.get(endpoint) {
                if let Some(channel) = self.channels.get_mut(&key) {
                    channel.end_mut(side).owner = to;
                }
            }
        }
    }

    /// Number of endpoints currently open.
    #[must_use]
    pub fn open_endpoints(&self) -> usize {
        self.open_endpoints
    }

    /// Pipes with at least one open end, in creation order.
    pub(crate) fn live_channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values().filter(|channel| channel.is_live())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const ROOT: InstanceId = InstanceId::ROOT;

    fn child() -> InstanceId {
        InstanceId::from_raw(1)
    }

    #[test]
    fn test_create_returns_distinct_nonzero_endpoints() {
        let mut registry = PipeRegistry::new(16, 8);
        let (a, b) = registry.create(ROOT).unwrap();
        let (c, d) = registry.create(ROOT).unwrap();

        let all = [a.get(), b.get(), c.get(), d.get()];
        assert!(all.iter().all(|v| *v != 0));
        assert_eq!(all.iter().collect::<BTreeSet<_>>().len(), 4);
        assert_eq!(registry.open_endpoints(), 4);
    }

    #[test]
    fn test_endpoint_budget() {
        let mut registry = PipeRegistry::new(16, 4);
        registry.create(ROOT).unwrap();
        registry.create(ROOT).unwrap();

        let err = registry.create(ROOT).unwrap_err();
        assert_eq!(err, SyscallError::exhausted(ResourceKind::Endpoints, 4));

        // Closing frees budget, but values are never reused.
        let owned = registry.owned_by(ROOT);
        registry.close(ROOT, owned[0]).unwrap();
        registry.close(ROOT, owned[1]).unwrap();
        let (a, _) = registry.create(ROOT).unwrap();
        assert_eq!(a.get(), 5);
    }

    #[test]
    fn test_read_write_require_ownership() {
        let mut registry = PipeRegistry::new(16, 8);
        let (a, b) = registry.create(ROOT).unwrap();

        let err = registry.try_write(child(), a, b"x").unwrap_err();
        assert_eq!(err, SyscallError::invalid_endpoint(a));

        let mut buf = [0u8; 4];
        assert!(registry.try_read(child(), b, &mut buf).is_err());
        assert!(registry.try_read(ROOT, Endpoint::new(99).unwrap(), &mut buf).is_err());
    }

    #[test]
    fn test_close_is_idempotent_and_blocks_reuse() {
        let mut registry = PipeRegistry::new(16, 8);
        let (a, b) = registry.create(ROOT).unwrap();

        assert!(registry.close(ROOT, a).unwrap());
        assert!(!registry.close(ROOT, a).unwrap());
        assert_eq!(registry.open_endpoints(), 1);

        assert_eq!(
            registry.try_write(ROOT, a, b"x").unwrap_err(),
            SyscallError::invalid_endpoint(a)
        );
        assert_eq!(
            registry.try_write(ROOT, b, b"x").unwrap_err(),
            SyscallError::BrokenChannel { endpoint: b }
        );
    }

    #[test]
    fn test_transfer_is_all_or_nothing() {
        let mut registry = PipeRegistry::new(16, 8);
        let (a, b) = registry.create(ROOT).unwrap();
        let (c, _) = registry.create(child()).unwrap();

        let err = registry.check_transfer(ROOT, &[a, c, b]).unwrap_err();
        assert_eq!(err, SyscallError::invalid_endpoint(c));
        assert_eq!(registry.owned_by(ROOT), vec![a, b]);

        assert!(registry.check_transfer(ROOT, &[a, a]).is_err());

        registry.check_transfer(ROOT, &[b]).unwrap();
        registry.commit_transfer(&[b], child());
        assert_eq!(registry.owned_by(ROOT), vec![a]);
        assert!(registry.try_write(ROOT, b, b"x").is_err());
        assert_eq!(registry.try_write(child(), b, b"x").unwrap(), Some(1));
    }

    #[test]
    fn test_close_owned_by() {
        let mut registry = PipeRegistry::new(16, 8);
        let (a, b) = registry.create(ROOT).unwrap();
        registry.commit_transfer(&[b], child());

        assert_eq!(registry.close_owned_by(child()), vec![b]);
        assert_eq!(registry.open_endpoints(), 1);

        let mut buf = [0u8; 4];
        assert_eq!(registry.try_read(ROOT, a, &mut buf).unwrap(), Some(0));
        assert_eq!(registry.live_channels().count(), 1);

        registry.close(ROOT, a).unwrap();
        assert_eq!(registry.live_channels().count(), 0);
    }
}
