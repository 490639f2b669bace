//! One pipe: two ends, each with its own inbound queue.

use crate::core::{Endpoint, InstanceId};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Which end of a pipe an endpoint refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The first endpoint returned by pipe creation.
    A,
    /// The second endpoint returned by pipe creation.
    B,
}

impl Side {
    const fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::B => 1,
        }
    }

    /// Returns the opposite end.
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

#[derive(Debug)]
pub(crate) struct ChannelEnd {
    pub(crate) endpoint: Endpoint,
    pub(crate) owner: InstanceId,
    pub(crate) open: bool,
    /// Bytes written by the peer, waiting to be read on this end.
    pub(crate) inbound: VecDeque<u8>,
    /// Signalled when `inbound` fills or drains, and when either end closes.
    changed: Arc<Notify>,
}

impl ChannelEnd {
    fn new(endpoint: Endpoint, owner: InstanceId) -> Self {
        Self {
            endpoint,
            owner,
            open: true,
            inbound: VecDeque::new(),
            changed: Arc::new(Notify::new()),
        }
    }
}

/// Outcome of a write attempt that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WriteAttempt {
    Accepted(usize),
    Full,
    PeerClosed,
}

#[derive(Debug)]
pub(crate) struct Channel {
    ends: [ChannelEnd; 2],
    capacity: usize,
}

impl Channel {
    pub(crate) fn new(a: Endpoint, b: Endpoint, owner: InstanceId, capacity: usize) -> Self {
        Self {
            ends: [ChannelEnd::new(a, owner), ChannelEnd::new(b, owner)],
            capacity,
        }
    }

    pub(crate) fn end(&self, side: Side) -> &ChannelEnd {
        &self.ends[side.index()]
    }

    pub(crate) fn end_mut(&mut self, side: Side) -> &mut ChannelEnd {
        &mut self.ends[side.index()]
    }

    pub(crate) fn ends(&self) -> &[ChannelEnd; 2] {
        &self.ends
    }

    /// Wake-up source for readers of `side` and for writers on its peer.
    pub(crate) fn inbound_notifier(&self, side: Side) -> Arc<Notify> {
        Arc::clone(&self.end(side).changed)
    }

    pub(crate) fn is_live(&self) -> bool {
        self.ends.iter().any(|end| end.open)
    }

    /// Moves buffered bytes for `side` into `buf`.
    ///
    /// Returns `None` when nothing is buffered and the peer may still write.
    /// `Some(0)` is end of stream.
    pub(crate) fn read(&mut self, side: Side, buf: &mut [u8]) -> Option<usize> {
        if buf.is_empty() {
            return Some(0);
        }
        let peer_open = self.end(side.peer()).open;
        let inbound = &mut self.end_mut(side).inbound;
        if inbound.is_empty() {
            return if peer_open { None } else { Some(0) };
        }

        let n = buf.len().min(inbound.len());
        for (slot, byte) in buf.iter_mut().zip(inbound.drain(..n)) {
            *slot = byte;
        }
        self.end(side).changed.notify_waiters();
        Some(n)
    }

    /// Queues as much of `data` as fits into the peer's inbound queue.
    pub(crate) fn write(&mut self, side: Side, data: &[u8]) -> WriteAttempt {
        let capacity = self.capacity;
        let peer = self.end_mut(side.peer());
        if !peer.open {
            return WriteAttempt::PeerClosed;
        }
        if data.is_empty() {
            return WriteAttempt::Accepted(0);
        }

        let free = capacity.saturating_sub(peer.inbound.len());
        if free == 0 {
            return WriteAttempt::Full;
        }
        let n = free.min(data.len());
        peer.inbound.extend(&data[..n]);
        peer.changed.notify_waiters();
        WriteAttempt::Accepted(n)
    }

    /// Closes one end. Returns false if it was already closed.
    pub(crate) fn close(&mut self, side: Side) -> bool {
        let end = self.end_mut(side);
        if !end.open {
            return false;
        }
        end.open = false;
        // Nobody can read these bytes anymore.
        end.inbound.clear();
        if !self.is_live() {
            self.end_mut(side.peer()).inbound.clear();
        }
        for end in &self.ends {
            end.changed.notify_waiters();
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> Channel {
        Channel::new(
            Endpoint::new(1).unwrap(),
            Endpoint::new(2).unwrap(),
            InstanceId::ROOT,
            capacity,
        )
    }

    #[test]
    fn test_write_then_read_in_order() {
        let mut ch = channel(16);
        assert_eq!(ch.write(Side::A, b"hello"), WriteAttempt::Accepted(5));

        let mut buf = [0u8; 3];
        assert_eq!(ch.read(Side::B, &mut buf), Some(3));
        assert_eq!(&buf, b"hel");
        assert_eq!(ch.read(Side::B, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"lo");
        assert_eq!(ch.read(Side::B, &mut buf), None);
    }

    #[test]
    fn test_directions_are_independent() {
        let mut ch = channel(16);
        ch.write(Side::A, b"ab");
        ch.write(Side::B, b"xyz");

        let mut buf = [0u8; 8];
        assert_eq!(ch.read(Side::A, &mut buf), Some(3));
        assert_eq!(&buf[..3], b"xyz");
        assert_eq!(ch.read(Side::B, &mut buf), Some(2));
        assert_eq!(&buf[..2], b"ab");
    }

    #[test]
    fn test_partial_write_when_nearly_full() {
        let mut ch = channel(4);
        assert_eq!(ch.write(Side::A, b"abc"), WriteAttempt::Accepted(3));
        assert_eq!(ch.write(Side::A, b"def"), WriteAttempt::Accepted(1));
        assert_eq!(ch.write(Side::A, b"g"), WriteAttempt::Full);
    }

    #[test]
    fn test_eof_after_drain() {
        let mut ch = channel(8);
        ch.write(Side::A, b"ok");
        assert!(ch.close(Side::A));
        assert!(!ch.close(Side::A));

        let mut buf = [0u8; 8];
        assert_eq!(ch.read(Side::B, &mut buf), Some(2));
        assert_eq!(ch.read(Side::B, &mut buf), Some(0));
    }

    #[test]
    fn test_write_to_closed_peer() {
        let mut ch = channel(8);
        ch.close(Side::B);
        assert_eq!(ch.write(Side::A, b"x"), WriteAttempt::PeerClosed);
        assert!(ch.is_live());
        ch.close(Side::A);
        assert!(!ch.is_live());
    }
}
