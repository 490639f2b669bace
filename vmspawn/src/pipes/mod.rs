//! Pipe registry: paired byte-stream endpoints with ownership tracking.
//!
//! A pipe is created as two endpoints. Bytes written on one endpoint are read
//! from the other, in write order, through a bounded queue per direction.
//!
//! Pipes are full duplex: the interface does not give either endpoint a read
//! or write role. Each endpoint owns the inbound queue its peer writes into,
//! so reading an endpoint never returns bytes written on that same endpoint.
//! A pipe used in one direction only is a pipe whose reader never writes; the
//! convention in [`crate::testing`] is to read the first endpoint and write the
//! second. Readers and writers of one direction are never woken by traffic in
//! the other.
//! Every endpoint has exactly one owning instance; only the owner may read,
//! write, close, or hand the endpoint to a child at spawn time.

mod channel;
mod registry;

pub use channel::Side;
pub use registry::PipeRegistry;

pub(crate) use channel::ChannelEnd;
