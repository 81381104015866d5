//! Transport collaborator interface.
//!
//! The engine is transport-agnostic: it owns receive buffers and hands the
//! transport leases on them, and the transport feeds parsed inbound
//! messages back through [`Service::deliver`](crate::Service::deliver).
//! Message matching, wire delivery, and peer connectivity all live behind
//! this trait.

use bytes::Bytes;

use crate::buffer::{BufferId, BufferLease};
use crate::request::PeerId;

/// Transport-layer failure.
///
/// Registration failures are always treated as transient by the engine and
/// retried with backoff; they are never surfaced to callers after startup.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Receive registration failed.
    #[error("receive registration failed: {0}")]
    Register(String),

    /// Buffer unlink failed.
    #[error("unlink failed: {0}")]
    Unlink(String),

    /// Reply send failed.
    #[error("reply send failed: {0}")]
    Send(String),

    /// Channel (de)configuration failed.
    #[error("channel operation failed: {0}")]
    Channel(String),
}

/// Network transport, as seen by the engine.
///
/// The engine never reads payloads back out of its receive buffers: the
/// transport owns message parsing and hands each inbound message to
/// [`Service::deliver`](crate::Service::deliver) as `Bytes`, tagged with
/// the buffer it consumed space in.
pub trait Transport: Send + Sync {
    /// Put the given channel in lazy (on-demand) mode: inbound messages are
    /// held by the transport rather than dropped when no buffer is posted.
    fn set_lazy_channel(&self, channel: u32) -> Result<(), TransportError>;

    /// Undo [`set_lazy_channel`](Transport::set_lazy_channel); part of
    /// service teardown.
    fn clear_lazy_channel(&self, channel: u32) -> Result<(), TransportError>;

    /// Register a receive buffer. Inbound messages landing in it are
    /// delivered via [`Service::deliver`](crate::Service::deliver).
    fn register_receive(&self, lease: BufferLease) -> Result<(), TransportError>;

    /// Force a final unlink event for a registered buffer, even if no data
    /// is pending. The transport must eventually deliver
    /// [`Delivery::Unlinked`] (or a final [`Delivery::Request`] with
    /// `unlinked` set) for it.
    fn unlink(&self, buffer: BufferId) -> Result<(), TransportError>;

    /// Send a reply to a peer on the given channel. `xid` correlates the
    /// reply with the originating request on the wire.
    fn send_reply(
        &self,
        channel: u32,
        peer: PeerId,
        xid: u64,
        reply: Bytes,
    ) -> Result<(), TransportError>;
}

/// Inbound transport event, passed to
/// [`Service::deliver`](crate::Service::deliver).
#[derive(Debug)]
pub enum Delivery {
    /// A request message arrived in a registered buffer.
    Request {
        /// Buffer the message landed in.
        buffer: BufferId,
        /// Originating peer.
        peer: PeerId,
        /// Transaction id from the transport's match bits.
        xid: u64,
        /// Raw wire bytes (header + body).
        msg: Bytes,
        /// True if this message exhausted the buffer: the buffer leaves the
        /// receiving set and its registration hold transfers to the request.
        unlinked: bool,
    },
    /// Final event for a buffer with no message attached (unlink during
    /// teardown, or transport-side cancellation).
    Unlinked {
        /// The buffer whose registration was released.
        buffer: BufferId,
    },
}
