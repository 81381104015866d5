//! Receive buffer descriptors.
//!
//! Buffers live in a slab arena owned by the service; everything else
//! refers to them by [`BufferId`]. A buffer's reference count tracks the
//! requests carved from it plus one implicit hold while it is registered
//! with the transport, and the buffer only returns to the idle pool once
//! both are gone.
//!
//! The owned region stands in for the registered receive window: the
//! engine accounts for its capacity and lifetime but never reads payloads
//! out of it. Inbound messages arrive as `Bytes` on the delivery event,
//! tagged with the buffer they consumed space in.

use bytes::BytesMut;

/// Index of a receive buffer in the service arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

impl BufferId {
    /// Raw arena index.
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Lease handed to the transport when a buffer is registered to receive.
#[derive(Debug, Clone, Copy)]
pub struct BufferLease {
    /// The leased buffer.
    pub buffer: BufferId,
    /// Usable capacity in bytes.
    pub capacity: usize,
}

/// Lifecycle state of a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// In the idle pool, not registered.
    Idle,
    /// Registered with the transport (or still referenced by requests
    /// carved out of it).
    Active,
    /// Retired to bounded history, awaiting recycling.
    Historical,
}

/// A fixed-size memory region registered with the transport to receive
/// inbound wire messages.
pub(crate) struct ReceiveBuffer {
    /// Owned receive region; models the transport's receive window while
    /// registered. Payloads are delivered as `Bytes`, not read from here.
    region: BytesMut,
    /// Requests carved from this buffer and not yet freed, plus one while
    /// registered with the transport.
    pub(crate) refcount: u32,
    pub(crate) state: BufferState,
    /// True while a transport registration is outstanding.
    pub(crate) registered: bool,
    /// History sequence numbers of requests freed back into this buffer,
    /// retained for duplicate-detection until the buffer is culled.
    pub(crate) retained: Vec<u64>,
}

impl ReceiveBuffer {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            region: BytesMut::with_capacity(capacity),
            refcount: 0,
            state: BufferState::Idle,
            registered: false,
            retained: Vec::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.region.capacity()
    }

    /// Reset for reuse after culling from history. The retained request log
    /// must already have been drained into the cull watermark.
    pub(crate) fn recycle(&mut self) {
        debug_assert_eq!(self.refcount, 0);
        debug_assert!(!self.registered);
        debug_assert!(self.retained.is_empty());
        self.region.clear();
        self.state = BufferState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_buffer_is_idle() {
        let buf = ReceiveBuffer::new(4096);
        assert_eq!(buf.state, BufferState::Idle);
        assert_eq!(buf.refcount, 0);
        assert!(!buf.registered);
        assert_eq!(buf.capacity(), 4096);
    }

    #[test]
    fn test_recycle_clears_region() {
        let mut buf = ReceiveBuffer::new(1024);
        buf.region.extend_from_slice(b"stale");
        buf.state = BufferState::Historical;

        buf.recycle();
        assert_eq!(buf.state, BufferState::Idle);
        assert!(buf.region.is_empty());
        assert!(buf.capacity() >= 1024);
    }
}
