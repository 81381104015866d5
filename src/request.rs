//! Requests, reply buffers, and the difficult-reply completion path.

use std::sync::Weak;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::buffer::BufferId;
use crate::error::Result;
use crate::msg::{MsgHeader, MsgType, MSG_HDR_SIZE};
use crate::service::Shared;

/// Peer identity, assigned by the connection layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer:{:#x}", self.0)
    }
}

/// Processing phase of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    /// Queued, not yet dispatched.
    New,
    /// Being interpreted by the handler.
    Interpreting,
    /// Handler finished; reply sent or dropped.
    Complete,
}

/// An inbound call, carved out of a receive buffer.
pub struct Request {
    pub(crate) peer: PeerId,
    pub(crate) xid: u64,
    pub(crate) arrival: Instant,
    pub(crate) phase: RequestPhase,
    pub(crate) status: i32,
    pub(crate) buffer: BufferId,
    pub(crate) history_seq: u64,
    /// Raw wire bytes; parsed into `header`/`body` at dispatch.
    pub(crate) raw: Bytes,
    pub(crate) header: Option<MsgHeader>,
    pub(crate) body: Bytes,
    pub(crate) reply_body: Option<Bytes>,
    pub(crate) deferred: bool,
    pub(crate) svc: Weak<Shared>,
}

impl Request {
    /// Originating peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Transaction id.
    pub fn xid(&self) -> u64 {
        self.xid
    }

    /// Operation code, valid once the request has been unpacked.
    pub fn opcode(&self) -> u32 {
        self.header.map_or(0, |h| h.opc)
    }

    /// Request body, valid once the request has been unpacked.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Current processing phase.
    pub fn phase(&self) -> RequestPhase {
        self.phase
    }

    /// Set the reply status code.
    pub fn set_status(&mut self, status: i32) {
        self.status = status;
    }

    /// Set the reply body sent back to the peer on success.
    pub fn set_reply(&mut self, body: Bytes) {
        self.reply_body = Some(body);
    }

    /// Defer the reply: no reply is sent when the handler returns, and a
    /// worker thread stays reserved until the returned completion is
    /// resolved. See [`ReplyCompletion`].
    pub fn defer_reply(&mut self) -> ReplyCompletion {
        self.deferred = true;
        if let Some(shared) = self.svc.upgrade() {
            shared.note_difficult();
        }
        ReplyCompletion {
            svc: self.svc.clone(),
            peer: self.peer,
            xid: self.xid,
            opc: self.opcode(),
            completed: false,
        }
    }

    /// Validate and split the raw wire bytes into header and body.
    pub(crate) fn unpack(&mut self) -> Result<()> {
        let header = MsgHeader::read_from(&self.raw)?;
        self.body = self
            .raw
            .slice(MSG_HDR_SIZE..MSG_HDR_SIZE + header.body_len as usize);
        self.header = Some(header);
        Ok(())
    }

    /// Message type, valid once unpacked.
    pub(crate) fn msg_type(&self) -> Option<MsgType> {
        self.header.map(|h| h.mtype)
    }
}

/// A difficult (deferred) reply awaiting its asynchronous completion.
///
/// Obtained from [`Request::defer_reply`]. While outstanding, admission
/// control keeps one worker thread free to finish it. Call
/// [`complete`](ReplyCompletion::complete) when the async condition
/// resolves; the reply is then sent from a worker's event loop. Dropping
/// the token without completing releases the reservation and sends nothing.
pub struct ReplyCompletion {
    svc: Weak<Shared>,
    peer: PeerId,
    xid: u64,
    opc: u32,
    completed: bool,
}

impl ReplyCompletion {
    /// Resolve the deferred reply with the given status and optional body.
    pub fn complete(mut self, status: i32, body: Option<Bytes>) {
        self.completed = true;
        if let Some(shared) = self.svc.upgrade() {
            shared.queue_difficult_reply(PendingReply {
                peer: self.peer,
                xid: self.xid,
                opc: self.opc,
                status,
                body: body.unwrap_or_default(),
            });
        }
    }
}

impl Drop for ReplyCompletion {
    fn drop(&mut self) {
        if !self.completed {
            if let Some(shared) = self.svc.upgrade() {
                warn!(xid = self.xid, peer = %self.peer, "difficult reply abandoned without completion");
                shared.abandon_difficult();
            }
        }
    }
}

/// A resolved difficult reply, queued for a worker to send.
pub(crate) struct PendingReply {
    pub(crate) peer: PeerId,
    pub(crate) xid: u64,
    pub(crate) opc: u32,
    pub(crate) status: i32,
    pub(crate) body: Bytes,
}

/// Reusable reply buffer, one per worker thread.
///
/// Sized to the power-of-two reply capacity from the service config and
/// reused across every call the owning thread services.
pub(crate) struct ReplyState {
    buf: BytesMut,
    capacity: usize,
}

impl ReplyState {
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two() && capacity >= MSG_HDR_SIZE);
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Frame a reply message. Bodies beyond the buffer capacity are
    /// truncated with an error log rather than over-running the wire limit.
    pub(crate) fn encode(&mut self, opc: u32, status: i32, body: &[u8]) -> Bytes {
        let max_body = self.capacity - MSG_HDR_SIZE;
        let body = if body.len() > max_body {
            tracing::error!(
                len = body.len(),
                max = max_body,
                "reply body exceeds reply buffer, truncating"
            );
            &body[..max_body]
        } else {
            body
        };

        self.buf.clear();
        MsgHeader::reply(opc, status, body.len() as u32).write_to(&mut self.buf);
        self.buf.extend_from_slice(body);
        self.buf.split().freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_state_reuse() {
        let mut rs = ReplyState::new(1024);

        let first = rs.encode(1, 0, b"alpha");
        let second = rs.encode(2, -5, b"beta");

        let hdr = MsgHeader::read_from(&first).unwrap();
        assert_eq!(hdr.opc, 1);
        assert_eq!(&first[MSG_HDR_SIZE..], b"alpha");

        let hdr = MsgHeader::read_from(&second).unwrap();
        assert_eq!(hdr.opc, 2);
        assert_eq!(hdr.status, -5);
        assert_eq!(&second[MSG_HDR_SIZE..], b"beta");
    }

    #[test]
    fn test_reply_state_truncates_oversized_body() {
        let mut rs = ReplyState::new(64);
        let body = vec![7u8; 256];

        let reply = rs.encode(1, 0, &body);
        assert_eq!(reply.len(), 64);

        let hdr = MsgHeader::read_from(&reply).unwrap();
        assert_eq!(hdr.body_len as usize, 64 - MSG_HDR_SIZE);
    }
}
