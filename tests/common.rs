//! Common test utilities for service integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;

use svcrpc::{
    BufferId, BufferLease, Delivery, MsgHeader, NoopSink, PeerId, Request, Service,
    ServiceConfig, ServiceRegistry, Transport, TransportError,
};

/// In-memory transport that records everything the engine asks of it.
///
/// Tests drive inbound traffic directly through [`Service::deliver`], so
/// the mock only needs to log registrations, unlink requests, and sent
/// replies, and optionally fail registrations on demand.
#[derive(Default)]
pub struct MockTransport {
    /// Every lease ever registered, in registration order.
    pub registered: Mutex<Vec<BufferLease>>,
    /// Replies sent, in send order.
    pub replies: Mutex<Vec<(PeerId, u64, Bytes)>>,
    /// Channel each reply went out on, parallel to `replies`.
    pub reply_channels: Mutex<Vec<u32>>,
    /// Buffers the engine asked to unlink.
    pub unlink_requests: Mutex<Vec<BufferId>>,
    /// Channels currently in lazy mode.
    pub lazy_channels: Mutex<Vec<u32>>,
    /// When set, registrations fail.
    pub fail_register: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The `index`-th registered lease.
    pub fn lease(&self, index: usize) -> BufferLease {
        self.registered.lock()[index]
    }

    pub fn registration_count(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn reply_count(&self) -> usize {
        self.replies.lock().len()
    }

    /// Decoded header and body of the `index`-th reply.
    pub fn reply(&self, index: usize) -> (PeerId, u64, MsgHeader, Bytes) {
        let (peer, xid, raw) = self.replies.lock()[index].clone();
        let hdr = MsgHeader::read_from(&raw).expect("reply header decodes");
        let body = raw.slice(svcrpc::MSG_HDR_SIZE..);
        (peer, xid, hdr, body)
    }
}

impl Transport for MockTransport {
    fn set_lazy_channel(&self, channel: u32) -> Result<(), TransportError> {
        self.lazy_channels.lock().push(channel);
        Ok(())
    }

    fn clear_lazy_channel(&self, channel: u32) -> Result<(), TransportError> {
        self.lazy_channels.lock().retain(|c| *c != channel);
        Ok(())
    }

    fn register_receive(&self, lease: BufferLease) -> Result<(), TransportError> {
        if self.fail_register.load(Ordering::Relaxed) {
            return Err(TransportError::Register("injected failure".into()));
        }
        self.registered.lock().push(lease);
        Ok(())
    }

    fn unlink(&self, buffer: BufferId) -> Result<(), TransportError> {
        self.unlink_requests.lock().push(buffer);
        Ok(())
    }

    fn send_reply(
        &self,
        channel: u32,
        peer: PeerId,
        xid: u64,
        reply: Bytes,
    ) -> Result<(), TransportError> {
        self.reply_channels.lock().push(channel);
        self.replies.lock().push((peer, xid, reply));
        Ok(())
    }
}

/// Frame a request message the way a peer would put it on the wire.
pub fn request_bytes(opc: u32, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::new();
    MsgHeader::request(opc, body.len() as u32).write_to(&mut buf);
    buf.extend_from_slice(body);
    buf.freeze()
}

/// Build a request delivery event for the given registered buffer.
pub fn request_delivery(
    buffer: BufferId,
    peer: PeerId,
    xid: u64,
    opc: u32,
    body: &[u8],
    unlinked: bool,
) -> Delivery {
    Delivery::Request {
        buffer,
        peer,
        xid,
        msg: request_bytes(opc, body),
        unlinked,
    }
}

/// Install a test subscriber honoring `RUST_LOG`. Safe to call from every
/// test; only the first call wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    loop {
        if cond() {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Start a service on a fresh registry with the mock transport.
pub fn start_service<H>(
    config: ServiceConfig,
    transport: Arc<MockTransport>,
    handler: H,
) -> (Service, Arc<ServiceRegistry>)
where
    H: Fn(&mut Request) -> i32 + Send + Sync + 'static,
{
    let registry = ServiceRegistry::new();
    let service = Service::init(config, transport, handler, &registry, Arc::new(NoopSink))
        .expect("service init");
    (service, registry)
}
