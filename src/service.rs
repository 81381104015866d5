//! Service state and lifecycle.
//!
//! A [`Service`] owns its receive buffers, request queue, and worker pool.
//! All mutable state lives in one `Inner` guarded by a single mutex with
//! a condition variable for the monitor-style worker wake-up; the trade is
//! some contention for invariant simplicity.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use slab::Slab;
use tracing::{debug, error, trace, warn};

use crate::buffer::{BufferId, BufferLease, BufferState, ReceiveBuffer};
use crate::config::ServiceConfig;
use crate::error::Result;
use crate::metrics::{size_bucket, LatencySink};
use crate::msg::MsgType;
use crate::registry::ServiceRegistry;
use crate::request::{PeerId, PendingReply, ReplyState, Request, RequestPhase};
use crate::transport::{Delivery, Transport, TransportError};
use crate::worker;

/// Registered call handler. Returns a status code; nonzero produces an
/// error reply to the peer.
pub type Handler = Box<dyn Fn(&mut Request) -> i32 + Send + Sync>;

/// Counters snapshot, taken under the service lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceStats {
    /// Total buffers owned by the service.
    pub nbufs: usize,
    /// Buffers currently registered to receive.
    pub receiving: usize,
    /// Buffers in the idle pool.
    pub idle: usize,
    /// Retired buffers held in history.
    pub history: usize,
    /// Requests queued for dispatch.
    pub queued: usize,
    /// Requests currently being handled.
    pub active: usize,
    /// Difficult replies outstanding.
    pub difficult_replies: usize,
    /// Live worker threads.
    pub nthreads: usize,
    /// Next request history sequence number.
    pub request_seq: u64,
    /// Highest culled request sequence number.
    pub cull_seq: u64,
    /// Peers with nonzero queue-length entries.
    pub peer_qlen_entries: usize,
}

/// Mutable service state; every field is guarded by `Shared::state`.
pub(crate) struct Inner {
    pub(crate) running: bool,
    pub(crate) buffers: Slab<ReceiveBuffer>,
    pub(crate) idle: VecDeque<BufferId>,
    pub(crate) history: VecDeque<BufferId>,
    pub(crate) nbufs: usize,
    pub(crate) receiving: usize,
    /// Bounded wait applied to worker sleeps after a registration failure;
    /// `None` means wait unbounded.
    pub(crate) buffer_retry: Option<Duration>,
    pub(crate) queue: VecDeque<Request>,
    pub(crate) active: usize,
    pub(crate) difficult_replies: usize,
    pub(crate) replies: VecDeque<PendingReply>,
    pub(crate) free_reply_states: Vec<ReplyState>,
    pub(crate) max_history: usize,
    pub(crate) request_seq: u64,
    pub(crate) max_cull_seq: u64,
    pub(crate) peer_qlens: HashMap<PeerId, usize>,
    pub(crate) nthreads: usize,
}

impl Inner {
    fn new(config: &ServiceConfig) -> Self {
        Self {
            running: true,
            buffers: Slab::new(),
            idle: VecDeque::new(),
            history: VecDeque::new(),
            nbufs: 0,
            receiving: 0,
            buffer_retry: None,
            queue: VecDeque::new(),
            active: 0,
            difficult_replies: 0,
            replies: VecDeque::new(),
            free_reply_states: Vec::new(),
            max_history: config.max_history,
            request_seq: 1, // valid sequence numbers start at 1
            max_cull_seq: 0,
            peer_qlens: HashMap::new(),
            nthreads: 0,
        }
    }

    /// Worker wake predicate; recomputed under the lock on every wake.
    pub(crate) fn wake_ready(&self, num_threads: usize) -> bool {
        (!self.running && self.difficult_replies == 0)
            || (!self.idle.is_empty() && self.buffer_retry.is_none())
            || !self.replies.is_empty()
            || (!self.queue.is_empty()
                && (self.difficult_replies == 0 || self.active < num_threads - 1))
    }

    /// Drop a request's hold on its buffer; retires the buffer at refcount
    /// zero. The request's history sequence stays logged in the buffer
    /// until the buffer is culled.
    fn free_request(&mut self, req: Request, count_qlens: bool) {
        if count_qlens {
            if let Some(qlen) = self.peer_qlens.get_mut(&req.peer) {
                *qlen -= 1;
                if *qlen == 0 {
                    self.peer_qlens.remove(&req.peer);
                }
            }
        }

        self.active -= 1;

        let id = req.buffer;
        let buf = &mut self.buffers[id.0];
        buf.retained.push(req.history_seq);
        debug_assert!(buf.refcount > 0);
        buf.refcount -= 1;
        if buf.refcount == 0 {
            self.retire(id);
        }
    }

    /// Move a fully released buffer to history, then cull history beyond
    /// the configured bound, advancing the cull watermark and recycling
    /// evicted buffers to the idle pool.
    fn retire(&mut self, id: BufferId) {
        {
            let buf = &mut self.buffers[id.0];
            debug_assert_eq!(buf.refcount, 0);
            debug_assert!(!buf.registered);
            debug_assert_eq!(buf.state, BufferState::Active);
            buf.state = BufferState::Historical;
        }
        self.history.push_back(id);

        while self.history.len() > self.max_history {
            let old = self.history.pop_front().expect("history non-empty");
            let buf = &mut self.buffers[old.0];
            for seq in buf.retained.drain(..) {
                self.max_cull_seq = self.max_cull_seq.max(seq);
            }
            buf.recycle();
            self.idle.push_back(old);
        }
    }

    /// Cull every remaining historical buffer back to the idle pool.
    fn cull_all_history(&mut self) {
        while let Some(id) = self.history.pop_front() {
            let buf = &mut self.buffers[id.0];
            for seq in buf.retained.drain(..) {
                self.max_cull_seq = self.max_cull_seq.max(seq);
            }
            buf.recycle();
            self.idle.push_back(id);
        }
    }

    fn stats(&self) -> ServiceStats {
        ServiceStats {
            nbufs: self.nbufs,
            receiving: self.receiving,
            idle: self.idle.len(),
            history: self.history.len(),
            queued: self.queue.len(),
            active: self.active,
            difficult_replies: self.difficult_replies,
            nthreads: self.nthreads,
            request_seq: self.request_seq,
            cull_seq: self.max_cull_seq,
            peer_qlen_entries: self.peer_qlens.len(),
        }
    }
}

/// State shared between the service handle and its worker threads.
pub(crate) struct Shared {
    pub(crate) name: String,
    pub(crate) config: ServiceConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) handler: Handler,
    pub(crate) latency: Arc<dyn LatencySink>,
    pub(crate) state: Mutex<Inner>,
    pub(crate) wake: Condvar,
    /// Fault injection: replies for requests with this opcode are dropped.
    /// Zero disables.
    pub(crate) fail_id: AtomicU32,
}

impl Shared {
    /// Allocate `n` buffers and post each to the transport. Aborts the
    /// growth call on the first registration failure; already-allocated
    /// buffers stay idle for the retry path.
    pub(crate) fn grow(&self, n: usize) -> std::result::Result<(), TransportError> {
        debug!(
            service = %self.name,
            count = n,
            size = self.config.buffer_size,
            "allocating request buffers"
        );
        for _ in 0..n {
            {
                let mut st = self.state.lock();
                let id = st.buffers.insert(ReceiveBuffer::new(self.config.buffer_size));
                st.idle.push_back(BufferId(id));
                st.nbufs += 1;
            }
            self.post_idle()?;
        }
        Ok(())
    }

    /// Register idle buffers with the transport until the idle pool is
    /// empty. On a registration failure the buffer goes back to the idle
    /// tail and the bounded retry timeout is armed; no busy-looping.
    pub(crate) fn post_idle(&self) -> std::result::Result<usize, TransportError> {
        let mut posted = 0;
        loop {
            let lease = {
                let mut st = self.state.lock();
                let Some(id) = st.idle.pop_front() else {
                    return Ok(posted);
                };
                st.receiving += 1;
                let buf = &mut st.buffers[id.0];
                buf.state = BufferState::Active;
                buf.registered = true;
                buf.refcount += 1; // transport hold
                BufferLease {
                    buffer: id,
                    capacity: buf.capacity(),
                }
            };

            match self.transport.register_receive(lease) {
                Ok(()) => posted += 1,
                Err(e) => {
                    let mut st = self.state.lock();
                    st.receiving -= 1;
                    let buf = &mut st.buffers[lease.buffer.0];
                    buf.state = BufferState::Idle;
                    buf.registered = false;
                    buf.refcount -= 1;
                    st.idle.push_back(lease.buffer);
                    st.buffer_retry = Some(self.config.buffer_retry_delay);
                    warn!(service = %self.name, %e, "receive registration failed, backing off");
                    return Err(e);
                }
            }
        }
    }

    /// Grow the pool when the receiving count falls to the low-water mark.
    /// Called once per worker wake cycle; growth failures are retried on a
    /// later cycle.
    pub(crate) fn check_watermark(&self) {
        let avail = self.state.lock().receiving;
        if avail <= self.config.low_water() {
            if let Err(e) = self.grow(self.config.effective_group_size()) {
                debug!(service = %self.name, %e, "buffer growth deferred");
            }
        }
    }

    pub(crate) fn idle_pending(&self) -> bool {
        !self.state.lock().idle.is_empty()
    }

    /// Transport delivery callback: queue an arrived request or release an
    /// unlinked buffer, then wake the workers.
    pub(crate) fn deliver(this: &Arc<Shared>, delivery: Delivery) {
        match delivery {
            Delivery::Request {
                buffer,
                peer,
                xid,
                msg,
                unlinked,
            } => {
                let mut st = this.state.lock();
                let history_seq = st.request_seq;
                st.request_seq += 1;

                {
                    let buf = &mut st.buffers[buffer.0];
                    debug_assert_eq!(buf.state, BufferState::Active);
                    debug_assert!(buf.registered);
                    if unlinked {
                        // The request takes over the registration hold.
                        buf.registered = false;
                    } else {
                        buf.refcount += 1;
                    }
                }
                if unlinked {
                    st.receiving -= 1;
                    trace!(
                        service = %this.name,
                        receiving = st.receiving,
                        "buffer complete"
                    );
                    if st.receiving == 0 {
                        error!(service = %this.name, "all request buffers are busy");
                    }
                }

                st.queue.push_back(Request {
                    peer,
                    xid,
                    arrival: Instant::now(),
                    phase: RequestPhase::New,
                    status: 0,
                    buffer,
                    history_seq,
                    raw: msg,
                    header: None,
                    body: Bytes::new(),
                    reply_body: None,
                    deferred: false,
                    svc: Arc::downgrade(this),
                });
                if this.config.count_peer_qlens {
                    *st.peer_qlens.entry(peer).or_insert(0) += 1;
                }
                drop(st);
                this.wake.notify_all();
            }
            Delivery::Unlinked { buffer } => {
                let mut st = this.state.lock();
                let (was_registered, retire) = {
                    let buf = &mut st.buffers[buffer.0];
                    if buf.registered {
                        buf.registered = false;
                        buf.refcount -= 1;
                        (true, buf.refcount == 0)
                    } else {
                        (false, false)
                    }
                };
                if was_registered {
                    st.receiving -= 1;
                    if retire {
                        st.retire(buffer);
                    }
                }
                drop(st);
                this.wake.notify_all();
            }
        }
    }

    /// Dequeue and dispatch one request, subject to admission control.
    /// Returns false when nothing was dispatched (empty queue, or the last
    /// free thread is being reserved for difficult replies).
    pub(crate) fn handle_request(&self, reply_state: &mut ReplyState) -> bool {
        let mut request = {
            let mut st = self.state.lock();
            if st.difficult_replies != 0 && st.active >= self.config.num_threads - 1 {
                return false;
            }
            let Some(req) = st.queue.pop_front() else {
                return false;
            };
            st.active += 1;
            req
        };

        let work_start = Instant::now();
        let waited = work_start.duration_since(request.arrival);

        // Discard requests queued for longer than the timeout; the client
        // has likely timed it out already and will retry.
        if waited > self.config.rpc_timeout {
            warn!(
                service = %self.name,
                xid = request.xid,
                peer = %request.peer,
                age_ms = waited.as_millis() as u64,
                "dropping timed-out request"
            );
            self.complete_request(request);
            return true;
        }

        if let Err(e) = request.unpack() {
            error!(
                service = %self.name,
                xid = request.xid,
                peer = %request.peer,
                %e,
                "error unpacking request"
            );
            self.complete_request(request);
            return true;
        }
        if request.msg_type() != Some(MsgType::Request) {
            error!(
                service = %self.name,
                xid = request.xid,
                peer = %request.peer,
                "wrong message type received"
            );
            self.complete_request(request);
            return true;
        }

        request.phase = RequestPhase::Interpreting;
        debug!(
            service = %self.name,
            xid = request.xid,
            opc = request.opcode(),
            peer = %request.peer,
            "handling RPC"
        );

        let rc = (self.handler)(&mut request);

        request.phase = RequestPhase::Complete;
        let elapsed = work_start.elapsed();
        debug!(
            service = %self.name,
            xid = request.xid,
            opc = request.opcode(),
            rc,
            "handled RPC"
        );

        self.latency
            .record(size_bucket(request.body().len()), elapsed);
        if elapsed > self.config.rpc_timeout {
            error!(
                service = %self.name,
                xid = request.xid,
                opc = request.opcode(),
                elapsed_ms = elapsed.as_millis() as u64,
                "request processed past timeout"
            );
        } else {
            trace!(
                service = %self.name,
                xid = request.xid,
                elapsed_us = elapsed.as_micros() as u64,
                total_us = request.arrival.elapsed().as_micros() as u64,
                "request processed"
            );
        }

        if !request.deferred {
            self.send_reply(&request, rc, reply_state);
        }
        self.complete_request(request);
        true
    }

    /// Frame and send a reply, honoring fault injection and mapping a
    /// nonzero handler status to an error reply.
    fn send_reply(&self, request: &Request, rc: i32, reply_state: &mut ReplyState) {
        let fail = self.fail_id.load(Ordering::Relaxed);
        if fail != 0 && fail == request.opcode() {
            error!(
                service = %self.name,
                xid = request.xid,
                opc = request.opcode(),
                "dropping reply"
            );
            return;
        }

        let (status, body) = if rc != 0 {
            error!(service = %self.name, xid = request.xid, rc, "processing error");
            (rc, Bytes::new())
        } else {
            (request.status, request.reply_body.clone().unwrap_or_default())
        };

        let reply = reply_state.encode(request.opcode(), status, &body);
        if let Err(e) =
            self.transport
                .send_reply(self.config.reply_channel, request.peer, request.xid, reply)
        {
            warn!(service = %self.name, xid = request.xid, %e, "reply send failed");
        }
    }

    fn complete_request(&self, request: Request) {
        let mut st = self.state.lock();
        st.free_request(request, self.config.count_peer_qlens);
    }

    /// Send one resolved difficult reply, if any is pending.
    pub(crate) fn handle_reply(&self, reply_state: &mut ReplyState) -> bool {
        let Some(pending) = self.state.lock().replies.pop_front() else {
            return false;
        };

        let reply = reply_state.encode(pending.opc, pending.status, &pending.body);
        if let Err(e) =
            self.transport
                .send_reply(self.config.reply_channel, pending.peer, pending.xid, reply)
        {
            warn!(service = %self.name, xid = pending.xid, %e, "difficult reply send failed");
        }

        {
            let mut st = self.state.lock();
            debug_assert!(st.difficult_replies > 0);
            st.difficult_replies -= 1;
        }
        self.wake.notify_all();
        true
    }

    /// A handler deferred its reply; reserve a thread for the completion.
    pub(crate) fn note_difficult(&self) {
        self.state.lock().difficult_replies += 1;
    }

    /// A deferred reply resolved; hand it to the workers.
    pub(crate) fn queue_difficult_reply(&self, pending: PendingReply) {
        self.state.lock().replies.push_back(pending);
        self.wake.notify_all();
    }

    /// A deferred reply was dropped without completing.
    pub(crate) fn abandon_difficult(&self) {
        {
            let mut st = self.state.lock();
            debug_assert!(st.difficult_replies > 0);
            st.difficult_replies -= 1;
        }
        self.wake.notify_all();
    }
}

/// An RPC service: a registered handler, a pool of receive buffers, and a
/// bounded pool of worker threads dispatching inbound requests.
pub struct Service {
    shared: Arc<Shared>,
    registry: Arc<ServiceRegistry>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Create a service: validate the configuration, put the request
    /// channel in lazy mode, pre-allocate and post the initial buffer
    /// group, spawn the worker pool, and register with `registry`.
    ///
    /// Startup resource failures are fatal here; after init, buffer
    /// registration failures only ever degrade to retries.
    pub fn init<H>(
        config: ServiceConfig,
        transport: Arc<dyn Transport>,
        handler: H,
        registry: &Arc<ServiceRegistry>,
        latency: Arc<dyn LatencySink>,
    ) -> Result<Service>
    where
        H: Fn(&mut Request) -> i32 + Send + Sync + 'static,
    {
        config.validate()?;
        debug!(
            service = %config.name,
            buffer_size = config.buffer_size,
            max_request_size = config.max_request_size,
            "initializing service"
        );

        transport.set_lazy_channel(config.request_channel)?;

        let shared = Arc::new(Shared {
            name: config.name.clone(),
            transport,
            handler: Box::new(handler),
            latency,
            state: Mutex::new(Inner::new(&config)),
            wake: Condvar::new(),
            fail_id: AtomicU32::new(0),
            config,
        });

        // We should not be under memory or transport pressure at startup,
        // so fail if the initial buffer group cannot be fully posted.
        shared.grow(shared.config.effective_group_size())?;

        let mut threads = Vec::with_capacity(shared.config.num_threads);
        for index in 0..shared.config.num_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-{}", shared.name, index))
                .spawn(move || worker::run(worker_shared, index));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => {
                    // Partial pool; stop what started before bailing out.
                    shared.state.lock().running = false;
                    shared.wake.notify_all();
                    for handle in threads {
                        let _ = handle.join();
                    }
                    return Err(e.into());
                }
            }
        }

        // Registered only once fully started; every error path above
        // leaves the registry untouched.
        registry.register(&shared);

        debug!(service = %shared.name, "service started");
        Ok(Service {
            shared,
            registry: Arc::clone(registry),
            threads: Mutex::new(threads),
        })
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The validated configuration this service was built with.
    pub fn config(&self) -> &ServiceConfig {
        &self.shared.config
    }

    /// Inbound transport event entry point. Real transports call this from
    /// their receive callback; tests drive it directly.
    pub fn deliver(&self, delivery: Delivery) {
        Shared::deliver(&self.shared, delivery);
    }

    /// Counters snapshot.
    pub fn stats(&self) -> ServiceStats {
        self.shared.state.lock().stats()
    }

    /// Queued+active request count for one peer, when per-peer accounting
    /// is enabled.
    pub fn peer_qlen(&self, peer: PeerId) -> usize {
        self.shared
            .state
            .lock()
            .peer_qlens
            .get(&peer)
            .copied()
            .unwrap_or(0)
    }

    /// Fault injection: drop replies for requests with this opcode.
    /// Zero disables.
    pub fn set_fail_id(&self, opc: u32) {
        self.shared.fail_id.store(opc, Ordering::Relaxed);
    }

    /// Stop and join the worker pool. Workers finish outstanding difficult
    /// replies before exiting.
    pub fn stop_threads(&self) {
        {
            self.shared.state.lock().running = false;
        }
        self.shared.wake.notify_all();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }

    /// Tear the service down. Worker threads must already be stopped.
    ///
    /// Deregisters from the registry, stops retaining history, unlinks
    /// every registered buffer, waits (with periodic warnings, never
    /// aborting) for outstanding receives, drains the request queue without
    /// dispatch, frees all buffers, and drains outstanding replies.
    pub fn unregister(&self) {
        assert_eq!(
            self.shared.state.lock().nthreads,
            0,
            "unregister called with live worker threads"
        );

        self.registry.unregister(&self.shared.name);
        debug!(service = %self.shared.name, "tearing down");

        // All history is culled as the remaining buffers are freed.
        {
            self.shared.state.lock().max_history = 0;
        }

        if let Err(e) = self
            .shared
            .transport
            .clear_lazy_channel(self.shared.config.request_channel)
        {
            warn!(service = %self.shared.name, %e, "clearing lazy channel failed");
        }

        // Unlink every registered buffer; this forces a final delivery with
        // the unlink flag set for each one.
        let registered: Vec<BufferId> = {
            let st = self.shared.state.lock();
            st.buffers
                .iter()
                .filter(|(_, buf)| buf.registered)
                .map(|(id, _)| BufferId(id))
                .collect()
        };
        for id in registered {
            if let Err(e) = self.shared.transport.unlink(id) {
                warn!(service = %self.shared.name, buffer = id.index(), %e, "unlink failed");
            }
        }

        // Wait for the transport to release every buffer it may still be
        // filling. This completes in finite time on a healthy transport;
        // the periodic warning keeps sluggish ones visible.
        {
            let mut st = self.shared.state.lock();
            while st.receiving != 0 {
                let timed_out = self
                    .shared
                    .wake
                    .wait_for(&mut st, self.shared.config.shutdown_warn_interval)
                    .timed_out();
                if timed_out && st.receiving != 0 {
                    warn!(
                        service = %self.shared.name,
                        receiving = st.receiving,
                        "waiting for request buffers"
                    );
                }
            }
        }

        // Purge the request queue. No new requests can arrive (buffers all
        // unlinked) and no worker threads remain, so this thread is the
        // only one touching the queue now.
        {
            let mut st = self.shared.state.lock();
            while let Some(req) = st.queue.pop_front() {
                st.active += 1;
                st.free_request(req, self.shared.config.count_peer_qlens);
            }
            assert_eq!(st.queue.len(), 0);
            assert_eq!(st.active, 0);

            st.cull_all_history();
            assert!(st.history.is_empty());

            // Nothing references the buffers any more; free them.
            while let Some(id) = st.idle.pop_front() {
                st.buffers.remove(id.0);
                st.nbufs -= 1;
            }
            debug_assert_eq!(st.nbufs, 0);
        }

        // Wait for outstanding difficult replies, draining any that resolve
        // while we wait.
        let mut reply_state = {
            let mut st = self.shared.state.lock();
            st.free_reply_states
                .pop()
                .unwrap_or_else(|| ReplyState::new(self.shared.config.reply_buffer_size()))
        };
        loop {
            while self.shared.handle_reply(&mut reply_state) {}

            let mut st = self.shared.state.lock();
            if st.difficult_replies == 0 {
                break;
            }
            if !st.replies.is_empty() {
                continue;
            }
            let timed_out = self
                .shared
                .wake
                .wait_for(&mut st, self.shared.config.shutdown_warn_interval)
                .timed_out();
            if timed_out && st.difficult_replies != 0 {
                warn!(
                    service = %self.shared.name,
                    outstanding = st.difficult_replies,
                    "waiting for outstanding replies"
                );
            }
        }

        {
            let mut st = self.shared.state.lock();
            st.free_reply_states.clear();
        }
        debug!(service = %self.shared.name, "teardown complete");
    }

    /// Full shutdown: stop the worker pool, then tear down.
    pub fn shutdown(&self) {
        self.stop_threads();
        self.unregister();
    }
}
