//! In-process RPC service engine.
//!
//! A [`Service`] binds a handler function to a pool of worker threads, a
//! self-balancing pool of receive buffers, and a FIFO request queue with
//! admission control that keeps one thread free while deferred
//! ("difficult") replies are outstanding. The transport is pluggable: an
//! embedder implements [`Transport`] and feeds inbound events through
//! [`Service::deliver`].
//!
//! Module map:
//! - [`msg`]: wire message header (framing, validation)
//! - [`config`]: per-service tunables and validation
//! - [`transport`]: transport trait and delivery events
//! - [`buffer`]: receive buffer descriptors and lifecycle states
//! - [`request`]: requests, reply framing, difficult-reply completions
//! - [`service`]: service state, dispatch, lifecycle
//! - [`registry`]: registry of live services
//! - [`metrics`]: per-size-bucket dispatch latency
//!
//! ```no_run
//! use std::sync::Arc;
//! use svcrpc::{NoopSink, Service, ServiceConfig, ServiceRegistry};
//! # fn transport() -> Arc<dyn svcrpc::Transport> { unimplemented!() }
//!
//! let registry = ServiceRegistry::new();
//! let svc = Service::init(
//!     ServiceConfig::new("echo"),
//!     transport(),
//!     |req: &mut svcrpc::Request| {
//!         req.set_reply(bytes::Bytes::copy_from_slice(req.body()));
//!         0
//!     },
//!     &registry,
//!     Arc::new(NoopSink),
//! )
//! .unwrap();
//! // ... deliver requests ...
//! svc.shutdown();
//! ```

pub mod buffer;
pub mod config;
pub mod error;
pub mod metrics;
pub mod msg;
pub mod registry;
pub mod request;
pub mod service;
pub mod transport;

mod worker;

pub use buffer::{BufferId, BufferLease, BufferState};
pub use config::ServiceConfig;
pub use error::{Error, Result};
pub use metrics::{size_bucket, LatencySink, NoopSink, SizeHistogram, NUM_SIZE_BUCKETS};
pub use msg::{MsgHeader, MsgType, MSG_HDR_SIZE, MSG_MAGIC, MSG_VERSION};
pub use registry::ServiceRegistry;
pub use request::{PeerId, ReplyCompletion, Request, RequestPhase};
pub use service::{Handler, Service, ServiceStats};
pub use transport::{Delivery, Transport, TransportError};
