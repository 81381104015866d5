//! Service configuration.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::msg::MSG_HDR_SIZE;

/// Construction-time configuration for a [`Service`](crate::Service).
///
/// Controls buffer sizing, growth policy, the worker pool, and request
/// shedding. Validated once by [`Service::init`](crate::Service::init);
/// immutable afterwards.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Service name, used in logs and the registry.
    pub name: String,
    /// Size of each receive buffer in bytes.
    /// Default: 16384
    pub buffer_size: usize,
    /// Maximum inbound request size. Must not exceed `buffer_size`.
    /// Default: 4096
    pub max_request_size: usize,
    /// Maximum reply size; rounded up to the next power of two.
    /// Default: 4096
    pub max_reply_size: usize,
    /// Transport channel id requests arrive on.
    /// Default: 0
    pub request_channel: u32,
    /// Transport channel id replies are sent on.
    /// Default: 1
    pub reply_channel: u32,
    /// Number of buffers allocated per growth increment.
    /// Default: 8
    pub buffer_group_size: usize,
    /// Number of worker threads.
    /// Default: 4
    pub num_threads: usize,
    /// Requests older than this at dequeue time are shed without dispatch.
    /// Default: 30s
    pub rpc_timeout: Duration,
    /// Maximum number of retired buffers kept for duplicate-request
    /// bookkeeping before recycling.
    /// Default: 8
    pub max_history: usize,
    /// Backoff before retrying a failed buffer registration.
    /// Default: 100ms
    pub buffer_retry_delay: Duration,
    /// Warning interval while teardown waits for outstanding receives or
    /// replies to quiesce.
    /// Default: 5s
    pub shutdown_warn_interval: Duration,
    /// Track queued+active request counts per peer.
    /// Default: false
    pub count_peer_qlens: bool,
    /// Pressure-test mode: single-buffer growth increments and a zero
    /// low-water mark, so the pool grows only when fully drained.
    /// Default: false
    pub test_buffer_pressure: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "svcrpc".into(),
            buffer_size: 16384,
            max_request_size: 4096,
            max_reply_size: 4096,
            request_channel: 0,
            reply_channel: 1,
            buffer_group_size: 8,
            num_threads: 4,
            rpc_timeout: Duration::from_secs(30),
            max_history: 8,
            buffer_retry_delay: Duration::from_millis(100),
            shutdown_warn_interval: Duration::from_secs(5),
            count_peer_qlens: false,
            test_buffer_pressure: false,
        }
    }
}

impl ServiceConfig {
    /// Create a configuration with default values and the given name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the receive buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Set the maximum request size.
    pub fn with_max_request_size(mut self, max_request_size: usize) -> Self {
        self.max_request_size = max_request_size;
        self
    }

    /// Set the maximum reply size.
    pub fn with_max_reply_size(mut self, max_reply_size: usize) -> Self {
        self.max_reply_size = max_reply_size;
        self
    }

    /// Set the request/reply channel ids.
    pub fn with_channels(mut self, request: u32, reply: u32) -> Self {
        self.request_channel = request;
        self.reply_channel = reply;
        self
    }

    /// Set the number of buffers per growth increment.
    pub fn with_buffer_group_size(mut self, buffer_group_size: usize) -> Self {
        self.buffer_group_size = buffer_group_size;
        self
    }

    /// Set the worker thread count.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads;
        self
    }

    /// Set the request-shedding timeout.
    pub fn with_rpc_timeout(mut self, rpc_timeout: Duration) -> Self {
        self.rpc_timeout = rpc_timeout;
        self
    }

    /// Set the retired-buffer history bound.
    pub fn with_max_history(mut self, max_history: usize) -> Self {
        self.max_history = max_history;
        self
    }

    /// Set the registration-retry backoff.
    pub fn with_buffer_retry_delay(mut self, delay: Duration) -> Self {
        self.buffer_retry_delay = delay;
        self
    }

    /// Set the teardown warning interval.
    pub fn with_shutdown_warn_interval(mut self, interval: Duration) -> Self {
        self.shutdown_warn_interval = interval;
        self
    }

    /// Enable per-peer queue-length accounting.
    pub fn with_peer_qlens(mut self, enabled: bool) -> Self {
        self.count_peer_qlens = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size < self.max_request_size {
            return Err(Error::InvalidConfig(format!(
                "buffer_size {} smaller than max_request_size {}",
                self.buffer_size, self.max_request_size
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size cannot be 0".into()));
        }
        if self.num_threads == 0 {
            return Err(Error::InvalidConfig("num_threads cannot be 0".into()));
        }
        if self.buffer_group_size == 0 {
            return Err(Error::InvalidConfig(
                "buffer_group_size cannot be 0".into(),
            ));
        }
        if self.max_reply_size == 0 {
            return Err(Error::InvalidConfig("max_reply_size cannot be 0".into()));
        }
        if self.reply_buffer_size() < MSG_HDR_SIZE {
            return Err(Error::InvalidConfig(format!(
                "max_reply_size {} leaves no room for the reply header",
                self.max_reply_size
            )));
        }
        Ok(())
    }

    /// Reply buffer capacity: `max_reply_size` rounded up to a power of two.
    pub fn reply_buffer_size(&self) -> usize {
        self.max_reply_size.next_power_of_two()
    }

    /// Growth increment, accounting for pressure-test mode.
    pub(crate) fn effective_group_size(&self) -> usize {
        if self.test_buffer_pressure {
            1
        } else {
            self.buffer_group_size
        }
    }

    /// Low-water mark of receiving buffers below which the pool grows.
    pub(crate) fn low_water(&self) -> usize {
        if self.test_buffer_pressure {
            0
        } else {
            self.buffer_group_size / 2
        }
    }
}
