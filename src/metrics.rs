//! Dispatch latency instrumentation.
//!
//! Latencies are recorded per payload-size bucket (log2 of the body
//! length). Embedders with their own telemetry pipelines implement
//! [`LatencySink`]; [`SizeHistogram`] is the built-in sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Number of size buckets (bucket = log2 of the payload length).
pub const NUM_SIZE_BUCKETS: usize = 32;

/// Map a payload length to its histogram bucket.
pub fn size_bucket(len: usize) -> usize {
    (len.max(1).ilog2() as usize).min(NUM_SIZE_BUCKETS - 1)
}

/// Sink for per-call dispatch latencies, keyed by payload-size bucket.
pub trait LatencySink: Send + Sync {
    /// Record one handled call.
    fn record(&self, bucket: usize, elapsed: Duration);
}

/// Sink that discards all samples.
pub struct NoopSink;

impl LatencySink for NoopSink {
    fn record(&self, _bucket: usize, _elapsed: Duration) {}
}

/// Latency histogram over power-of-two payload-size buckets.
#[derive(Default)]
pub struct SizeHistogram {
    counts: [AtomicU64; NUM_SIZE_BUCKETS],
    total_us: [AtomicU64; NUM_SIZE_BUCKETS],
}

impl SizeHistogram {
    /// Create an empty histogram.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of samples in a bucket.
    pub fn count(&self, bucket: usize) -> u64 {
        self.counts[bucket].load(Ordering::Relaxed)
    }

    /// Total samples across all buckets.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).sum()
    }

    /// Mean latency of a bucket in microseconds, if it has samples.
    pub fn mean_us(&self, bucket: usize) -> Option<u64> {
        let count = self.count(bucket);
        if count == 0 {
            return None;
        }
        Some(self.total_us[bucket].load(Ordering::Relaxed) / count)
    }
}

impl LatencySink for SizeHistogram {
    fn record(&self, bucket: usize, elapsed: Duration) {
        let bucket = bucket.min(NUM_SIZE_BUCKETS - 1);
        self.counts[bucket].fetch_add(1, Ordering::Relaxed);
        self.total_us[bucket].fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }
}
