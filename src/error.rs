//! Error types for the service engine.

use crate::transport::TransportError;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for service-engine operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Transport collaborator failure.
    ///
    /// Only surfaced from startup paths; runtime registration failures are
    /// retried with backoff and never escalate.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Invalid magic number in a wire message header.
    #[error("invalid magic: expected {expected:#x}, got {got:#x}")]
    InvalidMagic { expected: u32, got: u32 },

    /// Unsupported wire protocol version.
    #[error("unsupported message version: {0}")]
    InvalidVersion(u8),

    /// Invalid message type byte.
    #[error("invalid message type: {0}")]
    InvalidMsgType(u8),

    /// Message shorter than its header or declared body length.
    #[error("message truncated: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    /// Failed to spawn a worker thread at startup.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(#[from] std::io::Error),
}
