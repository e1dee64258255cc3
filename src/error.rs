//! Error taxonomy for the cache subsystem.
//!
//! Decode failures are recovered inside the worker (fallback substitution) and
//! only surface here when the fallback itself is unusable. Transport failures
//! cover everything that goes wrong with a shared-memory segment. Channel
//! errors cover the framed pipe protocol.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by worker and manager operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// Source image missing or corrupt.
    #[error("failed to decode {path}: {reason}")]
    Decode { path: PathBuf, reason: String },

    /// A segment could not be created, opened, or mapped.
    #[error("segment {name}: {source}")]
    Transport {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The command/result channel failed.
    #[error(transparent)]
    Channel(#[from] ChannelError),

    /// Requested index is outside `0..count`.
    #[error("index {index} out of range (count={count})")]
    OutOfRange { index: usize, count: usize },

    /// Unexpected fault that ends the worker loop.
    #[error("worker fatal: {0}")]
    Fatal(String),
}

impl CacheError {
    pub(crate) fn transport(name: &str, source: io::Error) -> Self {
        Self::Transport {
            name: name.to_string(),
            source,
        }
    }
}

/// Errors raised by the framed message channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode message: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    #[error("protocol version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("frame of {len} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { len: usize, limit: usize },

    /// The peer hung up.
    #[error("channel closed")]
    Closed,
}
