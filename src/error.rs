//! Error types for the sink library

use std::path::PathBuf;

/// Errors raised by the buffer pool, the frame channel and the session.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system call failed: {0}")]
    Errno(#[from] nix::errno::Errno),

    #[error("runtime directory is not set ({0})")]
    NoRuntimeDir(&'static str),

    #[error("socket path {path:?} is too long ({len} bytes, max {max})")]
    SocketPathTooLong { path: PathBuf, len: usize, max: usize },

    #[error("unable to connect to video server at {path:?}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plane allocation failed for {width}x{height}: {reason}")]
    Allocation {
        width: u32,
        height: u32,
        reason: String,
    },

    #[error("buffer index {0} out of range")]
    BadBufferIndex(usize),

    #[error("buffer {0} is still locked")]
    BufferLocked(usize),

    #[error("short send: {sent} of {expected} bytes")]
    ShortSend { sent: usize, expected: usize },

    #[error("frame holds {got} bytes, layout needs {expected}")]
    ShortFrame { got: usize, expected: usize },

    #[error("no video info set")]
    NoVideoInfo,

    #[error("unsupported pixel format {0:?}")]
    UnsupportedFormat(String),

    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T, E = SinkError> = std::result::Result<T, E>;
