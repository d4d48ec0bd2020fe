use std::io;

use thiserror::Error;

/// Errors returned by the socket engine.
///
/// Completion-path failures (a peer resetting, a read error on a worker
/// thread) never surface here: they close the affected connection locally.
/// Only synchronous failures at the call site are reported.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The shared arena has no chunk left to bind to a new I/O context.
    #[error("no more space available in the shared arena ({chunks} chunks)")]
    ArenaExhausted { chunks: usize },
    /// A message body is larger than the configured maximum.
    #[error("message of {len} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("connection closed")]
    ConnectionClosed,
    #[error("socket is not connected")]
    NotConnected,
    #[error("invalid operation: {0}")]
    InvalidOperation(&'static str),
    #[error("invalid address `{0}`: expected protocol://host:port")]
    InvalidAddress(String),
    #[error("unsupported protocol `{0}`")]
    UnsupportedProtocol(String),
    #[error("could not resolve `{0}`")]
    Unresolvable(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    /// The engine owning this socket has been shut down.
    #[error("engine is stopped")]
    EngineStopped,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
