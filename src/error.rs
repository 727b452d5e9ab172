//! Error types for the milter transport.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error returned by a dispatcher for a single payload.
///
/// Any error ends the connection that produced it.
pub type DispatchError = Box<dyn std::error::Error + Send + Sync>;

/// Framing violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Length prefix (or outbound payload) exceeds the allowed maximum.
    #[error("frame length {len} exceeds maximum {max}")]
    TooLarge { len: u64, max: u64 },
}

/// Failure that terminates a single connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed frame on the wire.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// The dispatcher returned an error.
    #[error("dispatcher failed: {0}")]
    Dispatch(DispatchError),

    /// The dispatcher panicked while handling a payload.
    #[error("dispatcher panicked: {0}")]
    Panic(String),

    /// Peer closed the socket with a partial frame buffered.
    #[error("peer closed connection mid-frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, #[source] io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("Invalid listen target '{0}': expected a port or socket address")]
    ListenTarget(String),
}
