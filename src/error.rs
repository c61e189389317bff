//! Error types for the query server and connector.
//!
//! Every failure is contained at the boundary that produced it: frame and
//! connection errors end one connection, server errors come from the
//! listener, and connector errors are returned to the caller.

use std::io;
use std::path::PathBuf;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;

/// Errors reading a length-prefixed frame off a stream.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid frame length header")]
    InvalidLength,

    #[error("frame of {length} bytes exceeds limit of {max} bytes")]
    TooLarge { length: usize, max: usize },

    #[error("stream ended in the middle of a frame")]
    UnexpectedEof,
}

/// Listener errors.
#[derive(Error, Debug)]
pub enum ServerError {
    /// The listener could not acquire its address. Fatal to startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// A single accept attempt failed. The accept loop keeps running.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
}

/// Failures that end one server-side connection.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("receive failed: {0}")]
    Receive(#[source] FrameError),

    #[error("request is not valid UTF-8: {0}")]
    Decode(#[source] Utf8Error),

    #[error("send failed: {0}")]
    Send(#[source] io::Error),
}

/// Client-side connect failures.
#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("connection to {addr} refused")]
    Refused {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to connect to {addr}: {source}")]
    Other {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("timed out connecting to {addr}")]
    Timeout { addr: String },
}

impl ConnectError {
    /// Short failure kind for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectError::Refused { .. } => "refused",
            ConnectError::Other { .. } | ConnectError::Timeout { .. } => "other",
        }
    }

    pub fn is_refused(&self) -> bool {
        matches!(self, ConnectError::Refused { .. })
    }
}

/// Client-side execute failures.
///
/// Every variant except `NotConnected` leaves the connector closed.
#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("not connected")]
    NotConnected,

    #[error("failed to send request: {0}")]
    Send(#[source] io::Error),

    #[error("failed to receive response: {0}")]
    Receive(#[source] FrameError),

    #[error("server closed the connection before responding")]
    Closed,

    #[error("response is not valid UTF-8: {0}")]
    Decode(#[source] Utf8Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),
}

impl ExecuteError {
    pub fn is_not_connected(&self) -> bool {
        matches!(self, ExecuteError::NotConnected)
    }
}

/// Configuration loading errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),

    #[error("port must be between 1 and 65535, got {0}")]
    InvalidPort(u16),

    #[error("invalid socket address '{0}'")]
    InvalidAddress(String),

    #[error("invalid configuration: {0}")]
    InvalidValue(&'static str),
}
