//! Error types for the Poliqarp client.
//!
//! Errors fall into four groups:
//!
//! - server errors: the server answered with `ERR <code>`
//! - client-side validation: rejected before anything is written to the socket
//! - transport: socket failures, fatal to the connection
//! - unsupported features

use std::time::Duration;

use thiserror::Error;

use crate::ipc::ServerErrorCode;

/// Result alias used throughout the library.
pub type Result<T, E = PoliqarpError> = std::result::Result<T, E>;

/// Errors produced by the Poliqarp client.
#[derive(Debug, Error)]
pub enum PoliqarpError {
    /// Server replied with an error code.
    #[error("Server error {code}: {message}")]
    Server {
        /// Numeric poliqarpd error code
        code: u16,
        /// Description from the code table
        message: String,
    },

    /// Server is still running a previous job (code 15).
    ///
    /// The query engine recovers from this by cancelling and resubmitting,
    /// so callers of `Client` only see it from raw connector calls.
    #[error("A job is already in progress")]
    JobInProgress,

    /// Excerpt index lies outside the job's result buffer.
    #[error("Index {index} out of bounds for result buffer of {capacity}")]
    IndexOutOfBounds { index: u64, capacity: u64 },

    /// Rejected configuration value.
    #[error("Invalid configuration value: {0}")]
    InvalidConfig(String),

    /// The default corpus was requested but no location is configured.
    #[error("No default corpus configured (set POLIQARP_DEFAULT_CORPUS)")]
    NoDefaultCorpus,

    /// Feature acknowledged by the protocol but not supported here.
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),

    /// Failed to connect to the server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),

    /// The receive loop has stopped; the connection is dead.
    #[error("Connection closed by server")]
    ConnectionClosed,

    /// Malformed line or unexpected reply shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Waiting for a job milestone exceeded the configured bound.
    #[error("Timed out after {0:?} waiting for the server")]
    Timeout(Duration),
}

impl PoliqarpError {
    /// Build the error for an `ERR <code>` reply.
    pub fn from_code(code: u16) -> Self {
        match ServerErrorCode::from_code(code) {
            Some(ServerErrorCode::JobInProgress) => PoliqarpError::JobInProgress,
            Some(known) => PoliqarpError::Server {
                code,
                message: known.description().to_string(),
            },
            None => PoliqarpError::Server {
                code,
                message: "Unknown error".to_string(),
            },
        }
    }

    /// Whether the connection can no longer be used.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            PoliqarpError::ConnectionFailed(_)
                | PoliqarpError::Io(_)
                | PoliqarpError::ConnectionClosed
        )
    }
}

impl From<std::io::Error> for PoliqarpError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
                PoliqarpError::ConnectionFailed(err)
            }
            std::io::ErrorKind::UnexpectedEof => PoliqarpError::ConnectionClosed,
            _ => PoliqarpError::Io(err),
        }
    }
}
