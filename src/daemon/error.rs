//! Daemon error types.

use super::platform::PlatformError;
use crate::control::SocketError;
use thiserror::Error;

/// Errors from the daemon and from talking to it.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The secure environment cannot be set up.
    #[error("Missing requirements: {0}")]
    MissingRequirements(String),

    /// System integration failed.
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    /// The control socket failed.
    #[error("IPC error: {0}")]
    Socket(#[from] SocketError),

    /// The daemon process could not be started.
    #[error("Failed to spawn daemon {cmd}: {source}")]
    Spawn {
        /// Command line.
        cmd: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A message payload did not have the expected shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),
}

/// Result alias for daemon operations.
pub type DaemonResult<T> = Result<T, DaemonError>;
