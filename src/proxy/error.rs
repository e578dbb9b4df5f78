//! Error types for proxy operations.
//!
//! This module defines structured error types for the listeners:
//! - Connection errors (classification, upstream connection, forwarding)
//! - TLS errors (handshake, certificate lookup)
//! - Gateway errors (canister resolution, IC request forwarding)

use crate::resolver::ResolverError;
use crate::tls::CertificateError;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Malformed HTTP request or response.
    #[error("Invalid HTTP message: {0}")]
    InvalidHttp(String),

    /// The first chunk names no routable host.
    #[error("Unable to determine the target host of the connection")]
    MissingHost,

    /// Invalid port in an authority.
    #[error("Invalid port: {0}")]
    InvalidPort(String),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Certificate lookup or issuance failed.
    #[error("Certificate error: {0}")]
    Certificate(#[from] CertificateError),

    /// Canister resolution failed.
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// The gateway received a request for a host that maps to no canister.
    #[error("Canister not found for {0}")]
    CanisterNotFound(String),

    /// Failed to reach an upstream server.
    #[error("Failed to connect to upstream '{addr}': {message}")]
    Upstream {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },
}

/// Result type for proxy operations.
pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}

impl From<hyper::http::Error> for ProxyError {
    fn from(err: hyper::http::Error) -> Self {
        ProxyError::InvalidHttp(err.to_string())
    }
}

impl ProxyError {
    /// True for resets and half-closed peers, which are routine for proxies.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionAborted
            ),
            ProxyError::Http(e) => e.is_incomplete_message() || e.is_canceled(),
            _ => false,
        }
    }
}
