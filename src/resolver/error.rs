//! Error types for domain resolution.

use thiserror::Error;

/// Errors from resolving a hostname to a canister.
///
/// `Clone` because one result is handed to every caller of a coalesced lookup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolverError {
    /// The TXT query failed for a reason other than "no such record".
    #[error("DNS lookup for {name} failed: {message}")]
    Dns {
        /// Queried record name.
        name: String,
        /// Resolver error message.
        message: String,
    },
}

/// Result type for resolver operations.
pub type ResolverResult<T> = Result<T, ResolverError>;
