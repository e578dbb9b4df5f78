//! Error types for certificate issuance and storage.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the certificate store and factory.
#[derive(Debug, Error)]
pub enum CertificateError {
    /// The request shape is not something the factory knows how to issue.
    #[error("Unsupported certificate type: {0}")]
    UnsupportedType(String),

    /// Issuance failed after every retry was exhausted.
    #[error("Certificate creation failed for {id}: {source}")]
    CreationFailed {
        /// Logical id of the certificate being created.
        id: String,
        /// The error from the final attempt.
        #[source]
        source: Box<CertificateError>,
    },

    /// Key pair generation failed.
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Building or signing the certificate failed.
    #[error("Certificate signing failed: {0}")]
    Signing(String),

    /// Stored PEM material could not be parsed.
    #[error("Failed to parse certificate material: {0}")]
    Parse(String),

    /// Reading a file from the store failed.
    #[error("Failed to read {path}: {source}")]
    ReadFile {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Writing a file to the store failed.
    #[error("Failed to write {path}: {source}")]
    WriteFile {
        /// The file that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Removing a file from the store failed.
    #[error("Failed to remove {path}: {source}")]
    RemoveFile {
        /// The file that could not be removed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The DTO file did not deserialize.
    #[error("Invalid certificate record: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored serial number is not a decimal integer.
    #[error("Invalid serial number {0:?}")]
    InvalidSerial(String),

    /// Converting the certificate into rustls types failed.
    #[error("TLS error: {0}")]
    Tls(String),
}

/// Result type for certificate operations.
pub type CertificateResult<T> = Result<T, CertificateError>;

impl From<rcgen::Error> for CertificateError {
    fn from(err: rcgen::Error) -> Self {
        CertificateError::Signing(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_failed_keeps_cause() {
        let err = CertificateError::CreationFailed {
            id: "host_example.com".to_string(),
            source: Box::new(CertificateError::Signing("bad key".to_string())),
        };
        assert!(err.to_string().contains("host_example.com"));
        let source = std::error::Error::source(&err).unwrap();
        assert!(source.to_string().contains("bad key"));
    }

    #[test]
    fn test_unsupported_type_display() {
        let err = CertificateError::UnsupportedType("intermediate".to_string());
        assert_eq!(err.to_string(), "Unsupported certificate type: intermediate");
    }
}
