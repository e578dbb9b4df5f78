//! Certificate authority, host certificate issuance and storage.
//!
//! # Components
//!
//! - [`CertificateStore`]: `<id>.cert` / `<id>.json` files plus the serial
//!   counter, fronted by a 5 minute cache.
//! - [`CertificateFactory`]: issues the root CA and per-host leaves, with
//!   retries, rollback and the renewal cascade.
//! - [`ActiveCertificates`]: the root and `localhost` certificates the running
//!   listeners present, swapped on renewal.
//!
//! # Example
//!
//! ```ignore
//! use ic_http_proxy::tls::{ActiveCertificates, CertificateFactory, CertificateStore, FactoryOptions};
//! use std::sync::Arc;
//!
//! let store = Arc::new(CertificateStore::open("/var/lib/ic-http-proxy/certs").await?);
//! let factory = Arc::new(CertificateFactory::new(store, FactoryOptions::default()));
//! let active = ActiveCertificates::bootstrap(factory).await?;
//!
//! // Presented for SNI "nns.ic0.app"
//! let cert = active.certificate_for(Some("nns.ic0.app")).await?;
//! ```

pub mod active;
pub mod certificate;
pub mod error;
pub mod factory;
pub mod store;

pub use active::{ActiveCertificates, DEFAULT_HOSTNAME};
pub use certificate::{Certificate, CertificateRecord, PemRecord};
pub use error::{CertificateError, CertificateResult};
pub use factory::{
    CertificateFactory, CertificateIdentity, CertificateRequest, FactoryOptions, ROOT_CA_ID,
};
pub use store::CertificateStore;
