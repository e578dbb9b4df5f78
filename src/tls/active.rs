//! The certificates currently in use by the running proxy.
//!
//! Holds the root CA and the `localhost` fallback certificate. Both are
//! swapped in place when the root is renewed, so listeners pick up the new
//! chain on their next handshake without a restart.

use super::certificate::Certificate;
use super::error::CertificateResult;
use super::factory::{CertificateFactory, CertificateRequest};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info};

/// Hostname of the certificate served to clients that send no SNI.
pub const DEFAULT_HOSTNAME: &str = "localhost";

/// Shared handle to the active root and default certificates.
pub struct ActiveCertificates {
    factory: Arc<CertificateFactory>,
    ca: RwLock<Arc<Certificate>>,
    default: RwLock<Arc<Certificate>>,
}

impl ActiveCertificates {
    /// Load or issue the root CA and the default certificate.
    pub async fn bootstrap(factory: Arc<CertificateFactory>) -> CertificateResult<Self> {
        let ca = factory.create(CertificateRequest::RootCa, false).await?;
        let default = factory
            .create(CertificateRequest::host(DEFAULT_HOSTNAME, ca.clone()), false)
            .await?;

        info!(
            ca_not_after = %ca.not_after(),
            path = %factory.store().certificate_path(ca.id()).display(),
            "Certificate authority ready"
        );

        Ok(Self {
            factory,
            ca: RwLock::new(ca),
            default: RwLock::new(default),
        })
    }

    /// The issuing factory.
    pub fn factory(&self) -> &Arc<CertificateFactory> {
        &self.factory
    }

    /// Current root CA.
    pub fn ca(&self) -> Arc<Certificate> {
        self.ca.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current fallback certificate.
    pub fn default_certificate(&self) -> Arc<Certificate> {
        self.default
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Certificate to present for an SNI value, issuing it on first use.
    pub async fn certificate_for(&self, server_name: Option<&str>) -> CertificateResult<Arc<Certificate>> {
        match server_name {
            Some(name) if !name.eq_ignore_ascii_case(DEFAULT_HOSTNAME) => {
                self.factory
                    .create(CertificateRequest::host(name, self.ca()), false)
                    .await
            }
            _ => Ok(self.default_certificate()),
        }
    }

    /// Renew the root if it is inside its renewal buffer.
    ///
    /// Returns `true` when a new root was issued.
    pub async fn renew_if_needed(&self) -> CertificateResult<bool> {
        if !self.ca().should_renew() {
            debug!("Root certificate does not need renewal");
            return Ok(false);
        }
        self.renew().await?;
        Ok(true)
    }

    /// Force a new root, re-sign host certificates and swap both handles.
    pub async fn renew(&self) -> CertificateResult<()> {
        let ca = self.factory.create(CertificateRequest::RootCa, true).await?;
        let default = self
            .factory
            .create(CertificateRequest::host(DEFAULT_HOSTNAME, ca.clone()), false)
            .await?;

        *self.ca.write().unwrap_or_else(PoisonError::into_inner) = ca;
        *self.default.write().unwrap_or_else(PoisonError::into_inner) = default;
        info!("Root certificate renewed");

        Ok(())
    }

    /// Path of the root certificate PEM file handed to the trust store.
    pub fn ca_path(&self) -> std::path::PathBuf {
        self.factory.store().certificate_path(self.ca().id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tls::factory::FactoryOptions;
    use crate::tls::store::CertificateStore;
    use tempfile::tempdir;

    async fn active(dir: &std::path::Path) -> ActiveCertificates {
        let store = Arc::new(CertificateStore::open(dir).await.unwrap());
        let factory = Arc::new(CertificateFactory::new(store, FactoryOptions::default()));
        ActiveCertificates::bootstrap(factory).await.unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_issues_ca_and_default() {
        let dir = tempdir().unwrap();
        let active = active(dir.path()).await;

        assert_eq!(active.ca().id(), "root_ca");
        assert_eq!(active.default_certificate().id(), "host_localhost");
        assert!(active.ca_path().ends_with("root_ca.cert"));
        assert!(active.ca_path().exists());
    }

    #[tokio::test]
    async fn test_certificate_for_falls_back_without_sni() {
        let dir = tempdir().unwrap();
        let active = active(dir.path()).await;

        let none = active.certificate_for(None).await.unwrap();
        assert_eq!(none.id(), "host_localhost");

        let named = active.certificate_for(Some("nns.ic0.app")).await.unwrap();
        assert_eq!(named.id(), "host_nns.ic0.app");
    }

    #[tokio::test]
    async fn test_renew_swaps_handles() {
        let dir = tempdir().unwrap();
        let active = active(dir.path()).await;
        let old_ca = active.ca();
        let old_default = active.default_certificate();

        assert!(!active.renew_if_needed().await.unwrap());
        active.renew().await.unwrap();

        assert_ne!(active.ca().pem(), old_ca.pem());
        assert_ne!(active.default_certificate().pem(), old_default.pem());
    }

    #[tokio::test]
    async fn test_host_issued_during_renewal_chains_to_new_root() {
        let dir = tempdir().unwrap();
        let active = active(dir.path()).await;
        let old_ca = active.ca();

        let (renewed, during) = tokio::join!(
            active.renew(),
            active.certificate_for(Some("late.example"))
        );
        renewed.unwrap();
        during.unwrap();

        let ca = active.ca();
        assert_ne!(ca.pem(), old_ca.pem());
        let late = active.certificate_for(Some("late.example")).await.unwrap();
        assert!(ca.subject_key_id().is_some());
        assert_eq!(late.authority_key_id(), ca.subject_key_id());
        assert!(active.default_certificate().is_issued_by(&ca));
    }
}
