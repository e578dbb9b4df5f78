//! Root and host certificate issuance on top of the [`CertificateStore`].
//!
//! # Issuance Rules
//!
//! - Every request maps to a logical id: `root_ca` or `<prefix>_<hostname>`.
//! - Get-or-create for an id runs under a per-id lock, so two first-time
//!   requests for the same hostname sign exactly once.
//! - Each attempt is retried with a rollback in between that deletes whatever
//!   the failed attempt may have left under the id.
//! - Issuing a new root re-signs every stored host certificate before the
//!   call returns.
//! - A stored host certificate is reused only while its Authority Key
//!   Identifier matches the root held by the factory. Host issuance runs
//!   under the root lock, so a host never gets signed by a root that a
//!   concurrent renewal is replacing.
//!
//! Keys are ECDSA P-256, signatures SHA-256, validity 365 days.

use super::certificate::Certificate;
use super::error::{CertificateError, CertificateResult};
use super::store::CertificateStore;
use crate::singleflight::KeyedLock;
use num_bigint::BigUint;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyIdMethod, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, PoisonError, RwLock};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

/// Logical id of the root certificate authority.
pub const ROOT_CA_ID: &str = "root_ca";

/// Validity of every issued certificate.
pub const CERT_VALIDITY_DAYS: i64 = 365;

/// Default number of retries after a failed attempt.
pub const DEFAULT_CREATION_RETRIES: u32 = 2;

/// Subject fields shared by every issued certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    /// Root CA common name.
    pub common_name: String,
    /// Organization (host certificates append `(<hostname>)`).
    pub organization_name: String,
    /// Organizational unit.
    pub organization_unit: String,
}

impl Default for CertificateIdentity {
    fn default() -> Self {
        Self {
            common_name: "IC HTTP Proxy Root Authority".to_string(),
            organization_name: "IC HTTP Proxy".to_string(),
            organization_unit: "IC".to_string(),
        }
    }
}

/// Factory settings.
#[derive(Debug, Clone)]
pub struct FactoryOptions {
    /// Subject fields.
    pub identity: CertificateIdentity,
    /// Prefix of host certificate ids.
    pub host_prefix: String,
    /// Extra attempts after the first failure.
    pub retries: u32,
}

impl Default for FactoryOptions {
    fn default() -> Self {
        Self {
            identity: CertificateIdentity::default(),
            host_prefix: "host".to_string(),
            retries: DEFAULT_CREATION_RETRIES,
        }
    }
}

/// What to issue.
#[derive(Debug, Clone)]
pub enum CertificateRequest {
    /// The self-signed root.
    RootCa,
    /// A leaf for `hostname`, signed by `ca`.
    Host {
        /// DNS name the certificate is valid for.
        hostname: String,
        /// Issuing authority. Once the factory has loaded or issued a root,
        /// that root signs instead.
        ca: Arc<Certificate>,
    },
}

impl CertificateRequest {
    /// Host certificate request; the hostname is lowercased.
    pub fn host(hostname: &str, ca: Arc<Certificate>) -> Self {
        CertificateRequest::Host {
            hostname: hostname.to_ascii_lowercase(),
            ca,
        }
    }

    /// Whether a stored certificate still satisfies this request.
    fn accepts(&self, existing: &Certificate) -> bool {
        match self {
            CertificateRequest::RootCa => true,
            CertificateRequest::Host { ca, .. } => existing.is_issued_by(ca),
        }
    }
}

/// Issues certificates and keeps the store consistent.
pub struct CertificateFactory {
    store: Arc<CertificateStore>,
    options: FactoryOptions,
    locks: KeyedLock<String>,
    root: RwLock<Option<Arc<Certificate>>>,
}

impl CertificateFactory {
    /// Create a factory over an opened store.
    pub fn new(store: Arc<CertificateStore>, options: FactoryOptions) -> Self {
        Self {
            store,
            options,
            locks: KeyedLock::new(),
            root: RwLock::new(None),
        }
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<CertificateStore> {
        &self.store
    }

    /// Factory settings.
    pub fn options(&self) -> &FactoryOptions {
        &self.options
    }

    /// Logical id for a host certificate.
    pub fn host_id(&self, hostname: &str) -> String {
        format!("{}_{}", self.options.host_prefix, hostname.to_ascii_lowercase())
    }

    /// Get or issue the certificate described by `request`.
    ///
    /// With `renew` set, an existing valid certificate is replaced.
    pub async fn create(
        &self,
        request: CertificateRequest,
        renew: bool,
    ) -> CertificateResult<Arc<Certificate>> {
        let id = self.certificate_id(&request)?;
        match request {
            CertificateRequest::RootCa => self.create_root(&id, renew).await,
            CertificateRequest::Host { hostname, ca } => {
                self.create_host(&id, hostname, ca, renew).await
            }
        }
    }

    /// Root the factory last loaded or issued.
    pub fn current_root(&self) -> Option<Arc<Certificate>> {
        self.root.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    async fn create_root(&self, id: &str, renew: bool) -> CertificateResult<Arc<Certificate>> {
        let _guard = self.locks.lock(id.to_string()).await;

        let request = CertificateRequest::RootCa;
        let (certificate, issued) = self
            .with_retries(id, || self.get_or_issue(id, &request, renew))
            .await?;
        *self.root.write().unwrap_or_else(PoisonError::into_inner) = Some(certificate.clone());

        if issued {
            self.reissue_hosts(&certificate).await?;
        }

        Ok(certificate)
    }

    async fn create_host(
        &self,
        id: &str,
        hostname: String,
        ca: Arc<Certificate>,
        renew: bool,
    ) -> CertificateResult<Arc<Certificate>> {
        if !renew {
            let _guard = self.locks.lock(id.to_string()).await;
            if let Ok(Some(existing)) = self.store.find(id).await {
                let signer = self.current_root().unwrap_or_else(|| ca.clone());
                if existing.is_issued_by(&signer) {
                    return Ok(existing);
                }
            }
        }

        // Root before host, the same order reissue_hosts takes them in.
        let _root = self.locks.lock(ROOT_CA_ID.to_string()).await;
        let ca = self.current_root().unwrap_or(ca);
        let request = CertificateRequest::Host { hostname, ca };
        let _guard = self.locks.lock(id.to_string()).await;

        let (certificate, _) = self
            .with_retries(id, || self.get_or_issue(id, &request, renew))
            .await?;
        Ok(certificate)
    }

    fn certificate_id(&self, request: &CertificateRequest) -> CertificateResult<String> {
        match request {
            CertificateRequest::RootCa => Ok(ROOT_CA_ID.to_string()),
            CertificateRequest::Host { hostname, .. } => {
                if hostname.is_empty()
                    || hostname.parse::<IpAddr>().is_ok()
                    || hostname.contains(['/', '\\'])
                {
                    return Err(CertificateError::UnsupportedType(format!(
                        "host certificate for {:?}",
                        hostname
                    )));
                }
                Ok(self.host_id(hostname))
            }
        }
    }

    async fn with_retries<F, Fut, T>(&self, id: &str, mut attempt: F) -> CertificateResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = CertificateResult<T>>,
    {
        let mut failures = 0;
        loop {
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            failures += 1;
            warn!(id = %id, attempt = failures, error = %err, "Certificate attempt failed");
            if let Err(e) = self.store.delete(id).await {
                warn!(id = %id, error = %e, "Rollback of failed certificate attempt failed");
            }

            if failures > self.options.retries {
                return Err(CertificateError::CreationFailed {
                    id: id.to_string(),
                    source: Box::new(err),
                });
            }
        }
    }

    /// Returns the certificate and whether it was freshly issued.
    async fn get_or_issue(
        &self,
        id: &str,
        request: &CertificateRequest,
        renew: bool,
    ) -> CertificateResult<(Arc<Certificate>, bool)> {
        if !renew
            && let Some(existing) = self.store.find(id).await?
            && request.accepts(&existing)
        {
            return Ok((existing, false));
        }

        let serial = self.store.next_serial_id().await?;
        let certificate = match request {
            CertificateRequest::RootCa => self.issue_root(id, &serial)?,
            CertificateRequest::Host { hostname, ca } => {
                self.issue_host(id, hostname, ca, &serial)?
            }
        };
        let certificate = Arc::new(certificate);
        self.store.save(certificate.clone()).await?;

        info!(id = %id, serial = %serial, "Issued certificate");
        Ok((certificate, true))
    }

    fn issue_root(&self, id: &str, serial: &str) -> CertificateResult<Certificate> {
        let identity = &self.options.identity;
        let key_pair = generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, identity.common_name.as_str());
        dn.push(DnType::OrganizationName, identity.organization_name.as_str());
        dn.push(DnType::OrganizationalUnitName, identity.organization_unit.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsagePurpose::TimeStamping,
        ];
        params.serial_number = Some(serial_number(serial)?);
        set_validity(&mut params);

        let cert = params.self_signed(&key_pair)?;
        Certificate::new(id, key_pair, cert.pem())
    }

    fn issue_host(
        &self,
        id: &str,
        hostname: &str,
        ca: &Certificate,
        serial: &str,
    ) -> CertificateResult<Certificate> {
        let identity = &self.options.identity;
        let key_pair = generate_key_pair()?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, hostname);
        dn.push(
            DnType::OrganizationName,
            format!("{} ({})", identity.organization_name, hostname),
        );
        dn.push(DnType::OrganizationalUnitName, identity.organization_unit.as_str());
        params.distinguished_name = dn;

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = vec![
            SanType::DnsName(
                hostname
                    .try_into()
                    .map_err(|e| CertificateError::Signing(format!("{}: {}", hostname, e)))?,
            ),
            SanType::IpAddress(IpAddr::V4(Ipv4Addr::LOCALHOST)),
        ];
        params.key_identifier_method = KeyIdMethod::Sha256;
        params.use_authority_key_identifier_extension = true;
        params.serial_number = Some(serial_number(serial)?);
        set_validity(&mut params);

        let issuer = ca.issuer()?;
        let cert = params.signed_by(&key_pair, &issuer)?;
        Certificate::new(id, key_pair, cert.pem())
    }

    /// Re-sign every stored host certificate under `ca`.
    ///
    /// A host that fails is rolled back so it is issued again on first use.
    async fn reissue_hosts(&self, ca: &Arc<Certificate>) -> CertificateResult<usize> {
        let prefix = format!("{}_", self.options.host_prefix);
        let mut reissued = 0;

        for id in self.store.issued_certificate_ids().await? {
            let Some(hostname) = id.strip_prefix(&prefix) else {
                continue;
            };
            let request = CertificateRequest::host(hostname, ca.clone());
            let _guard = self.locks.lock(id.clone()).await;

            match self
                .with_retries(&id, || self.get_or_issue(&id, &request, true))
                .await
            {
                Ok(_) => reissued += 1,
                Err(e) => warn!(id = %id, error = %e, "Failed to re-sign host certificate"),
            }
        }

        debug!(reissued, "Re-signed host certificates under new root");
        Ok(reissued)
    }
}

fn generate_key_pair() -> CertificateResult<KeyPair> {
    KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
        .map_err(|e| CertificateError::KeyGeneration(e.to_string()))
}

fn serial_number(serial: &str) -> CertificateResult<SerialNumber> {
    let value: BigUint = serial
        .parse()
        .map_err(|_| CertificateError::InvalidSerial(serial.to_string()))?;
    Ok(SerialNumber::from_slice(&value.to_bytes_be()))
}

fn set_validity(params: &mut CertificateParams) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;
    use x509_parser::extensions::GeneralName;
    use x509_parser::pem::parse_x509_pem;

    async fn factory(dir: &std::path::Path) -> CertificateFactory {
        let store = Arc::new(CertificateStore::open(dir).await.unwrap());
        CertificateFactory::new(store, FactoryOptions::default())
    }

    fn san_entries(pem: &str) -> (Vec<String>, Vec<Vec<u8>>) {
        let (_, pem) = parse_x509_pem(pem.as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        let mut dns = Vec::new();
        let mut ips = Vec::new();
        for name in &san.value.general_names {
            match name {
                GeneralName::DNSName(d) => dns.push(d.to_string()),
                GeneralName::IPAddress(ip) => ips.push(ip.to_vec()),
                _ => {}
            }
        }
        (dns, ips)
    }

    #[tokio::test]
    async fn test_root_ca_is_idempotent() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;

        let first = factory.create(CertificateRequest::RootCa, false).await.unwrap();
        let second = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        assert_eq!(first.id(), ROOT_CA_ID);
        assert_eq!(first.id(), second.id());
        assert_eq!(first.pem(), second.pem());
    }

    #[tokio::test]
    async fn test_root_ca_subject_and_constraints() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        let (_, pem) = parse_x509_pem(ca.pem().as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(cert.is_ca());
        assert_eq!(cert.subject(), cert.issuer());
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "IC HTTP Proxy Root Authority");

        let validity = ca.not_after() - ca.not_before();
        assert_eq!(validity.whole_days(), CERT_VALIDITY_DAYS);
    }

    #[tokio::test]
    async fn test_host_certificate_contents() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        let host = factory
            .create(CertificateRequest::host("Example.IC0.app", ca.clone()), false)
            .await
            .unwrap();

        assert_eq!(host.id(), "host_example.ic0.app");
        let (dns, ips) = san_entries(host.pem());
        assert_eq!(dns, vec!["example.ic0.app"]);
        assert_eq!(ips, vec![vec![127, 0, 0, 1]]);

        let (_, pem) = parse_x509_pem(host.pem().as_bytes()).unwrap();
        let cert = pem.parse_x509().unwrap();
        assert!(!cert.is_ca());
        let (_, ca_pem) = parse_x509_pem(ca.pem().as_bytes()).unwrap();
        let ca_cert = ca_pem.parse_x509().unwrap();
        assert_eq!(cert.issuer(), ca_cert.subject());
    }

    #[tokio::test]
    async fn test_host_certificate_key_identifiers() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();
        let host = factory
            .create(CertificateRequest::host("keys.example", ca.clone()), false)
            .await
            .unwrap();

        let ca_ski = ca.subject_key_id().unwrap();
        assert!(host.subject_key_id().is_some());
        assert_ne!(host.subject_key_id(), Some(ca_ski));
        assert_eq!(host.authority_key_id(), Some(ca_ski));
        assert!(host.is_issued_by(&ca));
    }

    #[tokio::test]
    async fn test_host_from_another_root_is_reissued() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        let other_dir = tempdir().unwrap();
        let other = self::factory(other_dir.path()).await;
        let other_ca = other.create(CertificateRequest::RootCa, false).await.unwrap();
        let foreign = other
            .create(CertificateRequest::host("moved.example", other_ca), false)
            .await
            .unwrap();
        std::fs::copy(
            other_dir.path().join("host_moved.example.json"),
            dir.path().join("host_moved.example.json"),
        )
        .unwrap();

        let served = factory
            .create(CertificateRequest::host("moved.example", ca.clone()), false)
            .await
            .unwrap();
        assert_ne!(served.pem(), foreign.pem());
        assert!(served.is_issued_by(&ca));
    }

    #[tokio::test]
    async fn test_host_certificate_is_reused() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        let first = factory
            .create(CertificateRequest::host("a.example", ca.clone()), false)
            .await
            .unwrap();
        let second = factory
            .create(CertificateRequest::host("a.example", ca.clone()), false)
            .await
            .unwrap();
        assert_eq!(first.pem(), second.pem());

        let renewed = factory
            .create(CertificateRequest::host("a.example", ca), true)
            .await
            .unwrap();
        assert_ne!(first.pem(), renewed.pem());
    }

    #[tokio::test]
    async fn test_concurrent_first_requests_sign_once() {
        let dir = tempdir().unwrap();
        let factory = Arc::new(factory(dir.path()).await);
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..6 {
            let factory = factory.clone();
            let ca = ca.clone();
            handles.push(tokio::spawn(async move {
                factory
                    .create(CertificateRequest::host("burst.example", ca), false)
                    .await
                    .unwrap()
                    .pem()
                    .to_string()
            }));
        }

        let mut pems = Vec::new();
        for handle in handles {
            pems.push(handle.await.unwrap());
        }
        pems.dedup();
        assert_eq!(pems.len(), 1);

        // root + one host
        let serial = std::fs::read_to_string(dir.path().join("serial")).unwrap();
        assert_eq!(serial, "2");
    }

    #[tokio::test]
    async fn test_root_renewal_reissues_hosts() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();
        let host = factory
            .create(CertificateRequest::host("cascade.example", ca.clone()), false)
            .await
            .unwrap();

        let new_ca = factory.create(CertificateRequest::RootCa, true).await.unwrap();
        assert_ne!(ca.pem(), new_ca.pem());

        let after = factory.store().find("host_cascade.example").await.unwrap().unwrap();
        assert_ne!(after.pem(), host.pem());

        // Served without renew, the re-signed certificate is reused.
        let served = factory
            .create(CertificateRequest::host("cascade.example", new_ca), false)
            .await
            .unwrap();
        assert_eq!(served.pem(), after.pem());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_rolled_back_and_reissued() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        std::fs::write(dir.path().join("root_ca.json"), "{ not json").unwrap();

        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();
        assert_eq!(ca.id(), ROOT_CA_ID);
        assert!(factory.store().find(ROOT_CA_ID).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unsupported_host_requests() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        for hostname in ["", "127.0.0.1", "a/b"] {
            let result = factory
                .create(CertificateRequest::host(hostname, ca.clone()), false)
                .await;
            assert!(matches!(result, Err(CertificateError::UnsupportedType(_))));
        }
    }

    #[tokio::test]
    async fn test_creation_failure_after_retries() {
        let dir = tempdir().unwrap();
        let factory = factory(dir.path()).await;
        let ca = factory.create(CertificateRequest::RootCa, false).await.unwrap();

        // Not representable as an IA5 DNS name.
        let result = factory
            .create(CertificateRequest::host("bücher.example", ca), false)
            .await;

        match result {
            Err(CertificateError::CreationFailed { id, .. }) => {
                assert_eq!(id, "host_bücher.example");
            }
            other => panic!("expected CreationFailed, got {:?}", other.map(|c| c.id().to_string())),
        }
        assert!(!dir.path().join("host_bücher.example.json").exists());
    }
}
