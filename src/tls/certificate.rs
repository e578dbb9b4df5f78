//! Issued certificate material and its on-disk record format.
//!
//! A [`Certificate`] bundles the PEM certificate body, its key pair and the
//! validity window parsed back out of the DER. The key pair stays in memory as
//! an [`rcgen::KeyPair`] so a root certificate can sign host certificates
//! without re-parsing its key.
//!
//! # Record Format
//!
//! The JSON record written next to each `<id>.cert` file:
//!
//! ```json
//! {"id": "host_example.com", "pem": {"key": "...", "publicKey": "...", "cert": "..."}}
//! ```

use super::error::{CertificateError, CertificateResult};
use rcgen::{Issuer, KeyPair};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use time::{Duration, OffsetDateTime};
use x509_parser::extensions::ParsedExtension;

/// Certificates whose `notAfter` falls inside this window are treated as expired.
pub const RENEW_BUFFER: Duration = Duration::minutes(10);

/// PEM fields of a stored certificate record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PemRecord {
    /// PKCS#8 private key.
    pub key: String,
    /// SubjectPublicKeyInfo.
    pub public_key: String,
    /// The X.509 certificate.
    pub cert: String,
}

/// Serializable form of a [`Certificate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateRecord {
    /// Logical id (`root_ca`, `host_<hostname>`).
    pub id: String,
    /// PEM material.
    pub pem: PemRecord,
}

/// An issued X.509 certificate plus its key pair.
pub struct Certificate {
    id: String,
    key_pair: KeyPair,
    key_pem: String,
    public_key_pem: String,
    cert_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    subject_key_id: Option<Vec<u8>>,
    authority_key_id: Option<Vec<u8>>,
    certified: OnceLock<Arc<CertifiedKey>>,
}

impl Certificate {
    /// Wrap freshly issued material.
    pub fn new(id: impl Into<String>, key_pair: KeyPair, cert_pem: String) -> CertificateResult<Self> {
        let key_pem = key_pair.serialize_pem();
        let public_key_pem = key_pair.public_key_pem();
        Self::from_parts(id.into(), key_pair, key_pem, public_key_pem, cert_pem)
    }

    /// Rebuild a certificate from its stored record.
    pub fn restore(record: CertificateRecord) -> CertificateResult<Self> {
        let key_pair = KeyPair::from_pem(&record.pem.key)
            .map_err(|e| CertificateError::Parse(format!("private key of {}: {}", record.id, e)))?;
        Self::from_parts(
            record.id,
            key_pair,
            record.pem.key,
            record.pem.public_key,
            record.pem.cert,
        )
    }

    fn from_parts(
        id: String,
        key_pair: KeyPair,
        key_pem: String,
        public_key_pem: String,
        cert_pem: String,
    ) -> CertificateResult<Self> {
        let details = parse_details(&cert_pem)?;
        Ok(Self {
            id,
            key_pair,
            key_pem,
            public_key_pem,
            cert_pem,
            not_before: details.not_before,
            not_after: details.not_after,
            subject_key_id: details.subject_key_id,
            authority_key_id: details.authority_key_id,
            certified: OnceLock::new(),
        })
    }

    /// Convert into the stored record.
    pub fn to_record(&self) -> CertificateRecord {
        CertificateRecord {
            id: self.id.clone(),
            pem: PemRecord {
                key: self.key_pem.clone(),
                public_key: self.public_key_pem.clone(),
                cert: self.cert_pem.clone(),
            },
        }
    }

    /// Logical id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// PEM encoded certificate body.
    pub fn pem(&self) -> &str {
        &self.cert_pem
    }

    /// PEM encoded private key.
    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// PEM encoded public key.
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Subject Key Identifier extension, if present.
    pub fn subject_key_id(&self) -> Option<&[u8]> {
        self.subject_key_id.as_deref()
    }

    /// Key identifier of the Authority Key Identifier extension, if present.
    pub fn authority_key_id(&self) -> Option<&[u8]> {
        self.authority_key_id.as_deref()
    }

    /// Whether `ca` is the authority that signed this certificate, matched
    /// by key identifier. Certificates without the identifiers never match.
    pub fn is_issued_by(&self, ca: &Certificate) -> bool {
        match (self.authority_key_id(), ca.subject_key_id()) {
            (Some(authority), Some(subject)) => authority == subject,
            _ => false,
        }
    }

    /// True once `notAfter` is within [`RENEW_BUFFER`] of now.
    pub fn should_renew(&self) -> bool {
        self.should_renew_at(OffsetDateTime::now_utc())
    }

    /// [`Certificate::should_renew`] evaluated against an explicit clock.
    pub fn should_renew_at(&self, now: OffsetDateTime) -> bool {
        self.not_after <= now + RENEW_BUFFER
    }

    /// Signing handle used when this certificate acts as a CA.
    pub fn issuer(&self) -> CertificateResult<Issuer<'static, &KeyPair>> {
        Issuer::from_ca_cert_pem(&self.cert_pem, &self.key_pair).map_err(CertificateError::from)
    }

    /// The certificate and key as a rustls [`CertifiedKey`], built once and memoized.
    pub fn certified_key(&self) -> CertificateResult<Arc<CertifiedKey>> {
        if let Some(key) = self.certified.get() {
            return Ok(key.clone());
        }
        let key = Arc::new(build_certified_key(&self.cert_pem, &self.key_pem)?);
        Ok(self.certified.get_or_init(|| key).clone())
    }
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("id", &self.id)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// Fields read back out of the DER.
struct CertificateDetails {
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    subject_key_id: Option<Vec<u8>>,
    authority_key_id: Option<Vec<u8>>,
}

fn parse_details(cert_pem: &str) -> CertificateResult<CertificateDetails> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CertificateError::Parse(format!("certificate PEM: {}", e)))?;
    let x509 = pem
        .parse_x509()
        .map_err(|e| CertificateError::Parse(format!("certificate DER: {}", e)))?;

    let mut subject_key_id = None;
    let mut authority_key_id = None;
    for extension in x509.extensions() {
        match extension.parsed_extension() {
            ParsedExtension::SubjectKeyIdentifier(id) => subject_key_id = Some(id.0.to_vec()),
            ParsedExtension::AuthorityKeyIdentifier(aki) => {
                authority_key_id = aki.key_identifier.as_ref().map(|id| id.0.to_vec());
            }
            _ => {}
        }
    }

    let validity = x509.validity();
    Ok(CertificateDetails {
        not_before: validity.not_before.to_datetime(),
        not_after: validity.not_after.to_datetime(),
        subject_key_id,
        authority_key_id,
    })
}

fn build_certified_key(cert_pem: &str, key_pem: &str) -> CertificateResult<CertifiedKey> {
    let cert_chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertificateError::Tls(format!("Failed to parse certificate PEM: {}", e)))?;

    if cert_chain.is_empty() {
        return Err(CertificateError::Tls("No certificates found in PEM".into()));
    }

    let private_key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertificateError::Tls(format!("Failed to parse private key PEM: {}", e)))?
        .ok_or_else(|| CertificateError::Tls("No private key found in PEM".into()))?;

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
        .map_err(|e| CertificateError::Tls(format!("Failed to create signing key: {}", e)))?;

    Ok(CertifiedKey::new(cert_chain, signing_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType};

    fn self_signed(id: &str, validity: Duration) -> Certificate {
        let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, "test");
        params.distinguished_name = dn;
        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::days(1);
        params.not_after = now + validity;
        let cert = params.self_signed(&key_pair).unwrap();
        Certificate::new(id, key_pair, cert.pem()).unwrap()
    }

    #[test]
    fn test_record_restore_preserves_material() {
        let original = self_signed("root_ca", Duration::days(365));
        let record = original.to_record();
        let restored = Certificate::restore(record.clone()).unwrap();

        assert_eq!(restored.id(), "root_ca");
        assert_eq!(restored.pem(), original.pem());
        assert_eq!(restored.key_pem(), original.key_pem());
        assert_eq!(restored.public_key_pem(), original.public_key_pem());
        assert_eq!(restored.to_record(), record);
    }

    #[test]
    fn test_record_json_shape() {
        let cert = self_signed("host_example.com", Duration::days(30));
        let json = serde_json::to_value(cert.to_record()).unwrap();

        assert_eq!(json["id"], "host_example.com");
        assert!(json["pem"]["key"].as_str().unwrap().contains("PRIVATE KEY"));
        assert!(json["pem"]["publicKey"].as_str().unwrap().contains("PUBLIC KEY"));
        assert!(json["pem"]["cert"].as_str().unwrap().contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn test_should_renew_inside_buffer() {
        let cert = self_signed("host_soon.example", Duration::minutes(5));
        assert!(cert.should_renew());
    }

    #[test]
    fn test_should_not_renew_fresh_certificate() {
        let cert = self_signed("host_fresh.example", Duration::days(365));
        assert!(!cert.should_renew());
        assert!(cert.should_renew_at(cert.not_after()));
    }

    #[test]
    fn test_certified_key_is_memoized() {
        let cert = self_signed("host_memo.example", Duration::days(1));
        let first = cert.certified_key().unwrap();
        let second = cert.certified_key().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_certificate_without_authority_key_id_matches_no_issuer() {
        let cert = self_signed("plain", Duration::days(30));
        assert!(cert.authority_key_id().is_none());
        assert!(!cert.is_issued_by(&cert));

        let restored = Certificate::restore(cert.to_record()).unwrap();
        assert_eq!(restored.subject_key_id(), cert.subject_key_id());
    }

    #[test]
    fn test_restore_rejects_garbage() {
        let record = CertificateRecord {
            id: "root_ca".to_string(),
            pem: PemRecord {
                key: "not a key".to_string(),
                public_key: String::new(),
                cert: String::new(),
            },
        };
        assert!(matches!(
            Certificate::restore(record),
            Err(CertificateError::Parse(_))
        ));
    }
}
