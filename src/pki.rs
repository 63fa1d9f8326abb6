//! In-process certificate authority for proxy bootstrap certificates
//!
//! Every injected proxy gets a short-lived leaf certificate whose common name
//! is the proxy's identity. The CA key never leaves this process; the leaf
//! key is generated per request and handed to the proxy through its
//! bootstrap config.

use std::time::Duration;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType,
    string::Ia5String,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use x509_parser::prelude::*;

use crate::injector::error::Error as InjectorError;
use crate::injector::identity::{CertificateIssuer, IdentityBundle};

/// Validity period for CA certificates (10 years)
pub const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Default path of the mounted CA certificate
pub const CA_CERT_PATH: &str = "/etc/injector/ca/ca.crt";
/// Default path of the mounted CA private key
pub const CA_KEY_PATH: &str = "/etc/injector/ca/ca.key";

/// Common name of a CA generated at startup
const EPHEMERAL_CA_NAME: &str = "osm-ca.openservicemesh.io";

/// Organization written into every certificate subject
const ORGANIZATION: &str = "Open Service Mesh";

/// Compute (not_before, not_after) for a certificate valid from now
fn compute_validity(validity: Duration) -> Result<(::time::OffsetDateTime, ::time::OffsetDateTime)> {
    let now = ::time::OffsetDateTime::now_utc();
    let not_after = ::time::Duration::try_from(validity)
        .ok()
        .and_then(|d| now.checked_add(d))
        .ok_or_else(|| {
            PkiError::CertificateGenerationFailed(format!(
                "validity of {}s is out of range",
                validity.as_secs()
            ))
        })?;
    Ok((now, not_after))
}

/// Validity and subject of a parsed certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();

        let dns_names = cert
            .subject_alternative_name()
            .ok()
            .flatten()
            .map(|san| {
                san.value
                    .general_names
                    .iter()
                    .filter_map(|name| match name {
                        GeneralName::DNSName(dns) => Some(dns.to_string()),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            dns_names,
        })
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }
}

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Certificate parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn.push(
        DnType::OrganizationName,
        DnValue::Utf8String(ORGANIZATION.to_string()),
    );
    dn
}

/// Certificate authority signing proxy bootstrap certificates
#[derive(Clone)]
pub struct CertificateAuthority {
    /// CA key pair serialized as PEM (KeyPair isn't Clone)
    ca_key_pem: String,
    /// PEM-encoded CA certificate
    ca_cert_pem: String,
}

impl CertificateAuthority {
    /// Create a new self-signed CA
    pub fn new(common_name: &str) -> Result<Self> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let (not_before, not_after) = compute_validity(CA_VALIDITY)?;
        params.not_before = not_before;
        params.not_after = not_after;

        let key_pair = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate CA key: {}", e))
        })?;
        let ca_key_pem = key_pair.serialize_pem();

        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;

        Ok(Self {
            ca_key_pem,
            ca_cert_pem: cert.pem(),
        })
    }

    /// Load CA from PEM material
    pub fn from_pem(cert_pem: &str, key_pem: &str) -> Result<Self> {
        let _ = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;
        let _ = parse_pem(cert_pem)?;

        Ok(Self {
            ca_key_pem: key_pem.to_string(),
            ca_cert_pem: cert_pem.to_string(),
        })
    }

    /// Load CA from a certificate and key file on disk
    pub fn from_files(cert_path: &str, key_path: &str) -> Result<Self> {
        let cert_pem = std::fs::read_to_string(cert_path)?;
        let key_pem = std::fs::read_to_string(key_path)?;
        Self::from_pem(&cert_pem, &key_pem)
    }

    /// Load the CA from disk, or generate an ephemeral one when none is mounted.
    ///
    /// Proxies bootstrapped by an ephemeral CA cannot be verified by a
    /// control plane that does not share it, so this is only suitable for
    /// development clusters.
    pub fn load_or_generate(cert_path: &str, key_path: &str) -> Result<Self> {
        if std::path::Path::new(cert_path).exists() && std::path::Path::new(key_path).exists() {
            let ca = Self::from_files(cert_path, key_path)?;
            info!(cert_path = %cert_path, "Loaded certificate authority");
            return Ok(ca);
        }

        warn!(
            cert_path = %cert_path,
            key_path = %key_path,
            "CA material not found, generating an ephemeral certificate authority"
        );
        Self::new(EPHEMERAL_CA_NAME)
    }

    /// Get the CA certificate in PEM format
    pub fn ca_cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Get certificate info (validity period, etc.)
    pub fn cert_info(&self) -> Result<CertificateInfo> {
        CertificateInfo::from_pem(&self.ca_cert_pem)
    }

    fn load_key_pair(&self) -> Result<KeyPair> {
        KeyPair::from_pem(&self.ca_key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to load CA key: {}", e)))
    }

    /// Sign a leaf certificate for a proxy identity.
    ///
    /// The certificate carries `common_name` both as subject CN and as DNS
    /// SAN, and is usable for client and server TLS.
    pub fn issue(&self, common_name: &str, validity: Duration) -> Result<IdentityBundle> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name(common_name);

        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let (not_before, not_after) = compute_validity(validity)?;
        params.not_before = not_before;
        params.not_after = not_after;

        params.subject_alt_names = vec![SanType::DnsName(
            Ia5String::try_from(common_name.to_string()).map_err(|e| {
                PkiError::CertificateGenerationFailed(format!(
                    "invalid DNS name '{}': {}",
                    common_name, e
                ))
            })?,
        )];

        let leaf_key = KeyPair::generate().map_err(|e| {
            PkiError::KeyGenerationFailed(format!("failed to generate proxy key: {}", e))
        })?;

        let ca_key = self.load_key_pair()?;
        let issuer = Issuer::from_ca_cert_pem(&self.ca_cert_pem, &ca_key)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let cert = params.signed_by(&leaf_key, &issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to sign proxy cert: {}", e))
        })?;

        debug!(cn = %common_name, validity_secs = validity.as_secs(), "Issued proxy certificate");

        Ok(IdentityBundle {
            common_name: common_name.to_string(),
            cert_chain_pem: cert.pem(),
            private_key_pem: leaf_key.serialize_pem(),
            issuing_ca_pem: self.ca_cert_pem.clone(),
            not_before: not_before.unix_timestamp(),
            not_after: not_after.unix_timestamp(),
        })
    }
}

impl CertificateIssuer for CertificateAuthority {
    async fn issue_certificate(
        &self,
        common_name: &str,
        validity: Duration,
    ) -> crate::injector::Result<IdentityBundle> {
        self.issue(common_name, validity)
            .map_err(|e| InjectorError::CertificateError {
                common_name: common_name.to_string(),
                message: e.to_string(),
            })
    }
}
