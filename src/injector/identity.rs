//! Proxy identity: common-name derivation and the certificate issuer seam

use std::future::Future;
use std::time::Duration;

use uuid::Uuid;

use super::error::Result;

/// Separator between the components of a proxy common name
const DOMAIN_DELIMITER: &str = ".";

/// Derive the certificate common name for a proxy.
///
/// The result is `<proxy id>.<service account>.<namespace>`. It is a pure
/// function of its inputs so that a CN seen in xDS logs can be mapped back to
/// the pod carrying the same proxy id label.
pub fn common_name(proxy_id: &Uuid, service_account: &str, namespace: &str) -> String {
    format!("{proxy_id}{DOMAIN_DELIMITER}{service_account}{DOMAIN_DELIMITER}{namespace}")
}

/// Signed certificate material issued for one proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityBundle {
    /// Subject common name the certificate was issued for
    pub common_name: String,
    /// PEM certificate chain (leaf first)
    pub cert_chain_pem: String,
    /// PEM private key matching the leaf
    pub private_key_pem: String,
    /// PEM certificate of the issuing CA
    pub issuing_ca_pem: String,
    /// Start of validity (Unix seconds)
    pub not_before: i64,
    /// End of validity (Unix seconds)
    pub not_after: i64,
}

/// Issues certificates for proxies.
///
/// Implementations must be safe for concurrent use; the injector calls them
/// from every in-flight admission request.
pub trait CertificateIssuer: Send + Sync {
    /// Issue a certificate for `common_name` valid for `validity` from now
    fn issue_certificate(
        &self,
        common_name: &str,
        validity: Duration,
    ) -> impl Future<Output = Result<IdentityBundle>> + Send;
}
