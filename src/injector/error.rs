//! Error types for the injection pipeline

use thiserror::Error;

/// Every variant is fatal to the admission request that raised it.
/// Nothing in the pipeline retries; a returned error never comes with patch bytes.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Certificate issuance failed for CN={common_name}: {message}")]
    CertificateError {
        common_name: String,
        message: String,
    },

    #[error("Failed to create bootstrap config {name}: {message}")]
    BootstrapConfigError { name: String, message: String },

    #[error("Failed to check metrics for namespace {namespace}: {message}")]
    NamespaceLookupError { namespace: String, message: String },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Invalid admission request: {0}")]
    InvalidRequest(String),
}

impl Error {
    /// Short machine-readable reason, used in admission responses and metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Error::CertificateError { .. } => "CertificateIssuanceFailed",
            Error::BootstrapConfigError { .. } => "BootstrapConfigFailed",
            Error::NamespaceLookupError { .. } => "NamespaceLookupFailed",
            Error::SerializationError(_) => "PatchEncodingFailed",
            Error::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
