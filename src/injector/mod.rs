//! Sidecar injection
//!
//! The orchestrator sequences identity issuance, bootstrap config creation,
//! the pure pod mutation, the namespace metrics lookup and patch encoding.

pub mod error;
pub mod identity;
pub mod mutator;
pub mod namespace;
pub mod orchestrator;
pub mod patch;
pub mod probes;

pub use error::{Error, Result};
pub use identity::{CertificateIssuer, IdentityBundle, common_name};
pub use mutator::{MutationFacts, apply, enable_metrics_scraping};
pub use namespace::KubeNamespaceMetrics;
pub use orchestrator::{BootstrapConfigCreator, InjectionRequest, Injector, NamespaceMetrics};
pub use probes::{
    HealthProbes, ProbeKind, ProbeScheme, capture_health_probes, rewrite_health_probes,
};
