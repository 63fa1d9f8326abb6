//! Injection pipeline
//!
//! Sequences the side effects of an injection (certificate issuance and
//! bootstrap secret creation) around the pure pod mutation, then encodes the
//! result as a JSON patch.
//!
//! Ordering guarantees:
//! - a certificate failure aborts before anything else runs
//! - a dry run never creates the bootstrap secret but still returns the full patch
//! - a bootstrap failure aborts before the pod is mutated
//! - a namespace lookup failure aborts after mutation, before encoding
//!
//! An error never comes with patch bytes.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::Pod;
use tracing::{debug, error};
use uuid::Uuid;

use super::error::{Error, Result};
use super::identity::{CertificateIssuer, IdentityBundle, common_name};
use super::mutator::{self, MutationFacts};
use super::patch;
use super::probes::{HealthProbes, capture_health_probes};
use crate::config::InjectorConfig;
use crate::health::HealthState;
use crate::resources::common::bootstrap_config_name;

/// Service account assumed when the pod does not name one
const DEFAULT_SERVICE_ACCOUNT: &str = "default";

/// Creates the out-of-band bootstrap config object for a proxy
pub trait BootstrapConfigCreator: Send + Sync {
    /// Create (or re-apply) the bootstrap config and return its name
    fn create(
        &self,
        name: &str,
        namespace: &str,
        controller_namespace: &str,
        bundle: &IdentityBundle,
        probes: &HealthProbes,
    ) -> impl Future<Output = Result<String>> + Send;
}

/// Tells whether metrics scraping is enabled for a namespace
pub trait NamespaceMetrics: Send + Sync {
    fn is_metrics_enabled(&self, namespace: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// One pod admission to inject
#[derive(Clone, Debug)]
pub struct InjectionRequest {
    /// Namespace the pod is created in
    pub namespace: String,
    /// Service account the pod runs as
    pub service_account: String,
    /// Unique id of the injected proxy
    pub proxy_id: Uuid,
    /// No persistent side effects may be created
    pub dry_run: bool,
    /// Pod exactly as received from the API server
    pub raw: Vec<u8>,
    /// Typed view of `raw`
    pub pod: Pod,
}

impl InjectionRequest {
    /// Build a request from the raw pod bytes of an admission review
    pub fn from_raw(
        namespace: impl Into<String>,
        proxy_id: Uuid,
        dry_run: bool,
        raw: Vec<u8>,
    ) -> Result<Self> {
        let pod: Pod = serde_json::from_slice(&raw)
            .map_err(|e| Error::InvalidRequest(format!("failed to parse pod: {}", e)))?;
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|spec| spec.service_account_name.clone())
            .filter(|sa| !sa.is_empty())
            .unwrap_or_else(|| DEFAULT_SERVICE_ACCOUNT.to_string());

        Ok(Self {
            namespace: namespace.into(),
            service_account,
            proxy_id,
            dry_run,
            raw,
            pod,
        })
    }
}

/// Sidecar injection orchestrator
pub struct Injector<I, B, N> {
    config: Arc<InjectorConfig>,
    issuer: I,
    bootstrap: B,
    namespaces: N,
    health_state: Option<Arc<HealthState>>,
}

impl<I, B, N> Injector<I, B, N>
where
    I: CertificateIssuer,
    B: BootstrapConfigCreator,
    N: NamespaceMetrics,
{
    pub fn new(config: Arc<InjectorConfig>, issuer: I, bootstrap: B, namespaces: N) -> Self {
        Self {
            config,
            issuer,
            bootstrap,
            namespaces,
            health_state: None,
        }
    }

    /// Record pipeline metrics into the given health state
    pub fn with_health_state(mut self, health_state: Arc<HealthState>) -> Self {
        self.health_state = Some(health_state);
        self
    }

    /// Run the pipeline and return the serialized JSON patch
    pub async fn mutate(&self, request: &InjectionRequest) -> Result<Vec<u8>> {
        let result = self.run(request).await;

        if let Some(state) = &self.health_state {
            match &result {
                Ok(_) => {
                    state.metrics.record_patch(request.dry_run);
                    state.metrics.record_injection_time();
                }
                Err(e) => state.metrics.record_error(e.reason()),
            }
        }

        result
    }

    async fn run(&self, request: &InjectionRequest) -> Result<Vec<u8>> {
        let namespace = request.namespace.as_str();
        let service_account = request.service_account.as_str();

        // Bootstrap certificate, used by Envoy to connect to xDS only
        let cn = common_name(&request.proxy_id, service_account, namespace);
        debug!(
            service_account = %service_account,
            namespace = %namespace,
            cn = %cn,
            "Patching pod spec"
        );

        let started = Instant::now();
        let bundle = self
            .issuer
            .issue_certificate(&cn, self.config.bootstrap_cert_validity)
            .await
            .inspect_err(|e| {
                error!(cn = %cn, error = %e, "Error issuing bootstrap certificate for Envoy");
            })?;
        if let Some(state) = &self.health_state {
            state
                .metrics
                .record_certificate_issued(started.elapsed().as_secs_f64());
        }

        let original_probes = capture_health_probes(&request.pod);
        let config_name = bootstrap_config_name(&request.proxy_id);

        // The bootstrap secret is an out-of-band side effect and must be
        // skipped for dry runs.
        if request.dry_run {
            debug!(
                service_account = %service_account,
                namespace = %namespace,
                "Skipping envoy bootstrap config creation for dry-run request"
            );
        } else {
            self.bootstrap
                .create(
                    &config_name,
                    namespace,
                    &self.config.controller_namespace,
                    &bundle,
                    &original_probes,
                )
                .await
                .inspect_err(|e| {
                    error!(
                        service_account = %service_account,
                        namespace = %namespace,
                        cn = %cn,
                        error = %e,
                        "Failed to create Envoy bootstrap config for pod"
                    );
                })?;
        }

        let facts = MutationFacts {
            proxy_id: request.proxy_id,
            bootstrap_config_name: config_name,
            service_cluster: format!("{}.{}", service_account, namespace),
            original_probes,
        };
        let mut pod = mutator::apply(&request.pod, &facts, &self.config);

        let metrics_enabled = self
            .namespaces
            .is_metrics_enabled(namespace)
            .await
            .inspect_err(|e| {
                error!(
                    namespace = %namespace,
                    error = %e,
                    "Error checking if namespace is enabled for metrics"
                );
            })?;
        if metrics_enabled {
            mutator::enable_metrics_scraping(&mut pod);
        }

        patch::encode(&request.raw, &pod).map_err(|e| {
            error!(
                namespace = %namespace,
                name = ?request.pod.metadata.name,
                error = %e,
                "Error encoding patch for pod"
            );
            e
        })
    }
}
