//! Namespace metrics lookup backed by the Kubernetes API

use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use tracing::debug;

use super::error::{Error, Result};
use super::orchestrator::NamespaceMetrics;
use crate::resources::common::METRICS_ANNOTATION;

/// Annotation value that turns scraping on
const METRICS_ENABLED_VALUE: &str = "enabled";

/// Whether the namespace annotations opt into metrics scraping
pub fn metrics_enabled(namespace: &Namespace) -> bool {
    namespace
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(METRICS_ANNOTATION))
        .is_some_and(|value| value.eq_ignore_ascii_case(METRICS_ENABLED_VALUE))
}

/// Reads the metrics annotation from the live namespace object
#[derive(Clone)]
pub struct KubeNamespaceMetrics {
    client: Client,
}

impl KubeNamespaceMetrics {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl NamespaceMetrics for KubeNamespaceMetrics {
    async fn is_metrics_enabled(&self, namespace: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let ns = api
            .get(namespace)
            .await
            .map_err(|e| Error::NamespaceLookupError {
                namespace: namespace.to_string(),
                message: e.to_string(),
            })?;

        let enabled = metrics_enabled(&ns);
        debug!(namespace = %namespace, enabled, "Resolved namespace metrics setting");
        Ok(enabled)
    }
}
