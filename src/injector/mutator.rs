//! Pure pod mutation
//!
//! Everything here operates on an in-memory copy of the pod; no function in
//! this module performs I/O.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use uuid::Uuid;

use super::probes::{HealthProbes, rewrite_health_probes};
use crate::config::InjectorConfig;
use crate::resources::common::{
    ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT, PROMETHEUS_PATH_ANNOTATION,
    PROMETHEUS_PORT_ANNOTATION, PROMETHEUS_SCRAPE_ANNOTATION, PROMETHEUS_SCRAPE_PATH,
    PROXY_UUID_LABEL,
};
use crate::resources::init_container::generate_init_container;
use crate::resources::sidecar::{generate_bootstrap_volumes, generate_sidecar_container};

/// Facts derived by the orchestrator before the pod is mutated
#[derive(Clone, Debug, PartialEq)]
pub struct MutationFacts {
    /// Proxy id, also embedded in the certificate CN
    pub proxy_id: Uuid,
    /// Name of the bootstrap secret the sidecar mounts
    pub bootstrap_config_name: String,
    /// Envoy `--service-cluster`, `<service account>.<namespace>`
    pub service_cluster: String,
    /// Health probes as they were before rewriting
    pub original_probes: HealthProbes,
}

/// Return a copy of `pod` with the sidecar injected.
///
/// Adds the bootstrap volume, appends the init container after any
/// user-defined ones, appends the sidecar, rewrites captured HTTP probes and
/// labels the pod with the proxy id. Metrics annotations are applied
/// separately by [`enable_metrics_scraping`].
pub fn apply(pod: &Pod, facts: &MutationFacts, config: &InjectorConfig) -> Pod {
    let mut pod = pod.clone();

    rewrite_health_probes(&mut pod, &facts.original_probes);

    let spec = pod.spec.get_or_insert_with(Default::default);

    spec.volumes
        .get_or_insert_with(Vec::new)
        .extend(generate_bootstrap_volumes(&facts.bootstrap_config_name));

    spec.init_containers
        .get_or_insert_with(Vec::new)
        .push(generate_init_container(config));

    spec.containers.push(generate_sidecar_container(
        config,
        &facts.service_cluster,
        &facts.original_probes,
    ));

    pod.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(PROXY_UUID_LABEL.to_string(), facts.proxy_id.to_string());

    pod
}

/// Add the Prometheus scrape annotations, keeping unrelated annotations
pub fn enable_metrics_scraping(pod: &mut Pod) {
    let annotations = pod.metadata.annotations.get_or_insert_with(BTreeMap::new);
    annotations.insert(PROMETHEUS_SCRAPE_ANNOTATION.to_string(), true.to_string());
    annotations.insert(
        PROMETHEUS_PORT_ANNOTATION.to_string(),
        ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT.to_string(),
    );
    annotations.insert(
        PROMETHEUS_PATH_ANNOTATION.to_string(),
        PROMETHEUS_SCRAPE_PATH.to_string(),
    );
}
