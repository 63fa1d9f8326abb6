//! Envoy sidecar container and its volumes

use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, ObjectFieldSelector, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};

use crate::config::InjectorConfig;
use crate::injector::probes::{HealthProbes, ProbeKind};
use crate::resources::common::{
    BOOTSTRAP_FILE_NAME, BOOTSTRAP_MOUNT_PATH, BOOTSTRAP_VOLUME_NAME, ENVOY_ADMIN_PORT,
    ENVOY_INBOUND_LISTENER_PORT, ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT, ENVOY_UID,
    SIDECAR_CONTAINER_NAME,
};

/// Volumes the sidecar needs, referencing the bootstrap secret by name
pub fn generate_bootstrap_volumes(bootstrap_config_name: &str) -> Vec<Volume> {
    vec![Volume {
        name: BOOTSTRAP_VOLUME_NAME.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(bootstrap_config_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }]
}

fn container_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn field_ref_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Envoy sidecar container.
///
/// A probe listener port is exposed for every probe kind that has at least
/// one rewritten HTTP probe among the original containers.
pub fn generate_sidecar_container(
    config: &InjectorConfig,
    service_cluster: &str,
    probes: &HealthProbes,
) -> Container {
    let mut ports = vec![
        container_port("proxy-admin", ENVOY_ADMIN_PORT),
        container_port("proxy-inbound", ENVOY_INBOUND_LISTENER_PORT),
        container_port("proxy-metrics", ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT),
    ];
    ports.extend(
        ProbeKind::ALL
            .into_iter()
            .filter(|kind| probes.has_http(*kind))
            .map(|kind| container_port(kind.port_name(), kind.listener_port())),
    );

    Container {
        name: SIDECAR_CONTAINER_NAME.to_string(),
        image: Some(config.sidecar_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["envoy".to_string()]),
        args: Some(vec![
            "--log-level".to_string(),
            config.envoy_log_level.clone(),
            "--config-path".to_string(),
            format!("{}/{}", BOOTSTRAP_MOUNT_PATH, BOOTSTRAP_FILE_NAME),
            "--service-cluster".to_string(),
            service_cluster.to_string(),
        ]),
        ports: Some(ports),
        env: Some(vec![
            field_ref_env("POD_UID", "metadata.uid"),
            field_ref_env("POD_NAME", "metadata.name"),
            field_ref_env("POD_NAMESPACE", "metadata.namespace"),
            field_ref_env("POD_IP", "status.podIP"),
            field_ref_env("SERVICE_ACCOUNT", "spec.serviceAccountName"),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: BOOTSTRAP_VOLUME_NAME.to_string(),
            mount_path: BOOTSTRAP_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        }]),
        security_context: Some(SecurityContext {
            run_as_user: Some(ENVOY_UID),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}
