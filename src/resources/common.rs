//! Common constants and helpers for injected resources
//!
//! Ports, names and label keys shared by the sidecar, the init container,
//! the bootstrap config and the pod mutation so they cannot drift apart.

use std::collections::BTreeMap;

use uuid::Uuid;

/// Field manager name for server-side apply
pub const FIELD_MANAGER: &str = "sidecar-injector";

/// Pod label carrying the proxy id; xDS matches it against the certificate CN
pub const PROXY_UUID_LABEL: &str = "envoy-uid";

/// Name of the injected Envoy container
pub const SIDECAR_CONTAINER_NAME: &str = "envoy";

/// Name of the injected iptables init container
pub const INIT_CONTAINER_NAME: &str = "osm-init";

/// Volume holding the Envoy bootstrap secret
pub const BOOTSTRAP_VOLUME_NAME: &str = "envoy-bootstrap-config-volume";

/// Mount path of the bootstrap volume inside the sidecar
pub const BOOTSTRAP_MOUNT_PATH: &str = "/etc/envoy";

/// Key of the bootstrap document in the bootstrap secret
pub const BOOTSTRAP_FILE_NAME: &str = "bootstrap.yaml";

/// Uid Envoy runs as; iptables exempts traffic owned by it
pub const ENVOY_UID: i64 = 1500;

pub const ENVOY_ADMIN_PORT: i32 = 15000;
pub const ENVOY_OUTBOUND_LISTENER_PORT: i32 = 15001;
pub const ENVOY_INBOUND_LISTENER_PORT: i32 = 15003;
pub const ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT: i32 = 15010;

/// Port of the xDS server in the control plane
pub const XDS_PORT: i32 = 15128;

pub const PROMETHEUS_SCRAPE_ANNOTATION: &str = "prometheus.io/scrape";
pub const PROMETHEUS_PORT_ANNOTATION: &str = "prometheus.io/port";
pub const PROMETHEUS_PATH_ANNOTATION: &str = "prometheus.io/path";
pub const PROMETHEUS_SCRAPE_PATH: &str = "/stats/prometheus";

/// Namespace annotation that opts a namespace into metrics scraping
pub const METRICS_ANNOTATION: &str = "openservicemesh.io/metrics";

/// Name of the bootstrap config secret for a proxy.
///
/// Derived from the proxy id alone so a retried admission with the same id
/// re-applies the same object.
pub fn bootstrap_config_name(proxy_id: &Uuid) -> String {
    format!("envoy-bootstrap-config-{}", proxy_id)
}

/// Labels for resources the injector creates
pub fn standard_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            "envoy-bootstrap".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}
