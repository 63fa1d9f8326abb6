//! Envoy bootstrap configuration
//!
//! Each injected proxy gets a Secret holding its bootstrap document. The
//! document points Envoy at the control plane's xDS server using the
//! bootstrap certificate issued for the proxy, and declares one static
//! listener per rewritten health probe kind. HTTP probe listeners route by
//! path to each container; an HTTPS probe listener proxies TCP to its single
//! target so TLS terminates in the application.
//!
//! Reference: https://www.envoyproxy.io/docs/envoy/latest/api-v3/config/bootstrap/v3/bootstrap.proto

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::core::ObjectMeta;
use kube::Client;
use serde_json::{Value, json};
use tracing::debug;

use crate::injector::error::{Error, Result};
use crate::injector::identity::IdentityBundle;
use crate::injector::orchestrator::BootstrapConfigCreator;
use crate::injector::probes::{HealthProbes, ProbeKind};
use crate::resources::common::{
    BOOTSTRAP_FILE_NAME, ENVOY_ADMIN_PORT, FIELD_MANAGER, XDS_PORT, standard_labels,
};

/// Name of the xDS cluster in the bootstrap document
pub const XDS_CLUSTER_NAME: &str = "osm-controller";

/// Annotation recording which certificate CN the bootstrap secret carries
pub const PROXY_COMMON_NAME_ANNOTATION: &str = "openservicemesh.io/proxy-common-name";

fn probe_cluster_name(kind: ProbeKind, container: &str) -> String {
    format!("{kind}_cluster_{container}")
}

fn socket_address(address: &str, port: i32) -> Value {
    json!({ "socket_address": { "address": address, "port_value": port } })
}

fn xds_cluster(bundle: &IdentityBundle, controller_namespace: &str) -> Value {
    let xds_host = format!("osm-controller.{}.svc.cluster.local", controller_namespace);
    json!({
        "name": XDS_CLUSTER_NAME,
        "connect_timeout": "0.25s",
        "type": "LOGICAL_DNS",
        "typed_extension_protocol_options": {
            "envoy.extensions.upstreams.http.v3.HttpProtocolOptions": {
                "@type": "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions",
                "explicit_http_config": { "http2_protocol_options": {} }
            }
        },
        "transport_socket": {
            "name": "envoy.transport_sockets.tls",
            "typed_config": {
                "@type": "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext",
                "common_tls_context": {
                    "alpn_protocols": ["h2"],
                    "tls_params": {
                        "tls_minimum_protocol_version": "TLSv1_2",
                        "tls_maximum_protocol_version": "TLSv1_3"
                    },
                    "tls_certificates": [{
                        "certificate_chain": { "inline_string": bundle.cert_chain_pem },
                        "private_key": { "inline_string": bundle.private_key_pem }
                    }],
                    "validation_context": {
                        "trusted_ca": { "inline_string": bundle.issuing_ca_pem }
                    }
                }
            }
        },
        "load_assignment": {
            "cluster_name": XDS_CLUSTER_NAME,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": { "address": socket_address(&xds_host, XDS_PORT) }
                }]
            }]
        }
    })
}

fn probe_listener(kind: ProbeKind, probes: &HealthProbes) -> Value {
    let routes: Vec<Value> = probes
        .http_targets(kind)
        .into_iter()
        .map(|(container, target)| {
            json!({
                "match": { "path": kind.rewritten_path(container) },
                "route": {
                    "cluster": probe_cluster_name(kind, container),
                    "regex_rewrite": {
                        "pattern": { "regex": ".*" },
                        "substitution": target.path
                    }
                }
            })
        })
        .collect();

    json!({
        "name": format!("{kind}_listener"),
        "address": socket_address("0.0.0.0", kind.listener_port()),
        "filter_chains": [{
            "filters": [{
                "name": "envoy.filters.network.http_connection_manager",
                "typed_config": {
                    "@type": "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager",
                    "stat_prefix": "health_probes_http",
                    "route_config": {
                        "name": "local_route",
                        "virtual_hosts": [{
                            "name": "local_service",
                            "domains": ["*"],
                            "routes": routes
                        }]
                    },
                    "http_filters": [{
                        "name": "envoy.filters.http.router",
                        "typed_config": {
                            "@type": "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router"
                        }
                    }]
                }
            }]
        }]
    })
}

fn passthrough_listener(kind: ProbeKind, container: &str) -> Value {
    json!({
        "name": format!("{kind}_listener"),
        "address": socket_address("0.0.0.0", kind.listener_port()),
        "filter_chains": [{
            "filters": [{
                "name": "envoy.filters.network.tcp_proxy",
                "typed_config": {
                    "@type": "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy",
                    "stat_prefix": "health_probes_https",
                    "cluster": probe_cluster_name(kind, container)
                }
            }]
        }]
    })
}

fn probe_cluster(kind: ProbeKind, container: &str, port: i32) -> Value {
    let name = probe_cluster_name(kind, container);
    json!({
        "name": name,
        "connect_timeout": "1s",
        "type": "STATIC",
        "load_assignment": {
            "cluster_name": name,
            "endpoints": [{
                "lb_endpoints": [{
                    "endpoint": { "address": socket_address("127.0.0.1", port) }
                }]
            }]
        }
    })
}

/// Generate the Envoy bootstrap document for a proxy
pub fn generate_bootstrap_config(
    bundle: &IdentityBundle,
    controller_namespace: &str,
    probes: &HealthProbes,
) -> Value {
    let mut clusters = vec![xds_cluster(bundle, controller_namespace)];
    let mut listeners = Vec::new();

    for kind in ProbeKind::ALL {
        let targets = probes.http_targets(kind);
        if targets.is_empty() {
            continue;
        }
        clusters.extend(
            targets
                .iter()
                .map(|(container, target)| probe_cluster(kind, container, target.port)),
        );
        match targets.as_slice() {
            [(container, _)] if probes.is_passthrough(kind) => {
                listeners.push(passthrough_listener(kind, container));
            }
            _ => listeners.push(probe_listener(kind, probes)),
        }
    }

    json!({
        "admin": {
            "access_log_path": "/dev/stdout",
            "address": socket_address("127.0.0.1", ENVOY_ADMIN_PORT)
        },
        "dynamic_resources": {
            "ads_config": {
                "api_type": "GRPC",
                "transport_api_version": "V3",
                "grpc_services": [{ "envoy_grpc": { "cluster_name": XDS_CLUSTER_NAME } }]
            },
            "cds_config": { "ads": {}, "resource_api_version": "V3" },
            "lds_config": { "ads": {}, "resource_api_version": "V3" }
        },
        "static_resources": {
            "clusters": clusters,
            "listeners": listeners
        }
    })
}

/// Generate the Secret holding a proxy's bootstrap document
pub fn generate_bootstrap_secret(
    name: &str,
    namespace: &str,
    controller_namespace: &str,
    bundle: &IdentityBundle,
    probes: &HealthProbes,
) -> Result<Secret> {
    let document = generate_bootstrap_config(bundle, controller_namespace, probes);
    let rendered = serde_json::to_string_pretty(&document)?;

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(standard_labels()),
            annotations: Some(BTreeMap::from([(
                PROXY_COMMON_NAME_ANNOTATION.to_string(),
                bundle.common_name.clone(),
            )])),
            ..Default::default()
        },
        type_: Some("Opaque".to_string()),
        string_data: Some(BTreeMap::from([(
            BOOTSTRAP_FILE_NAME.to_string(),
            rendered,
        )])),
        ..Default::default()
    })
}

/// Creates bootstrap secrets in the cluster with server-side apply
#[derive(Clone)]
pub struct KubeBootstrapConfigCreator {
    client: Client,
}

impl KubeBootstrapConfigCreator {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl BootstrapConfigCreator for KubeBootstrapConfigCreator {
    async fn create(
        &self,
        name: &str,
        namespace: &str,
        controller_namespace: &str,
        bundle: &IdentityBundle,
        probes: &HealthProbes,
    ) -> Result<String> {
        let secret = generate_bootstrap_secret(name, namespace, controller_namespace, bundle, probes)?;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        // Apply rather than create: an admission retried with the same proxy id
        // lands on the same name and must not fail with AlreadyExists.
        let applied = secrets
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&secret),
            )
            .await
            .map_err(|e| Error::BootstrapConfigError {
                name: name.to_string(),
                message: e.to_string(),
            })?;

        debug!(name = %name, namespace = %namespace, "Applied envoy bootstrap secret");
        Ok(applied.metadata.name.unwrap_or_else(|| name.to_string()))
    }
}
