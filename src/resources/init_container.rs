//! iptables init container
//!
//! Runs before the application containers and redirects all inbound and
//! outbound TCP traffic of the pod through the Envoy sidecar, except for
//! Envoy's own traffic and the configured exclusions.

use k8s_openapi::api::core::v1::{Capabilities, Container, SecurityContext};

use crate::config::InjectorConfig;
use crate::injector::probes::ProbeKind;
use crate::resources::common::{
    ENVOY_ADMIN_PORT, ENVOY_INBOUND_LISTENER_PORT, ENVOY_OUTBOUND_LISTENER_PORT,
    ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT, ENVOY_UID, INIT_CONTAINER_NAME,
};

/// Build the iptables-restore script for the pod network namespace
pub fn generate_iptables_commands(
    outbound_ip_range_exclusions: &[String],
    outbound_port_exclusions: &[u16],
) -> String {
    let mut rules = vec![
        "*nat".to_string(),
        ":PROXY_INBOUND - [0:0]".to_string(),
        ":PROXY_IN_REDIRECT - [0:0]".to_string(),
        ":PROXY_OUTPUT - [0:0]".to_string(),
        ":PROXY_REDIRECT - [0:0]".to_string(),
        // Outbound: everything not owned by Envoy goes to the outbound listener
        format!("-A PROXY_REDIRECT -p tcp --dport {ENVOY_ADMIN_PORT} -j ACCEPT"),
        format!("-A PROXY_REDIRECT -p tcp -j REDIRECT --to-port {ENVOY_OUTBOUND_LISTENER_PORT}"),
        "-A OUTPUT -p tcp -j PROXY_OUTPUT".to_string(),
        format!("-A PROXY_OUTPUT -m owner --uid-owner {ENVOY_UID} -j RETURN"),
        "-A PROXY_OUTPUT -d 127.0.0.1/32 -j RETURN".to_string(),
    ];

    for cidr in outbound_ip_range_exclusions {
        rules.push(format!("-A PROXY_OUTPUT -d {cidr} -j RETURN"));
    }

    if !outbound_port_exclusions.is_empty() {
        let ports = outbound_port_exclusions
            .iter()
            .map(u16::to_string)
            .collect::<Vec<_>>()
            .join(",");
        rules.push(format!(
            "-A PROXY_OUTPUT -p tcp --match multiport --dports {ports} -j RETURN"
        ));
    }

    rules.push("-A PROXY_OUTPUT -j PROXY_REDIRECT".to_string());

    // Inbound: metrics and probe listeners are reached directly
    rules.push(format!(
        "-A PROXY_IN_REDIRECT -p tcp -j REDIRECT --to-port {ENVOY_INBOUND_LISTENER_PORT}"
    ));
    rules.push("-A PREROUTING -p tcp -j PROXY_INBOUND".to_string());
    rules.push(format!(
        "-A PROXY_INBOUND -p tcp --dport {ENVOY_PROMETHEUS_INBOUND_LISTENER_PORT} -j RETURN"
    ));
    for kind in ProbeKind::ALL {
        rules.push(format!(
            "-A PROXY_INBOUND -p tcp --dport {} -j RETURN",
            kind.listener_port()
        ));
    }
    rules.push("-A PROXY_INBOUND -p tcp -j PROXY_IN_REDIRECT".to_string());
    rules.push("COMMIT".to_string());

    format!("iptables-restore --noflush <<EOF\n{}\nEOF\n", rules.join("\n"))
}

/// Build the init container from configuration
pub fn generate_init_container(config: &InjectorConfig) -> Container {
    let script = generate_iptables_commands(
        &config.outbound_ip_range_exclusions,
        &config.outbound_port_exclusions,
    );

    Container {
        name: INIT_CONTAINER_NAME.to_string(),
        image: Some(config.init_container_image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string()]),
        args: Some(vec!["-c".to_string(), script]),
        security_context: Some(SecurityContext {
            privileged: Some(config.privileged_init_container),
            capabilities: Some(Capabilities {
                add: Some(vec!["NET_ADMIN".to_string()]),
                ..Default::default()
            }),
            run_as_non_root: Some(false),
            run_as_user: Some(0),
            ..Default::default()
        }),
        ..Default::default()
    }
}
