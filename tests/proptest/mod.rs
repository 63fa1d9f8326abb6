// Test code is allowed to panic on failure
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing,
    clippy::panic
)]

//! Property-based tests for the sidecar injector
//!
//! These check invariants that must hold for any pod shape, not just the
//! handful of fixtures used in the unit tests.

#[path = "../common/mod.rs"]
mod common;

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use proptest::prelude::*;
use uuid::Uuid;

use sidecar_injector::config::InjectorConfig;
use sidecar_injector::injector::{
    MutationFacts, apply, capture_health_probes, common_name, enable_metrics_scraping, patch,
};
use sidecar_injector::resources::common::{
    INIT_CONTAINER_NAME, PROXY_UUID_LABEL, SIDECAR_CONTAINER_NAME,
};
use sidecar_injector::resources::init_container::generate_iptables_commands;
use sidecar_injector::resources::sidecar::generate_bootstrap_volumes;

use common::*;

// =============================================================================
// Strategies
// =============================================================================

/// DNS-1123 label as used for namespaces and service accounts
fn dns_label() -> impl Strategy<Value = String> {
    "[a-z][a-z0-9-]{0,20}[a-z0-9]"
}

fn proxy_id() -> impl Strategy<Value = Uuid> {
    any::<u128>().prop_map(Uuid::from_u128)
}

/// Shape of a user pod before injection
#[derive(Debug, Clone)]
struct PodShape {
    extra_containers: usize,
    init_containers: usize,
    labels: BTreeMap<String, String>,
    liveness_port: Option<i32>,
}

fn pod_shape() -> impl Strategy<Value = PodShape> {
    (
        0usize..4,
        0usize..3,
        prop::collection::btree_map(dns_label(), dns_label(), 0..4),
        prop::option::of(1024i32..15000),
    )
        .prop_map(
            |(extra_containers, init_containers, labels, liveness_port)| PodShape {
                extra_containers,
                init_containers,
                labels,
                liveness_port,
            },
        )
}

fn pod_from_shape(shape: &PodShape) -> Pod {
    let mut builder = PodBuilder::new("bookstore").with_service_account("sa-1");
    for i in 0..shape.extra_containers {
        builder = builder.with_container(&format!("extra-{i}"));
    }
    for i in 0..shape.init_containers {
        builder = builder.with_init_container(&format!("setup-{i}"));
    }
    for (key, value) in &shape.labels {
        builder = builder.with_label(key, value);
    }
    if let Some(port) = shape.liveness_port {
        builder = builder.with_http_liveness("app", IntOrString::Int(port), "/healthz");
    }
    builder.build()
}

fn facts_for(pod: &Pod, proxy_id: Uuid) -> MutationFacts {
    MutationFacts {
        proxy_id,
        bootstrap_config_name: format!("envoy-bootstrap-config-{proxy_id}"),
        service_cluster: "sa-1.ns-1".to_string(),
        original_probes: capture_health_probes(pod),
    }
}

fn container_count(pod: &Pod) -> usize {
    pod.spec.as_ref().map_or(0, |s| s.containers.len())
}

fn init_container_count(pod: &Pod) -> usize {
    pod.spec
        .as_ref()
        .and_then(|s| s.init_containers.as_ref())
        .map_or(0, Vec::len)
}

fn volume_count(pod: &Pod) -> usize {
    pod.spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .map_or(0, Vec::len)
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    /// Property: the common name is a pure function of its inputs
    #[test]
    fn prop_common_name_is_deterministic(
        id in proxy_id(),
        sa in dns_label(),
        ns in dns_label(),
    ) {
        let first = common_name(&id, &sa, &ns);
        let second = common_name(&id, &sa, &ns);
        prop_assert_eq!(&first, &second);
        prop_assert_eq!(first, format!("{}.{}.{}", id, sa, ns));
    }

    /// Property: distinct proxy ids never share a common name
    #[test]
    fn prop_common_name_distinguishes_proxies(
        a in proxy_id(),
        b in proxy_id(),
        sa in dns_label(),
        ns in dns_label(),
    ) {
        prop_assume!(a != b);
        prop_assert_ne!(common_name(&a, &sa, &ns), common_name(&b, &sa, &ns));
    }

    /// Property: mutation adds exactly one sidecar, one init container and
    /// the bootstrap volumes, whatever the pod already carries
    #[test]
    fn prop_mutation_adds_injected_parts(shape in pod_shape(), id in proxy_id()) {
        let pod = pod_from_shape(&shape);
        let facts = facts_for(&pod, id);

        let mutated = apply(&pod, &facts, &InjectorConfig::default());

        prop_assert_eq!(container_count(&mutated), container_count(&pod) + 1);
        prop_assert_eq!(init_container_count(&mutated), init_container_count(&pod) + 1);
        prop_assert_eq!(
            volume_count(&mutated),
            volume_count(&pod) + generate_bootstrap_volumes(&facts.bootstrap_config_name).len()
        );

        let spec = mutated.spec.as_ref().unwrap();
        prop_assert_eq!(&spec.containers.last().unwrap().name, SIDECAR_CONTAINER_NAME);
        prop_assert_eq!(
            &spec.init_containers.as_ref().unwrap().last().unwrap().name,
            INIT_CONTAINER_NAME
        );
        let id_text = id.to_string();
        prop_assert_eq!(
            mutated.metadata.labels.as_ref().unwrap().get(PROXY_UUID_LABEL),
            Some(&id_text)
        );
        // User labels survive
        for (key, value) in &shape.labels {
            if key != PROXY_UUID_LABEL {
                prop_assert_eq!(mutated.metadata.labels.as_ref().unwrap().get(key), Some(value));
            }
        }
    }

    /// Property: mutation never touches the input pod
    #[test]
    fn prop_mutation_leaves_input_unchanged(shape in pod_shape(), id in proxy_id()) {
        let pod = pod_from_shape(&shape);
        let before = pod.clone();
        let facts = facts_for(&pod, id);

        let _ = apply(&pod, &facts, &InjectorConfig::default());

        prop_assert_eq!(pod, before);
    }

    /// Property: applying the encoded patch to the original bytes yields the
    /// mutated pod
    #[test]
    fn prop_patch_reproduces_mutation(
        shape in pod_shape(),
        id in proxy_id(),
        metrics in any::<bool>(),
    ) {
        let pod = pod_from_shape(&shape);
        let raw = serde_json::to_vec(&pod).unwrap();
        let facts = facts_for(&pod, id);

        let mut mutated = apply(&pod, &facts, &InjectorConfig::default());
        if metrics {
            enable_metrics_scraping(&mut mutated);
        }
        let encoded = patch::encode(&raw, &mutated).unwrap();

        let patched = apply_patch(&raw, &encoded);
        prop_assert_eq!(patched, serde_json::to_value(&mutated).unwrap());
    }

    /// Property: every configured exclusion appears in the iptables script
    #[test]
    fn prop_iptables_contains_exclusions(
        ports in prop::collection::vec(1u16..=65535, 0..6),
        octets in prop::collection::vec((0u8..=255, 0u8..=32), 0..4),
    ) {
        let cidrs: Vec<String> = octets
            .iter()
            .map(|(octet, prefix)| format!("10.{octet}.0.0/{prefix}"))
            .collect();

        let script = generate_iptables_commands(&cidrs, &ports);

        for cidr in &cidrs {
            let rule = format!("-A PROXY_OUTPUT -d {cidr} -j RETURN");
            prop_assert!(script.contains(&rule), "missing rule for {}", cidr);
        }
        if ports.is_empty() {
            prop_assert!(!script.contains("multiport"));
        } else {
            let joined = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(",");
            let rule = format!("--dports {joined} -j RETURN");
            prop_assert!(script.contains(&rule));
        }
        prop_assert!(script.trim_end().ends_with("EOF"));
    }

    /// Property: exclusion lists survive the environment round trip
    #[test]
    fn prop_port_exclusions_parse_from_env(ports in prop::collection::vec(1u16..=65535, 1..6)) {
        let list = ports.iter().map(u16::to_string).collect::<Vec<_>>().join(", ");
        let config = InjectorConfig::from_lookup(|key| {
            (key == "OUTBOUND_PORT_EXCLUSION_LIST").then(|| list.clone())
        })
        .unwrap();
        prop_assert_eq!(config.outbound_port_exclusions, ports);
    }
}
