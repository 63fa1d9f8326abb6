//! Injection pipeline tests
//!
//! Drive `Injector::mutate` with recording collaborators and check both the
//! side effects and the resulting patch.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use uuid::Uuid;

use sidecar_injector::config::InjectorConfig;
use sidecar_injector::health::HealthState;
use sidecar_injector::injector::Error;

use crate::common::*;

fn proxy_id() -> Uuid {
    Uuid::parse_str("0b7a6d36-5a8e-4f7e-9c8f-3f0f6c1f2e10").unwrap()
}

fn bookstore() -> k8s_openapi::api::core::v1::Pod {
    PodBuilder::new("bookstore")
        .with_namespace("ns-1")
        .with_service_account("sa-1")
        .with_label("app", "bookstore")
        .build()
}

mod scenario_tests {
    use super::*;

    #[tokio::test]
    async fn test_injects_and_creates_bootstrap_config() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();

        assert_eq!(
            mocks.issued_common_names(),
            vec![format!("{}.sa-1.ns-1", proxy_id())]
        );
        let creates = mocks.create_calls();
        assert_eq!(creates.len(), 1);
        assert_eq!(
            creates[0].name,
            format!("envoy-bootstrap-config-{}", proxy_id())
        );
        assert_eq!(creates[0].namespace, "ns-1");
        assert_eq!(creates[0].controller_namespace, "osm-system");
        assert_eq!(creates[0].common_name, format!("{}.sa-1.ns-1", proxy_id()));

        let pod = patched_pod(&request.raw, &patch);
        let spec = pod.spec.unwrap();
        assert_eq!(spec.containers.len(), 2);
        assert_eq!(spec.containers[1].name, "envoy");
        assert_eq!(spec.init_containers.unwrap().len(), 1);
        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes.len(), 1);
        assert_eq!(
            volumes[0].secret.as_ref().unwrap().secret_name.as_deref(),
            Some(format!("envoy-bootstrap-config-{}", proxy_id()).as_str())
        );

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["envoy-uid"], proxy_id().to_string());
        assert_eq!(labels["app"], "bookstore");
        assert!(pod.metadata.annotations.is_none());
    }

    #[tokio::test]
    async fn test_dry_run_skips_bootstrap_config() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let live = injection_request(&bookstore(), "ns-1", proxy_id(), false);
        let dry = injection_request(&bookstore(), "ns-1", proxy_id(), true);

        let dry_patch = injector.mutate(&dry).await.unwrap();
        assert!(mocks.create_calls().is_empty());
        assert_eq!(mocks.calls(), vec!["issue", "metrics"]);

        // Same proxy id, same patch, whether or not the secret was created
        let live_patch = injector.mutate(&live).await.unwrap();
        assert_eq!(dry_patch, live_patch);
        assert_eq!(mocks.create_calls().len(), 1);
    }

    #[tokio::test]
    async fn test_metrics_enabled_adds_scrape_annotations() {
        let mocks = Mocks::new().metrics_enabled();
        let injector = mocks.injector(InjectorConfig::default());
        let pod = PodBuilder::new("bookstore")
            .with_service_account("sa-1")
            .with_annotation("team", "books")
            .build();
        let request = injection_request(&pod, "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();
        let annotations = patched_pod(&request.raw, &patch)
            .metadata
            .annotations
            .unwrap();

        assert_eq!(annotations["prometheus.io/scrape"], "true");
        assert_eq!(annotations["prometheus.io/port"], "15010");
        assert_eq!(annotations["prometheus.io/path"], "/stats/prometheus");
        assert_eq!(annotations["team"], "books");
    }

    #[tokio::test]
    async fn test_collaborators_called_in_order() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        injector.mutate(&request).await.unwrap();
        assert_eq!(mocks.calls(), vec!["issue", "create", "metrics"]);
    }

    #[tokio::test]
    async fn test_uses_configured_validity_and_controller_namespace() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig {
            bootstrap_cert_validity: Duration::from_secs(120),
            controller_namespace: "mesh-system".to_string(),
            ..Default::default()
        });
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        injector.mutate(&request).await.unwrap();

        let requests = mocks.issuer.requests.lock().unwrap().clone();
        assert_eq!(requests[0].1, Duration::from_secs(120));
        assert_eq!(mocks.create_calls()[0].controller_namespace, "mesh-system");
    }

    #[tokio::test]
    async fn test_default_service_account() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let pod = PodBuilder::new("bookstore").build();
        let request = injection_request(&pod, "ns-1", proxy_id(), false);

        injector.mutate(&request).await.unwrap();
        assert_eq!(
            mocks.issued_common_names(),
            vec![format!("{}.default.ns-1", proxy_id())]
        );
    }
}

mod failure_tests {
    use super::*;

    #[tokio::test]
    async fn test_identity_failure_stops_pipeline() {
        let mocks = Mocks::new().failing_issuer();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        let err = injector.mutate(&request).await.unwrap_err();
        assert!(matches!(err, Error::CertificateError { .. }));
        assert_eq!(err.reason(), "CertificateIssuanceFailed");
        assert!(mocks.create_calls().is_empty());
        assert_eq!(mocks.calls(), vec!["issue"]);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_stops_pipeline() {
        let mocks = Mocks::new().failing_bootstrap();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        let err = injector.mutate(&request).await.unwrap_err();
        assert!(matches!(err, Error::BootstrapConfigError { .. }));
        assert_eq!(mocks.calls(), vec!["issue", "create"]);
    }

    #[tokio::test]
    async fn test_bootstrap_failure_irrelevant_for_dry_run() {
        let mocks = Mocks::new().failing_bootstrap();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), true);

        assert!(injector.mutate(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_namespace_lookup_failure_is_fatal() {
        let mocks = Mocks::new().failing_namespace_lookup();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        let err = injector.mutate(&request).await.unwrap_err();
        assert!(matches!(err, Error::NamespaceLookupError { .. }));
        assert_eq!(err.reason(), "NamespaceLookupFailed");
        // The secret was already created; nothing rolls it back
        assert_eq!(mocks.calls(), vec!["issue", "create", "metrics"]);
    }

    #[tokio::test]
    async fn test_errors_are_counted() {
        let mocks = Mocks::new().failing_issuer();
        let state = Arc::new(HealthState::new());
        let injector = mocks
            .injector(InjectorConfig::default())
            .with_health_state(state.clone());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        injector.mutate(&request).await.unwrap_err();

        let encoded = state.metrics.encode();
        assert!(encoded.contains(
            "sidecar_injector_injection_errors_total{reason=\"CertificateIssuanceFailed\"} 1"
        ));
        assert!(encoded.contains("sidecar_injector_certificates_issued_total 0"));
    }
}

mod probe_tests {
    use super::*;
    use sidecar_injector::injector::ProbeKind;

    #[tokio::test]
    async fn test_no_probes_no_probe_ports() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();
        let pod = patched_pod(&request.raw, &patch);
        let sidecar = &pod.spec.unwrap().containers[1];
        let names: Vec<_> = sidecar
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["proxy-admin", "proxy-inbound", "proxy-metrics"]);
        assert!(mocks.create_calls()[0].probes.is_empty());
    }

    #[tokio::test]
    async fn test_http_probes_are_rewritten_and_captured() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let pod = PodBuilder::new("bookstore")
            .with_service_account("sa-1")
            .with_port("app", "http", 8080)
            .with_http_liveness("app", IntOrString::String("http".to_string()), "/healthz")
            .with_http_readiness("app", IntOrString::Int(8081), "/ready")
            .with_tcp_startup("app", 8080)
            .build();
        let request = injection_request(&pod, "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();

        // The bootstrap config sees the original targets
        let probes = &mocks.create_calls()[0].probes;
        assert_eq!(probes.probe_count(), 3);
        let liveness = probes.http_targets(ProbeKind::Liveness);
        assert_eq!(liveness.len(), 1);
        assert_eq!(liveness[0].0, "app");
        assert_eq!(liveness[0].1.port, 8080);
        assert_eq!(liveness[0].1.path, "/healthz");
        assert!(!probes.has_http(ProbeKind::Startup));

        let pod = patched_pod(&request.raw, &patch);
        let spec = pod.spec.unwrap();
        let app = &spec.containers[0];
        let live = app.liveness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(live.port, IntOrString::Int(15901));
        assert_eq!(live.path.as_deref(), Some("/osm-liveness-probe/app"));
        let ready = app.readiness_probe.as_ref().unwrap().http_get.as_ref().unwrap();
        assert_eq!(ready.port, IntOrString::Int(15902));
        // TCP probes are left alone
        let startup = app.startup_probe.as_ref().unwrap().tcp_socket.as_ref().unwrap();
        assert_eq!(startup.port, IntOrString::Int(8080));

        let sidecar_ports: Vec<i32> = spec.containers[1]
            .ports
            .as_ref()
            .unwrap()
            .iter()
            .map(|p| p.container_port)
            .collect();
        assert!(sidecar_ports.contains(&15901));
        assert!(sidecar_ports.contains(&15902));
        assert!(!sidecar_ports.contains(&15903));
    }

    #[tokio::test]
    async fn test_https_probe_keeps_tls_to_application() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let pod = PodBuilder::new("bookstore")
            .with_service_account("sa-1")
            .with_https_liveness("app", 8443, "/healthz")
            .build();
        let request = injection_request(&pod, "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();

        let probes = &mocks.create_calls()[0].probes;
        assert!(probes.is_passthrough(ProbeKind::Liveness));

        let pod = patched_pod(&request.raw, &patch);
        let live = pod.spec.unwrap().containers[0]
            .liveness_probe
            .clone()
            .unwrap()
            .http_get
            .unwrap();
        assert_eq!(live.port, IntOrString::Int(15901));
        assert_eq!(live.path.as_deref(), Some("/healthz"));
        assert_eq!(live.scheme.as_deref(), Some("HTTPS"));
    }
}

mod patch_tests {
    use super::*;

    #[tokio::test]
    async fn test_patch_adds_exactly_one_of_each() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let pod = PodBuilder::new("bookstore")
            .with_service_account("sa-1")
            .with_container("worker")
            .with_init_container("migrate")
            .build();
        let request = injection_request(&pod, "ns-1", proxy_id(), false);

        let patch = injector.mutate(&request).await.unwrap();
        let patched = patched_pod(&request.raw, &patch);
        let spec = patched.spec.unwrap();

        assert_eq!(spec.containers.len(), 3);
        assert_eq!(spec.containers[0].name, "app");
        assert_eq!(spec.containers[1].name, "worker");
        let init = spec.init_containers.unwrap();
        assert_eq!(init.len(), 2);
        assert_eq!(init[0].name, "migrate");
        assert_eq!(init[1].name, "osm-init");
    }

    #[tokio::test]
    async fn test_api_server_pod_only_touches_injected_fields() {
        let mocks = Mocks::new().metrics_enabled();
        let injector = mocks.injector(InjectorConfig::default());
        // Shape of a pod as the API server forwards it to admission
        let raw = br#"{
            "kind": "Pod",
            "apiVersion": "v1",
            "metadata": {
                "generateName": "bookstore-5d8f7-",
                "namespace": "ns-1",
                "creationTimestamp": null,
                "labels": {"app": "bookstore"}
            },
            "spec": {
                "containers": [{
                    "name": "app",
                    "image": "bookstore:v1",
                    "resources": {},
                    "terminationMessagePath": "/dev/termination-log",
                    "imagePullPolicy": "IfNotPresent"
                }],
                "restartPolicy": "Always",
                "serviceAccountName": "sa-1",
                "securityContext": {}
            },
            "status": {}
        }"#;
        let request =
            sidecar_injector::injector::InjectionRequest::from_raw("ns-1", proxy_id(), false, raw.to_vec())
                .unwrap();

        let patch = injector.mutate(&request).await.unwrap();

        let ops: serde_json::Value = serde_json::from_slice(&patch).unwrap();
        let allowed = [
            "/metadata/labels",
            "/metadata/annotations",
            "/spec/containers",
            "/spec/initContainers",
            "/spec/volumes",
        ];
        for op in ops.as_array().unwrap() {
            let path = op["path"].as_str().unwrap();
            assert!(
                allowed.iter().any(|prefix| path.starts_with(prefix)),
                "unexpected patch op {}",
                op
            );
        }
        let pod = patched_pod(&request.raw, &patch);
        assert_eq!(pod.metadata.annotations.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_patch_is_deterministic_for_same_proxy_id() {
        let mocks = Mocks::new();
        let injector = mocks.injector(InjectorConfig::default());
        let request = injection_request(&bookstore(), "ns-1", proxy_id(), true);

        let first = injector.mutate(&request).await.unwrap();
        let second = injector.mutate(&request).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_successful_patches_are_counted() {
        let mocks = Mocks::new();
        let state = Arc::new(HealthState::new());
        let injector = mocks
            .injector(InjectorConfig::default())
            .with_health_state(state.clone());

        injector
            .mutate(&injection_request(&bookstore(), "ns-1", proxy_id(), true))
            .await
            .unwrap();

        let encoded = state.metrics.encode();
        assert!(encoded.contains("sidecar_injector_patches_generated_total{dry_run=\"true\"} 1"));
        assert!(encoded.contains("sidecar_injector_certificates_issued_total 1"));
        assert!(state.metrics.last_injection_timestamp_seconds.get() > 0);
    }
}
