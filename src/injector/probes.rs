//! Health probe capture and rewriting
//!
//! Once iptables redirects inbound traffic through Envoy, kubelet probes that
//! hit the application port directly would be intercepted too. HTTP probes are
//! therefore pointed at dedicated Envoy listeners which forward to the original
//! port and path. The originals are captured first so the sidecar and its
//! bootstrap config can be built from them.
//!
//! HTTPS probes cannot be routed by path because Envoy only sees TLS bytes.
//! Their listener passes the connection through to the original port, so an
//! HTTPS probe keeps its path and scheme and only has its port rewritten.
//! Such a listener serves a single target; an HTTPS probe is left untouched
//! when another container has an HTTP probe of the same kind.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod, Probe};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

/// Kind of container probe
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProbeKind {
    Liveness,
    Readiness,
    Startup,
}

impl ProbeKind {
    pub const ALL: [ProbeKind; 3] = [ProbeKind::Liveness, ProbeKind::Readiness, ProbeKind::Startup];

    /// Port of the Envoy listener serving this probe kind
    pub fn listener_port(self) -> i32 {
        match self {
            ProbeKind::Liveness => 15901,
            ProbeKind::Readiness => 15902,
            ProbeKind::Startup => 15903,
        }
    }

    /// Path prefix of the rewritten probe
    pub fn path_prefix(self) -> &'static str {
        match self {
            ProbeKind::Liveness => "/osm-liveness-probe",
            ProbeKind::Readiness => "/osm-readiness-probe",
            ProbeKind::Startup => "/osm-startup-probe",
        }
    }

    /// Name of the sidecar container port exposing this probe listener
    pub fn port_name(self) -> &'static str {
        match self {
            ProbeKind::Liveness => "liveness-port",
            ProbeKind::Readiness => "readiness-port",
            ProbeKind::Startup => "startup-port",
        }
    }

    /// Path the kubelet probes after rewriting, unique per container
    pub fn rewritten_path(self, container: &str) -> String {
        format!("{}/{}", self.path_prefix(), container)
    }
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeKind::Liveness => write!(f, "liveness"),
            ProbeKind::Readiness => write!(f, "readiness"),
            ProbeKind::Startup => write!(f, "startup"),
        }
    }
}

/// Scheme of an HTTP probe
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ProbeScheme {
    #[default]
    Http,
    Https,
}

impl ProbeScheme {
    /// Read the scheme of an `HTTPGetAction`; unset means HTTP
    pub fn from_k8s(scheme: Option<&str>) -> Self {
        match scheme {
            Some(s) if s.eq_ignore_ascii_case("https") => ProbeScheme::Https,
            _ => ProbeScheme::Http,
        }
    }
}

/// Where an HTTP probe originally pointed, with named ports resolved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpTarget {
    pub port: i32,
    pub path: String,
    pub scheme: ProbeScheme,
}

/// One probe as it was defined before injection
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedProbe {
    pub probe: Probe,
    /// Set for HTTP probes whose port could be resolved; only these are rewritten
    pub http_target: Option<HttpTarget>,
}

/// Original probes of a single container
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ContainerProbes {
    pub liveness: Option<CapturedProbe>,
    pub readiness: Option<CapturedProbe>,
    pub startup: Option<CapturedProbe>,
}

impl ContainerProbes {
    pub fn get(&self, kind: ProbeKind) -> Option<&CapturedProbe> {
        match kind {
            ProbeKind::Liveness => self.liveness.as_ref(),
            ProbeKind::Readiness => self.readiness.as_ref(),
            ProbeKind::Startup => self.startup.as_ref(),
        }
    }

    fn is_empty(&self) -> bool {
        self.liveness.is_none() && self.readiness.is_none() && self.startup.is_none()
    }
}

/// Original probes keyed by container name.
///
/// Containers without any probe are absent, so a pod without probes yields an
/// empty map.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HealthProbes(pub BTreeMap<String, ContainerProbes>);

impl HealthProbes {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, container: &str) -> Option<&ContainerProbes> {
        self.0.get(container)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContainerProbes)> {
        self.0.iter()
    }

    /// Total number of captured probes across all containers
    pub fn probe_count(&self) -> usize {
        self.0
            .values()
            .map(|c| ProbeKind::ALL.iter().filter(|k| c.get(**k).is_some()).count())
            .sum()
    }

    /// Whether any container has a rewritable HTTP probe of this kind
    pub fn has_http(&self, kind: ProbeKind) -> bool {
        self.0
            .values()
            .any(|c| c.get(kind).is_some_and(|p| p.http_target.is_some()))
    }

    /// All rewritable HTTP probes of a kind as (container, target) pairs
    pub fn http_targets(&self, kind: ProbeKind) -> Vec<(&str, &HttpTarget)> {
        self.0
            .iter()
            .filter_map(|(name, c)| {
                c.get(kind)
                    .and_then(|p| p.http_target.as_ref())
                    .map(|t| (name.as_str(), t))
            })
            .collect()
    }

    /// Whether the listener for this kind passes TLS through instead of routing HTTP
    pub fn is_passthrough(&self, kind: ProbeKind) -> bool {
        self.http_targets(kind)
            .iter()
            .any(|(_, t)| t.scheme == ProbeScheme::Https)
    }

    /// HTTPS probes share their listener with nothing, so drop the rewrite for
    /// any HTTPS probe whose kind has more than one target
    fn release_shared_passthrough(&mut self) {
        for kind in ProbeKind::ALL {
            if self.http_targets(kind).len() < 2 {
                continue;
            }
            for probes in self.0.values_mut() {
                let slot = match kind {
                    ProbeKind::Liveness => probes.liveness.as_mut(),
                    ProbeKind::Readiness => probes.readiness.as_mut(),
                    ProbeKind::Startup => probes.startup.as_mut(),
                };
                if let Some(captured) = slot
                    && captured
                        .http_target
                        .as_ref()
                        .is_some_and(|t| t.scheme == ProbeScheme::Https)
                {
                    captured.http_target = None;
                }
            }
        }
    }
}

/// Capture every container probe of the pod without modifying it
pub fn capture_health_probes(pod: &Pod) -> HealthProbes {
    let containers = pod
        .spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default();

    let captured = containers
        .iter()
        .filter_map(|container| {
            let probes = ContainerProbes {
                liveness: capture(container, container.liveness_probe.as_ref()),
                readiness: capture(container, container.readiness_probe.as_ref()),
                startup: capture(container, container.startup_probe.as_ref()),
            };
            (!probes.is_empty()).then(|| (container.name.clone(), probes))
        })
        .collect();

    let mut probes = HealthProbes(captured);
    probes.release_shared_passthrough();
    probes
}

fn capture(container: &Container, probe: Option<&Probe>) -> Option<CapturedProbe> {
    let probe = probe?;
    let http_target = probe.http_get.as_ref().and_then(|http| {
        resolve_port(container, &http.port).map(|port| HttpTarget {
            port,
            path: http.path.clone().unwrap_or_else(|| "/".to_string()),
            scheme: ProbeScheme::from_k8s(http.scheme.as_deref()),
        })
    });
    Some(CapturedProbe {
        probe: probe.clone(),
        http_target,
    })
}

/// Resolve a probe port, looking named ports up in the container's ports
fn resolve_port(container: &Container, port: &IntOrString) -> Option<i32> {
    match port {
        IntOrString::Int(p) => Some(*p),
        IntOrString::String(name) => container
            .ports
            .as_deref()
            .unwrap_or_default()
            .iter()
            .find(|p| p.name.as_deref() == Some(name.as_str()))
            .map(|p| p.container_port)
            .or_else(|| name.parse().ok()),
    }
}

/// Point every captured HTTP probe at its Envoy listener.
///
/// Only probes present in `captured` are touched; TCP, gRPC and exec probes
/// stay as they are.
pub fn rewrite_health_probes(pod: &mut Pod, captured: &HealthProbes) {
    let Some(spec) = pod.spec.as_mut() else {
        return;
    };

    for container in &mut spec.containers {
        let Some(original) = captured.get(&container.name) else {
            continue;
        };
        let name = container.name.clone();
        for kind in ProbeKind::ALL {
            let Some(target) = original.get(kind).and_then(|p| p.http_target.as_ref()) else {
                continue;
            };
            let slot = match kind {
                ProbeKind::Liveness => &mut container.liveness_probe,
                ProbeKind::Readiness => &mut container.readiness_probe,
                ProbeKind::Startup => &mut container.startup_probe,
            };
            if let Some(http) = slot.as_mut().and_then(|p| p.http_get.as_mut()) {
                http.port = IntOrString::Int(kind.listener_port());
                if target.scheme == ProbeScheme::Http {
                    http.path = Some(kind.rewritten_path(&name));
                    http.scheme = None;
                }
            }
        }
    }
}
