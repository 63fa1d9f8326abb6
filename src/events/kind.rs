//! Announcement kinds used as event bus topics

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic of a bus message.
///
/// The string form is kebab-case, e.g. `pod-added` or `proxy-broadcast`.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Kind {
    PodAdded,
    PodUpdated,
    PodDeleted,
    EndpointAdded,
    EndpointUpdated,
    EndpointDeleted,
    NamespaceAdded,
    NamespaceUpdated,
    NamespaceDeleted,
    ServiceAdded,
    ServiceUpdated,
    ServiceDeleted,
    ServiceAccountAdded,
    ServiceAccountUpdated,
    ServiceAccountDeleted,
    MeshConfigAdded,
    MeshConfigUpdated,
    MeshConfigDeleted,
    /// A proxy certificate was rotated
    CertificateRotated,
    /// Every connected proxy must be re-sent its config
    ProxyBroadcast,
}

impl Kind {
    pub const ALL: [Kind; 20] = [
        Kind::PodAdded,
        Kind::PodUpdated,
        Kind::PodDeleted,
        Kind::EndpointAdded,
        Kind::EndpointUpdated,
        Kind::EndpointDeleted,
        Kind::NamespaceAdded,
        Kind::NamespaceUpdated,
        Kind::NamespaceDeleted,
        Kind::ServiceAdded,
        Kind::ServiceUpdated,
        Kind::ServiceDeleted,
        Kind::ServiceAccountAdded,
        Kind::ServiceAccountUpdated,
        Kind::ServiceAccountDeleted,
        Kind::MeshConfigAdded,
        Kind::MeshConfigUpdated,
        Kind::MeshConfigDeleted,
        Kind::CertificateRotated,
        Kind::ProxyBroadcast,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::PodAdded => "pod-added",
            Kind::PodUpdated => "pod-updated",
            Kind::PodDeleted => "pod-deleted",
            Kind::EndpointAdded => "endpoint-added",
            Kind::EndpointUpdated => "endpoint-updated",
            Kind::EndpointDeleted => "endpoint-deleted",
            Kind::NamespaceAdded => "namespace-added",
            Kind::NamespaceUpdated => "namespace-updated",
            Kind::NamespaceDeleted => "namespace-deleted",
            Kind::ServiceAdded => "service-added",
            Kind::ServiceUpdated => "service-updated",
            Kind::ServiceDeleted => "service-deleted",
            Kind::ServiceAccountAdded => "service-account-added",
            Kind::ServiceAccountUpdated => "service-account-updated",
            Kind::ServiceAccountDeleted => "service-account-deleted",
            Kind::MeshConfigAdded => "mesh-config-added",
            Kind::MeshConfigUpdated => "mesh-config-updated",
            Kind::MeshConfigDeleted => "mesh-config-deleted",
            Kind::CertificateRotated => "certificate-rotated",
            Kind::ProxyBroadcast => "proxy-broadcast",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unknown announcement kind: {0}")]
pub struct UnknownKind(pub String);

impl FromStr for Kind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Kind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownKind(s.to_string()))
    }
}
