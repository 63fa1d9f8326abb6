//! Injector configuration
//!
//! Values that parameterize the injected containers and the bootstrap
//! certificate. Loaded from the environment of the webhook pod, with
//! defaults suitable for a stock mesh install.

use std::net::Ipv4Addr;
use std::time::Duration;

use thiserror::Error;

/// Default Envoy sidecar image
pub const DEFAULT_SIDECAR_IMAGE: &str = "envoyproxy/envoy-alpine:v1.19.3";

/// Default init container image (ships iptables)
pub const DEFAULT_INIT_CONTAINER_IMAGE: &str = "openservicemesh/init:v0.9.0";

/// Default namespace the control plane runs in
pub const DEFAULT_CONTROLLER_NAMESPACE: &str = "osm-system";

/// Bootstrap certificates only need to live long enough for Envoy to
/// connect to xDS and fetch its real identity.
pub const DEFAULT_BOOTSTRAP_CERT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Errors raised while reading configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid IPv4 CIDR '{0}' in outbound IP range exclusion list")]
    InvalidCidr(String),

    #[error("Invalid port '{0}' in outbound port exclusion list")]
    InvalidPort(String),

    #[error("Invalid boolean '{value}' for {name}")]
    InvalidBool { name: &'static str, value: String },

    #[error("Invalid duration '{value}' for {name}")]
    InvalidDuration { name: &'static str, value: String },
}

/// Configuration consumed by the container builders and the orchestrator
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InjectorConfig {
    /// Envoy sidecar image
    pub sidecar_image: String,
    /// Image of the iptables init container
    pub init_container_image: String,
    /// Envoy `--log-level`
    pub envoy_log_level: String,
    /// CIDRs whose outbound traffic bypasses the sidecar
    pub outbound_ip_range_exclusions: Vec<String>,
    /// Destination ports whose outbound traffic bypasses the sidecar
    pub outbound_port_exclusions: Vec<u16>,
    /// Run the init container privileged instead of with NET_ADMIN only
    pub privileged_init_container: bool,
    /// Lifetime of the bootstrap (xDS client) certificate
    pub bootstrap_cert_validity: Duration,
    /// Namespace of the control plane, used to address the xDS server
    pub controller_namespace: String,
}

impl Default for InjectorConfig {
    fn default() -> Self {
        Self {
            sidecar_image: DEFAULT_SIDECAR_IMAGE.to_string(),
            init_container_image: DEFAULT_INIT_CONTAINER_IMAGE.to_string(),
            envoy_log_level: "error".to_string(),
            outbound_ip_range_exclusions: Vec::new(),
            outbound_port_exclusions: Vec::new(),
            privileged_init_container: false,
            bootstrap_cert_validity: DEFAULT_BOOTSTRAP_CERT_VALIDITY,
            controller_namespace: DEFAULT_CONTROLLER_NAMESPACE.to_string(),
        }
    }
}

impl InjectorConfig {
    /// Build the configuration from process environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Unset or empty variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let outbound_ip_range_exclusions = match get("OUTBOUND_IP_RANGE_EXCLUSION_LIST") {
            Some(list) => parse_cidr_list(&list)?,
            None => defaults.outbound_ip_range_exclusions,
        };

        let outbound_port_exclusions = match get("OUTBOUND_PORT_EXCLUSION_LIST") {
            Some(list) => parse_port_list(&list)?,
            None => defaults.outbound_port_exclusions,
        };

        let privileged_init_container = match get("PRIVILEGED_INIT_CONTAINER") {
            Some(value) => parse_bool("PRIVILEGED_INIT_CONTAINER", &value)?,
            None => defaults.privileged_init_container,
        };

        let bootstrap_cert_validity = match get("BOOTSTRAP_CERT_VALIDITY_SECS") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .ok_or(ConfigError::InvalidDuration {
                    name: "BOOTSTRAP_CERT_VALIDITY_SECS",
                    value,
                })?,
            None => defaults.bootstrap_cert_validity,
        };

        Ok(Self {
            sidecar_image: get("SIDECAR_IMAGE").unwrap_or(defaults.sidecar_image),
            init_container_image: get("INIT_CONTAINER_IMAGE")
                .unwrap_or(defaults.init_container_image),
            envoy_log_level: get("ENVOY_LOG_LEVEL").unwrap_or(defaults.envoy_log_level),
            outbound_ip_range_exclusions,
            outbound_port_exclusions,
            privileged_init_container,
            bootstrap_cert_validity,
            controller_namespace: get("POD_NAMESPACE").unwrap_or(defaults.controller_namespace),
        })
    }
}

/// Parse a comma separated list of CIDRs, rejecting anything malformed
fn parse_cidr_list(list: &str) -> Result<Vec<String>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|cidr| {
            if is_valid_cidr(cidr) {
                Ok(cidr.to_string())
            } else {
                Err(ConfigError::InvalidCidr(cidr.to_string()))
            }
        })
        .collect()
}

/// Exclusions end up in an IPv4 `iptables-restore` script, so only IPv4
/// ranges are accepted
fn is_valid_cidr(cidr: &str) -> bool {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return false;
    };
    addr.parse::<Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

/// Parse a comma separated list of non-zero ports
fn parse_port_list(list: &str) -> Result<Vec<u16>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|port| match port.parse::<u16>() {
            Ok(p) if p > 0 => Ok(p),
            _ => Err(ConfigError::InvalidPort(port.to_string())),
        })
        .collect()
}

fn parse_bool(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name,
            value: value.to_string(),
        }),
    }
}
