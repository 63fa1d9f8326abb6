//! Health server for Kubernetes probes and Prometheus metrics
//!
//! Provides HTTP endpoints for:
//! - `/healthz` - Liveness probe (is the process alive?)
//! - `/readyz` - Readiness probe (is the injector ready to serve admissions?)
//! - `/metrics` - Prometheus metrics

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::RwLock;

/// Address the health server binds to
pub const HEALTH_ADDR: &str = "0.0.0.0:8080";

/// Labels for generated patches
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PatchLabels {
    pub dry_run: bool,
}

impl prometheus_client::encoding::EncodeLabelSet for PatchLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        let dry_run = if self.dry_run { "true" } else { "false" };
        ("dry_run", dry_run).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for injection failures
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct ErrorLabels {
    pub reason: String,
}

impl prometheus_client::encoding::EncodeLabelSet for ErrorLabels {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder<'_>,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        ("reason", self.reason.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics state
pub struct Metrics {
    /// Bootstrap certificates issued
    pub certificates_issued_total: Counter,
    /// Time spent waiting on the certificate issuer
    pub certificate_issuance_duration_seconds: Histogram,
    /// Patches returned to the API server
    pub patches_generated_total: Family<PatchLabels, Counter>,
    /// Failed injections by reason
    pub injection_errors_total: Family<ErrorLabels, Counter>,
    /// Unix time of the latest successful injection, 0 before the first
    pub last_injection_timestamp_seconds: Gauge,

    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let certificates_issued_total = Counter::default();
        registry.register(
            "sidecar_injector_certificates_issued",
            "Total number of bootstrap certificates issued",
            certificates_issued_total.clone(),
        );

        let certificate_issuance_duration_seconds =
            Histogram::new(exponential_buckets(0.0005, 2.0, 15));
        registry.register(
            "sidecar_injector_certificate_issuance_duration_seconds",
            "Duration of bootstrap certificate issuance in seconds",
            certificate_issuance_duration_seconds.clone(),
        );

        let patches_generated_total = Family::<PatchLabels, Counter>::default();
        registry.register(
            "sidecar_injector_patches_generated",
            "Total number of pod patches generated",
            patches_generated_total.clone(),
        );

        let injection_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "sidecar_injector_injection_errors",
            "Total number of failed sidecar injections",
            injection_errors_total.clone(),
        );

        let last_injection_timestamp_seconds = Gauge::default();
        registry.register(
            "sidecar_injector_last_injection_timestamp_seconds",
            "Unix time of the latest successful sidecar injection",
            last_injection_timestamp_seconds.clone(),
        );

        Self {
            certificates_issued_total,
            certificate_issuance_duration_seconds,
            patches_generated_total,
            injection_errors_total,
            last_injection_timestamp_seconds,
            registry,
        }
    }

    /// Record an issued certificate and how long issuance took
    pub fn record_certificate_issued(&self, duration_secs: f64) {
        self.certificates_issued_total.inc();
        self.certificate_issuance_duration_seconds
            .observe(duration_secs);
    }

    /// Record a generated patch
    pub fn record_patch(&self, dry_run: bool) {
        self.patches_generated_total
            .get_or_create(&PatchLabels { dry_run })
            .inc();
    }

    /// Stamp the time of the latest successful injection
    pub fn record_injection_time(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.last_injection_timestamp_seconds
            .set(i64::try_from(now).unwrap_or(i64::MAX));
    }

    /// Record a failed injection
    pub fn record_error(&self, reason: &str) {
        let labels = ErrorLabels {
            reason: reason.to_string(),
        };
        self.injection_errors_total.get_or_create(&labels).inc();
    }

    /// Encode metrics to Prometheus text format
    ///
    /// Returns an empty string if encoding fails (should never happen with valid metrics).
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if let Err(e) = encode(&mut buffer, &self.registry) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the webhook is serving
    pub ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the injector as ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the injector is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable until the webhook server is up.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Run the health server
///
/// Binds to 0.0.0.0:8080 and serves health/metrics endpoints.
pub async fn run_health_server(state: Arc<HealthState>) -> Result<(), std::io::Error> {
    let app = create_router(state);

    let listener = TcpListener::bind(HEALTH_ADDR).await?;
    tracing::info!("Health server listening on {}", HEALTH_ADDR);

    axum::serve(listener, app).await
}
