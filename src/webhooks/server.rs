//! Webhook HTTP server handlers
//!
//! Implements the MutatingAdmissionWebhook endpoint that injects the Envoy
//! sidecar into pods as they are created.

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::post};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::health::HealthState;
use crate::injector::{
    BootstrapConfigCreator, CertificateIssuer, Error, InjectionRequest, Injector, NamespaceMetrics,
};

/// Path the API server posts pod admissions to
pub const MUTATE_POD_PATH: &str = "/mutate-pod-creation";

/// Patch type announced in every patched response
const JSON_PATCH_TYPE: &str = "JSONPatch";

/// Kubernetes AdmissionReview request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReview {
    pub api_version: String,
    pub kind: String,
    pub request: Option<AdmissionRequest>,
}

/// AdmissionRequest contains the details of the admission request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionRequest {
    pub uid: String,
    pub kind: GroupVersionKind,
    pub operation: String,
    pub namespace: Option<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Object exactly as sent, so the patch is computed against these bytes
    pub object: Option<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupVersionKind {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub kind: String,
}

/// AdmissionReview response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionReviewResponse {
    pub api_version: String,
    pub kind: String,
    pub response: AdmissionResponse,
}

/// AdmissionResponse contains the result
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionResponse {
    pub uid: String,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AdmissionStatus>,
    /// Base64 encoded JSON patch
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patch_type: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionStatus {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Create the webhook router
pub fn create_webhook_router<I, B, N>(injector: Arc<Injector<I, B, N>>) -> Router
where
    I: CertificateIssuer + 'static,
    B: BootstrapConfigCreator + 'static,
    N: NamespaceMetrics + 'static,
{
    Router::new()
        .route(MUTATE_POD_PATH, post(mutate_pod_creation::<I, B, N>))
        .with_state(injector)
}

/// Pod creation admission webhook handler
async fn mutate_pod_creation<I, B, N>(
    State(injector): State<Arc<Injector<I, B, N>>>,
    Json(review): Json<AdmissionReview>,
) -> impl IntoResponse
where
    I: CertificateIssuer + 'static,
    B: BootstrapConfigCreator + 'static,
    N: NamespaceMetrics + 'static,
{
    let request = match review.request {
        Some(req) => req,
        None => {
            error!("Admission review missing request");
            return (
                StatusCode::BAD_REQUEST,
                Json(create_response(
                    "",
                    false,
                    "Missing request in AdmissionReview",
                    None,
                )),
            );
        }
    };

    (
        StatusCode::OK,
        Json(review_pod(&injector, request, Uuid::new_v4()).await),
    )
}

/// Answer one admission request, injecting the sidecar into pods.
///
/// Anything that is not a pod with an object is allowed untouched. Injection
/// failures deny the admission with the error's reason.
pub async fn review_pod<I, B, N>(
    injector: &Injector<I, B, N>,
    request: AdmissionRequest,
    proxy_id: Uuid,
) -> AdmissionReviewResponse
where
    I: CertificateIssuer,
    B: BootstrapConfigCreator,
    N: NamespaceMetrics,
{
    let uid = request.uid.clone();
    info!(
        uid = %uid,
        operation = %request.operation,
        namespace = ?request.namespace,
        name = ?request.name,
        dry_run = request.dry_run,
        "Processing admission request"
    );

    if request.kind.kind != "Pod" {
        debug!(uid = %uid, kind = %request.kind.kind, "Not a pod, allowing without patch");
        return create_response(&uid, true, "", None);
    }

    let Some(object) = request.object else {
        debug!(uid = %uid, "No object in request, allowing without patch");
        return create_response(&uid, true, "", None);
    };

    let result = match request.namespace.filter(|ns| !ns.is_empty()) {
        Some(namespace) => {
            match InjectionRequest::from_raw(
                namespace,
                proxy_id,
                request.dry_run,
                object.get().as_bytes().to_vec(),
            ) {
                Ok(injection) => injector.mutate(&injection).await,
                Err(e) => Err(e),
            }
        }
        None => Err(Error::InvalidRequest(
            "pod admission request has no namespace".to_string(),
        )),
    };

    match result {
        Ok(patch) => {
            info!(uid = %uid, proxy_id = %proxy_id, "Sidecar injected");
            create_patch_response(&uid, &patch)
        }
        Err(e) => {
            error!(uid = %uid, reason = e.reason(), error = %e, "Sidecar injection failed");
            create_error_response(&uid, &e)
        }
    }
}

/// Create an AdmissionReview response
fn create_response(
    uid: &str,
    allowed: bool,
    message: &str,
    reason: Option<&str>,
) -> AdmissionReviewResponse {
    AdmissionReviewResponse {
        api_version: "admission.k8s.io/v1".to_string(),
        kind: "AdmissionReview".to_string(),
        response: AdmissionResponse {
            uid: uid.to_string(),
            allowed,
            status: if allowed {
                None
            } else {
                Some(AdmissionStatus {
                    code: 403,
                    message: message.to_string(),
                    reason: reason.map(String::from),
                })
            },
            patch: None,
            patch_type: None,
        },
    }
}

/// Create an allowed response carrying a JSON patch
fn create_patch_response(uid: &str, patch: &[u8]) -> AdmissionReviewResponse {
    let mut review = create_response(uid, true, "", None);
    review.response.patch = Some(STANDARD.encode(patch));
    review.response.patch_type = Some(JSON_PATCH_TYPE.to_string());
    review
}

/// Create a denied response for a failed injection
fn create_error_response(uid: &str, err: &Error) -> AdmissionReviewResponse {
    let mut review = create_response(uid, false, &err.to_string(), Some(err.reason()));
    if let Some(status) = review.response.status.as_mut() {
        status.code = match err {
            Error::InvalidRequest(_) => 400,
            _ => 500,
        };
    }
    review
}

/// Default path to webhook TLS certificate
pub const WEBHOOK_CERT_PATH: &str = "/etc/webhook/certs/tls.crt";
/// Default path to webhook TLS private key
pub const WEBHOOK_KEY_PATH: &str = "/etc/webhook/certs/tls.key";
/// Default webhook server port
pub const WEBHOOK_PORT: u16 = 8443;

/// Run the webhook server with TLS
///
/// Binds to 0.0.0.0:8443 and serves the pod mutation endpoint. Readiness is
/// reported through `health_state` once TLS is configured.
///
/// # Arguments
/// * `injector` - Injection pipeline shared by all requests
/// * `cert_path` - Path to TLS certificate file (PEM format)
/// * `key_path` - Path to TLS private key file (PEM format)
pub async fn run_webhook_server<I, B, N>(
    injector: Arc<Injector<I, B, N>>,
    cert_path: &str,
    key_path: &str,
    health_state: Option<Arc<HealthState>>,
) -> Result<(), WebhookError>
where
    I: CertificateIssuer + 'static,
    B: BootstrapConfigCreator + 'static,
    N: NamespaceMetrics + 'static,
{
    use axum_server::tls_rustls::RustlsConfig;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    let app = create_webhook_router(injector);

    let config = RustlsConfig::from_pem_file(PathBuf::from(cert_path), PathBuf::from(key_path))
        .await
        .map_err(|e| WebhookError::TlsConfig(e.to_string()))?;

    let addr = SocketAddr::from(([0, 0, 0, 0], WEBHOOK_PORT));
    info!("Webhook server listening on {} with TLS", addr);

    if let Some(state) = &health_state {
        state.set_ready(true).await;
    }

    let served = axum_server::bind_rustls(addr, config)
        .serve(app.into_make_service())
        .await
        .map_err(|e| WebhookError::Server(e.to_string()));

    if let Some(state) = &health_state {
        state.set_ready(false).await;
    }

    served
}

/// Errors that can occur when running the webhook server
#[derive(Debug, Error)]
pub enum WebhookError {
    /// TLS configuration error
    #[error("TLS configuration error: {0}")]
    TlsConfig(String),
    /// Server error
    #[error("Webhook server error: {0}")]
    Server(String),
}
