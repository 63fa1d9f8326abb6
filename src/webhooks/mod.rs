//! Admission webhook for pod sidecar injection
//!
//! The API server calls the mutating webhook for every pod creation in a
//! namespace selected for injection; the response carries a JSON patch that
//! adds the Envoy sidecar, its init container and bootstrap volume.

mod server;

pub use server::{
    AdmissionRequest, AdmissionResponse, AdmissionReview, AdmissionReviewResponse,
    AdmissionStatus, GroupVersionKind, MUTATE_POD_PATH, WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH,
    WEBHOOK_PORT, WebhookError, create_webhook_router, review_pod, run_webhook_server,
};
