pub mod config;
pub mod events;
pub mod health;
pub mod injector;
pub mod pki;
pub mod resources;
pub mod webhooks;

pub use config::{ConfigError, InjectorConfig};
pub use events::{EventBus, Kind, Message, Subscription};
pub use health::{HealthState, Metrics};
pub use injector::{Error, InjectionRequest, Injector, KubeNamespaceMetrics, Result};
pub use pki::{CA_CERT_PATH, CA_KEY_PATH, CertificateAuthority, PkiError};
pub use resources::bootstrap::KubeBootstrapConfigCreator;
pub use webhooks::{
    WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH, WEBHOOK_PORT, WebhookError, run_webhook_server,
};

use std::sync::Arc;

use kube::Client;

/// Injector wired to the Kubernetes API and the in-process CA
pub type KubeInjector = Injector<CertificateAuthority, KubeBootstrapConfigCreator, KubeNamespaceMetrics>;

/// Build the injection pipeline used by the webhook server.
///
/// Metrics are recorded into `health_state` when given.
pub fn build_injector(
    client: Client,
    config: InjectorConfig,
    ca: CertificateAuthority,
    health_state: Option<Arc<HealthState>>,
) -> KubeInjector {
    tracing::info!(
        sidecar_image = %config.sidecar_image,
        init_image = %config.init_container_image,
        controller_namespace = %config.controller_namespace,
        "Building sidecar injector"
    );

    let injector = Injector::new(
        Arc::new(config),
        ca,
        KubeBootstrapConfigCreator::new(client.clone()),
        KubeNamespaceMetrics::new(client),
    );

    match health_state {
        Some(state) => injector.with_health_state(state),
        None => injector,
    }
}
