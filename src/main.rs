use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::signal;
use tracing::{error, info};

use sidecar_injector::health::{HealthState, run_health_server};
use sidecar_injector::{
    CA_CERT_PATH, CA_KEY_PATH, CertificateAuthority, InjectorConfig, WEBHOOK_CERT_PATH,
    WEBHOOK_KEY_PATH, build_injector, run_webhook_server,
};

/// Grace period for in-flight admissions to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        // Check if a provider is already installed (common in test scenarios)
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            return Err(
                "Failed to install rustls crypto provider and no provider is available".into(),
            );
        }
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("sidecar_injector=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    info!("Starting sidecar-injector");

    let config = InjectorConfig::from_env()?;
    info!(
        controller_namespace = %config.controller_namespace,
        bootstrap_cert_validity_secs = config.bootstrap_cert_validity.as_secs(),
        "Loaded injector configuration"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let ca = CertificateAuthority::load_or_generate(CA_CERT_PATH, CA_KEY_PATH)?;

    // Create shared health state
    let health_state = Arc::new(HealthState::new());

    // Start health server immediately so liveness works while TLS loads
    let health_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state).await {
                error!("Health server error: {}", e);
            }
        })
    };

    // Without serving certificates there is nothing to do; fail so the pod restarts
    if !(Path::new(WEBHOOK_CERT_PATH).exists() && Path::new(WEBHOOK_KEY_PATH).exists()) {
        return Err(format!(
            "TLS certificates not found at {} and {}",
            WEBHOOK_CERT_PATH, WEBHOOK_KEY_PATH
        )
        .into());
    }

    let injector = Arc::new(build_injector(
        client,
        config,
        ca,
        Some(health_state.clone()),
    ));

    let webhook_handle = {
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Err(e) = run_webhook_server(
                injector,
                WEBHOOK_CERT_PATH,
                WEBHOOK_KEY_PATH,
                Some(health_state),
            )
            .await
            {
                error!("Webhook server error: {}", e);
            }
        })
    };

    // Wait for any task to complete (or fail), or shutdown signal
    tokio::select! {
        result = webhook_handle => {
            if let Err(e) = result {
                error!("Webhook server task panicked: {}", e);
            }
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Mark as not ready so the API server stops routing admissions here
            health_state.set_ready(false).await;
            info!("Marked injector as not ready");

            info!(
                "Waiting {}s for in-flight admissions to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Injector stopped");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
