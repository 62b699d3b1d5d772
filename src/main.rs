//! Ledger harness - deployment rehearsal
//!
//! Builds the configured deployment plan and deploys it to an in-process
//! emulator, logging every contract address.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use ledger_harness::config::{Network, Settings};
use ledger_harness::harness::Harness;
use ledger_harness::ledger::{Emulator, SERVICE_ADDRESS};
use ledger_harness::link::NewAccountKey;
use ledger_harness::metrics::MetricsServer;
use ledger_harness::signer::KeyringSigner;
use ledger_harness::types::KeyId;

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    info!("Starting ledger-harness v{}", env!("CARGO_PKG_VERSION"));

    let config_path = Settings::config_path();
    let settings = Settings::from_path(&config_path)?;
    info!(
        "Loaded configuration with {} contracts for {:?}",
        settings.deployment.contracts.len(),
        settings.ledger.network
    );

    if settings.service_account.key_index != 0 {
        anyhow::bail!("The emulator service account holds a single key at index 0");
    }

    // Service account key
    let keyring = Arc::new(KeyringSigner::new());
    let service_key = KeyId::new(SERVICE_ADDRESS, 0);
    let hash_algo = settings.service_account.hash_algorithm;
    match settings.service_account.private_key() {
        Ok(secret) => keyring
            .add_key_hex(service_key, &secret, hash_algo)
            .context("Invalid service account key")?,
        Err(e) if settings.ledger.network == Network::Emulator => {
            warn!("{:#}; using a generated key", e);
            keyring.add_key(service_key, KeyringSigner::generate_key(), hash_algo);
        }
        Err(e) => return Err(e),
    }
    let public_key = keyring
        .public_key(&service_key)
        .context("Service account key missing from keyring")?;

    let emulator = Emulator::new(
        settings.ledger.emulator_config(),
        NewAccountKey::ed25519(public_key, hash_algo),
    );
    info!("Emulator started with service account {}", service_key);

    // Metrics server
    let metrics_handle = if settings.metrics.enabled {
        let server = MetricsServer::new(settings.metrics.port);
        info!("Metrics: http://0.0.0.0:{}/metrics", settings.metrics.port);
        Some(tokio::spawn(async move {
            if let Err(e) = server.run(shutdown_signal()).await {
                error!("Metrics server error: {}", e);
            }
        }))
    } else {
        None
    };

    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));
    let plan = settings
        .deployment_plan(base_dir, SERVICE_ADDRESS)
        .context("Failed to build deployment plan")?;
    info!("Deployment order: {}", plan.names().join(", "));

    let harness = Harness::new(
        Arc::new(emulator),
        keyring,
        service_key,
        settings.harness.clone(),
    );

    let deployed = harness.deploy(&plan).await?;
    for contract in &deployed {
        info!(
            "{} at {} (transaction {})",
            contract.name, contract.address, contract.transaction_id
        );
    }

    if let Some(handle) = metrics_handle {
        info!("Serving metrics until shutdown");
        if let Err(e) = handle.await {
            error!("Metrics task failed: {}", e);
        }
    }

    info!("ledger-harness stopped");
    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ledger_harness=debug"));

    let json = std::env::var("HARNESS_LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(true))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
