//! Prism daemon - resource lifecycle and cost governance.
//!
//! Opens the store, reconciles every persisted resource against the provider,
//! then serves the HTTP API while the background loops run idle evaluation,
//! reconciliation, cost accrual and period rollover.
//!
//! # Dev Mode
//!
//! Build with `--features dev-mode` and leave `PROVIDER_URL` unset to run
//! against an in-memory mock provider.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prism_daemon::{create_router, DaemonConfig, DaemonState};
use prism_engine::{BackgroundTasks, EngineConfig, GovernanceEngine};
use prism_provider::{HttpProvider, Provider, ProviderConfig};
use prism_store::RocksStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prism=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Prism daemon");

    let config = DaemonConfig::from_env();
    let engine_config = EngineConfig::from_env();
    tracing::info!(
        listen_addr = %config.listen_addr,
        data_dir = %config.data_dir.display(),
        provider_url = ?config.provider_url,
        heartbeat_interval_secs = engine_config.heartbeat_interval_seconds,
        reconcile_interval_secs = engine_config.reconcile_interval_seconds,
        "Daemon configuration loaded"
    );

    tracing::info!(path = %config.data_dir.display(), "Opening RocksDB store");
    let store = Arc::new(RocksStore::open(&config.data_dir)?);

    #[cfg(feature = "dev-mode")]
    if config.provider_url.is_none() {
        tracing::warn!("DEV MODE ENABLED - using in-memory mock provider");
        let provider = Arc::new(prism_provider::MockProvider::new());
        return serve(store, provider, engine_config, config).await;
    }

    let mut provider_config = ProviderConfig::from_env();
    match &config.provider_url {
        Some(url) => provider_config.base_url.clone_from(url),
        None => tracing::warn!(
            base_url = %provider_config.base_url,
            "No PROVIDER_URL set - using the default provider adapter address"
        ),
    }
    let provider = Arc::new(HttpProvider::new(&provider_config)?);
    serve(store, provider, engine_config, config).await
}

async fn serve<P>(
    store: Arc<RocksStore>,
    provider: Arc<P>,
    engine_config: EngineConfig,
    config: DaemonConfig,
) -> Result<(), Box<dyn std::error::Error>>
where
    P: Provider + 'static,
{
    let engine = Arc::new(GovernanceEngine::new(store, provider, engine_config));
    let seeded = engine.seed_policies()?;
    if seeded > 0 {
        tracing::info!(seeded, "Seeded built-in idle policies");
    }

    // Every persisted resource is reconciled before idle timers are armed.
    let summary = engine.startup().await?;
    tracing::info!(
        checked = summary.checked,
        corrected = summary.corrected,
        failed = summary.failed,
        "Startup reconciliation complete"
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let tasks = BackgroundTasks::spawn(&engine, &shutdown_tx);

    let listen_addr = config.listen_addr.clone();
    let app = create_router(DaemonState::new(engine, config));

    tracing::info!(listen_addr = %listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(());
    tasks.join().await;
    tracing::info!("Daemon stopped");
    Ok(())
}
