//! prism idle detection agent.
//!
//! Reads its configuration from the environment (see [`AgentConfig::from_env`]),
//! then reports activity to the daemon until interrupted.

use std::sync::Arc;

use prism_agent::sampler::read_boot_id;
use prism_agent::{Agent, AgentConfig, HttpHeartbeatSink, ManifestUpdater, ProcSampler, SequenceStore};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,prism=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AgentConfig::from_env()?;
    tracing::info!(
        daemon_url = %config.daemon_url,
        resource_id = %config.resource_id,
        interval_secs = config.heartbeat_interval_seconds,
        state_dir = %config.state_dir.display(),
        updates = config.update_manifest_url.is_some(),
        "Agent configuration loaded"
    );

    let boot_id = read_boot_id(&config.proc_root).await?;
    let client = reqwest::Client::builder()
        .timeout(config.request_timeout())
        .build()?;
    let sink = HttpHeartbeatSink::with_client(client.clone(), &config.daemon_url);

    let mut agent = Agent::start(
        config.settings(),
        boot_id,
        Box::new(ProcSampler::new(&config.proc_root, &config.pts_dir)),
        Arc::new(sink),
        SequenceStore::new(&config.state_dir),
    )
    .await?;

    if let (Some(url), Some(key)) = (&config.update_manifest_url, &config.update_key) {
        let updater = ManifestUpdater::new(client, url.clone(), key, &config.state_dir)?;
        agent = agent.with_updater(Arc::new(updater));
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let handle = tokio::spawn(agent.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received");
    let _ = shutdown_tx.send(());
    handle.await?;
    Ok(())
}
