use anyhow::Context;
use hub_core::state::MemoryStateTracker;
use hub_rs::config::load_config;
use hub_rs::hub::Hub;
use hub_rs::logging::init_logging;
use hub_rs::process::CommandSpawner;
use std::sync::Arc;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().context("invalid configuration")?;
    let log_guard = init_logging(&config);
    info!(
        event = "hub_config",
        name = %config.name,
        master = ?config.master,
        ui = ?config.ui,
        log_file = log_guard.as_ref().is_some_and(|guard| guard.has_file())
    );

    let spawner = Arc::new(CommandSpawner::new(config.launcher.as_deref()));
    let state = Arc::new(MemoryStateTracker::new());
    let hub = Hub::bind(config, state, spawner)
        .await
        .context("failed to bind hub ports")?;

    let signal_hub = hub.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_hub.shutdown().await;
        }
    });

    if let Err(err) = hub.run().await {
        error!(event = "hub_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}
