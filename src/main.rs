use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod clock;
mod config;
mod feed;
mod manager;
mod persistence;
mod reconciler;
mod rollover;
mod routes;
mod scoreboard;
mod shutdown;
mod timetable_types;
mod train;

use config::Config;
use feed::DbTimetableClient;
use manager::{MonitorSettings, StationManager};
use persistence::{load_state, save_state};
use shutdown::ShutdownSignal;

const SAVE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    let shutdown_signal = ShutdownSignal::install()?;

    let default_level = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .init();
    info!(
        stations = config.stations.len(),
        destination = %config.end_station,
        "Loaded configuration"
    );

    // 1. Shared feed client and station registry
    let feed = Arc::new(DbTimetableClient::new(
        &config.base_url,
        &config.client_id,
        &config.api_key,
    )?);
    let manager = Arc::new(StationManager::new());

    // 2. Recover scoreboards from the last run
    let mut restored = match load_state(&config.data_dir) {
        Ok(state) => state.unwrap_or_default(),
        Err(e) => {
            warn!(error = %e, "Failed to load previous scoreboards");
            Default::default()
        }
    };
    manager.global().restore(std::mem::take(&mut restored.global));

    // 3. Start one monitor per configured station
    let settings = MonitorSettings::from(&config);
    for (position, eva) in config.stations.iter().enumerate() {
        let rankings = restored.stations.remove(eva);
        manager.monitor(eva.clone(), position, feed.clone(), &settings, rankings);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Daily rollover
    let rollover_task = tokio::spawn(rollover::run(manager.clone(), shutdown_rx.clone()));

    // 5. Persistence loop
    let persist_manager = manager.clone();
    let persist_dir = config.data_dir.clone();
    let mut persist_shutdown = shutdown_rx.clone();
    let persist_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(SAVE_INTERVAL) => {}
                _ = persist_shutdown.changed() => break,
            }
            if let Err(e) = save_state(&persist_manager, &persist_dir) {
                error!(error = %e, "Error saving scoreboards");
            }
        }
    });

    // 6. HTTP server
    let mut server_shutdown = shutdown_rx;
    let (addr, server) = warp::serve(routes::routes(manager.clone()))
        .try_bind_with_graceful_shutdown(([0, 0, 0, 0], config.port), async move {
            let _ = server_shutdown.changed().await;
        })?;
    let server_task = tokio::spawn(server);
    info!(%addr, "Server running");

    shutdown_signal.recv().await?;
    info!("Shutting down");
    shutdown_tx.send_replace(true);

    let _ = tokio::join!(rollover_task, persist_task, server_task);

    if let Err(e) = save_state(&manager, &config.data_dir) {
        error!(error = %e, "Error saving scoreboards on shutdown");
    }
    manager.shutdown().await;
    Ok(())
}
