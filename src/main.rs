// Depth Relay - process bootstrap
// Config -> logging -> tasks -> serve until Ctrl-C

use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use depth_relay::core::{setup_logging, RelayConfig};
use depth_relay::layer1::{BinanceSnapshotClient, DiffStreamClient};
use depth_relay::layer2::SyncDriver;
use depth_relay::layer3::{router, run_heartbeat, serve, AppState, Publisher, SessionManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config_path = std::env::args().nth(1).or_else(|| std::env::var("RELAY_CONFIG").ok());
    let config = RelayConfig::load(config_path.as_deref())?;
    setup_logging(&config.monitoring.log_level, config.monitoring.json_logs);
    config.validate()?;

    info!(
        symbol = %config.upstream.symbol,
        stream = %config.stream_url(),
        snapshot = %config.snapshot_url(),
        "Starting depth relay"
    );

    let cancel = CancellationToken::new();

    let sessions = Arc::new(SessionManager::new(config.server.session_queue_capacity));
    let publisher = Arc::new(Publisher::new(config.server.depth_levels, sessions.clone()));
    let source = Arc::new(BinanceSnapshotClient::from_config(&config)?);

    let driver = SyncDriver::from_config(&config, source.clone(), publisher.clone(), cancel.clone());
    let events = driver.sender();
    let status = driver.status();

    // Failing to bind is fatal; nothing is connected upstream yet
    let listener = TcpListener::bind(&config.server.bind_address).await?;

    let driver_task = tokio::spawn(driver.run());

    let stream = Arc::new(DiffStreamClient::from_config(&config));
    let mut stream_task = {
        let stream = stream.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { stream.run(events, cancel).await })
    };

    let heartbeat_task = tokio::spawn(run_heartbeat(sessions.clone(), config.heartbeat_interval(), cancel.clone()));

    let app = router(
        AppState {
            publisher: publisher.clone(),
            status,
            cancel: cancel.clone(),
        },
        &config.server.ws_path,
    );
    let server_task = tokio::spawn(serve(listener, app, cancel.clone()));

    let stream_finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown requested");
            false
        }
        joined = &mut stream_task => {
            match joined {
                Ok(Err(e)) => error!(error = %e, "Diff stream stopped, shutting down"),
                Ok(Ok(())) => info!("Diff stream finished"),
                Err(e) => error!(error = %e, "Diff stream task panicked"),
            }
            true
        }
    };

    cancel.cancel();
    sessions.close_all();

    if !stream_finished {
        let _ = stream_task.await;
    }
    let _ = heartbeat_task.await;
    match server_task.await {
        Ok(Err(e)) => error!(error = %e, "Server error"),
        Err(e) => error!(error = %e, "Server task panicked"),
        Ok(Ok(())) => {}
    }
    if let Ok(status) = driver_task.await {
        info!(status = %status, stats = %status.stats, "Sync driver final state");
    }
    info!(
        stream = %stream.get_stats(),
        snapshots = %source.get_stats(),
        publisher = %publisher.get_stats(),
        sessions = %sessions.get_stats(),
        "Depth relay stopped"
    );

    Ok(())
}
