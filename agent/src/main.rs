//! NetGuard Agent - Main Entry Point
//!
//! Samples host resources and new network connections and streams them to the NetGuard server as
//! encrypted, length-prefixed frames.

mod logic;
pub mod constants;

use std::process::ExitCode;
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use logic::collector::{self, SystemMonitor};
use logic::connections::{self, ConnectionMonitor};
use logic::crypto::FrameSealer;
use logic::sender::Sender;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .init();

    log::info!("Starting {} v{}...", constants::APP_NAME, constants::APP_VERSION);

    let Some(key) = constants::get_encryption_key() else {
        log::error!("NETGUARD_ENCRYPTION_KEY is not set");
        return ExitCode::FAILURE;
    };
    let sealer = match FrameSealer::from_hex(&key) {
        Ok(sealer) => sealer,
        Err(e) => {
            log::error!("Invalid NETGUARD_ENCRYPTION_KEY: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let server_addr = constants::get_server_addr();
    let interval = Duration::from_secs(constants::get_sample_interval());
    let conn_interval = Duration::from_millis(constants::get_connection_interval_ms());
    let (tx, rx) = mpsc::channel(constants::get_queue_capacity());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = tokio::spawn(collector::run(SystemMonitor::new(), interval, tx.clone(), shutdown_rx.clone()));
    let watcher = tokio::spawn(connections::run(
        ConnectionMonitor::new(constants::MAX_OBSERVATIONS_PER_SAMPLE),
        conn_interval,
        tx,
        shutdown_rx.clone(),
    ));
    let sender = tokio::spawn(Sender::new(server_addr, sealer).run(rx, shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
    log::info!("Shutdown requested");
    shutdown_tx.send_replace(true);

    let sampled = producer.await.unwrap_or_default();
    let observed = watcher.await.unwrap_or_default();
    let sent = sender.await.unwrap_or_default();
    log::info!(
        "Agent stopped ({} samples, {} observations, {} frames sent)",
        sampled, observed, sent
    );

    ExitCode::SUCCESS
}
