//! Service assembly
//!
//! Builds the shared context objects from an immutable [`Config`] and runs
//! the background maintenance tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::alerts::{channels, AlertEngine, AlertStore, BroadcastBus, MemoryAlertHistory, PgAlertStore};
use crate::analyzer::Analyzer;
use crate::config::Config;
use crate::crypto::FrameCipher;
use crate::metrics::Metrics;
use crate::pipeline::Pipeline;
use crate::session::{SessionContext, SessionRegistry};
use crate::AppState;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const BUS_CAPACITY: usize = 1024;

pub struct Services {
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub registry: Arc<SessionRegistry>,
    pub analyzer: Arc<Analyzer>,
    pub alerts: Arc<AlertEngine>,
    pub bus: Arc<BroadcastBus>,
    pub pipeline: Arc<Pipeline>,
    pub cipher: FrameCipher,
}

impl Services {
    /// Wire everything up. Fails on a missing key, a bad channel setup or an
    /// unreachable database.
    pub async fn build(config: Config) -> anyhow::Result<Self> {
        let config = Arc::new(config);
        let key = config.encryption_key()?;
        let cipher = FrameCipher::new(&key);
        let metrics = Metrics::new();

        let history: Arc<dyn AlertStore> = match &config.database_url {
            Some(url) => {
                tracing::info!("Alert history: PostgreSQL at {}", url.split('@').last().unwrap_or("***"));
                Arc::new(PgAlertStore::connect(url).await.context("Failed to connect alert history database")?)
            }
            None => {
                tracing::info!("Alert history: in-memory");
                Arc::new(MemoryAlertHistory::new())
            }
        };

        let bus = Arc::new(BroadcastBus::new(BUS_CAPACITY));
        if config.kafka_servers.is_empty() {
            tracing::info!("No broker configured; alerts stay on the in-process bus");
        } else {
            tracing::info!(brokers = ?config.kafka_servers, "Alert topic 'alerts' available for broker bridge");
        }

        let notification_channels = channels::from_config(&config.notifications)
            .context("Invalid notification channel configuration")?;

        let alerts = Arc::new(AlertEngine::new(
            config.thresholds.clone(),
            history,
            bus.clone(),
            notification_channels,
            config.notifications.timeout(),
            metrics.clone(),
        ));
        tracing::info!(channels = ?alerts.channel_names(), "Alert engine ready");

        let analyzer = Arc::new(Analyzer::new(config.analyzer.clone()));
        let pipeline = Arc::new(Pipeline::new(
            analyzer.clone(),
            alerts.clone(),
            config.thresholds.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            registry: Arc::new(SessionRegistry::new(metrics.clone())),
            config,
            metrics,
            analyzer,
            alerts,
            bus,
            pipeline,
            cipher,
        })
    }

    pub fn session_context(&self) -> Arc<SessionContext> {
        Arc::new(SessionContext {
            cipher: self.cipher.clone(),
            registry: self.registry.clone(),
            pipeline: self.pipeline.clone(),
            max_frame_bytes: self.config.server.max_frame_bytes,
            queue_capacity: self.config.server.queue_capacity,
            queue_policy: self.config.server.queue_policy,
        })
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            registry: self.registry.clone(),
            analyzer: self.analyzer.clone(),
            alerts: self.alerts.clone(),
        }
    }
}

/// Periodically drop idle connection-frequency keys
pub fn spawn_sweeper(
    analyzer: Arc<Analyzer>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // First tick fires immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => {
                    let removed = analyzer.sweep();
                    if removed > 0 {
                        tracing::debug!(
                            removed,
                            tracked = analyzer.tracked_connections(),
                            "Swept idle connection keys"
                        );
                    }
                }
            }
        }
    })
}

/// Log every published alert at debug level
pub fn spawn_alert_log(bus: &BroadcastBus, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
    let mut alerts = bus.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                received = alerts.recv() => match received {
                    Ok(alert) => tracing::debug!(
                        topic = crate::alerts::ALERTS_TOPIC,
                        alert = %serde_json::to_string(alert.as_ref()).unwrap_or_default(),
                        "Alert published"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Alert log lagging behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    })
}
