//! Alert Engine
//!
//! Computes severity, records every alert in history, publishes it on the
//! `alerts` topic and fans notifications out to the enabled channels. Storage
//! and notification are independent: a failing channel never un-records an
//! alert, and a failed append never stops notification.

pub mod bus;
pub mod channels;
pub mod history;
pub mod types;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::Thresholds;
use crate::error::{AlertError, NotificationError};
use crate::metrics::Metrics;

pub use bus::{BroadcastBus, EventBus, ALERTS_TOPIC};
pub use channels::NotificationChannel;
pub use history::{AlertStore, MemoryAlertHistory, PgAlertStore};
pub use types::{Alert, AlertContext, ChannelOutcome, ChannelResult, DispatchReport, NotificationTask};

pub const ANOMALY_TYPE: &str = "anomaly";
pub const RESOURCE_THRESHOLD_TYPE: &str = "resource_threshold";

const BASE_SEVERITY: i32 = 5;
const MAX_SEVERITY: i32 = 10;

/// Deterministic severity in `[0, 10]`
pub fn severity(context: &AlertContext, thresholds: &Thresholds) -> u8 {
    let mut severity = BASE_SEVERITY;

    if context.alert_type == ANOMALY_TYPE {
        severity += 2;
    }
    if context.cpu_percent.is_some_and(|v| v > thresholds.cpu_percent) {
        severity += 1;
    }
    if context.memory_percent.is_some_and(|v| v > thresholds.memory_percent) {
        severity += 1;
    }
    if context.suspicious_connections.is_some_and(|v| v > thresholds.suspicious_connections) {
        severity += 2;
    }

    severity.clamp(0, MAX_SEVERITY) as u8
}

pub struct AlertEngine {
    thresholds: Thresholds,
    history: Arc<dyn AlertStore>,
    bus: Arc<dyn EventBus>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    channel_timeout: Duration,
    metrics: Metrics,
}

impl AlertEngine {
    pub fn new(
        thresholds: Thresholds,
        history: Arc<dyn AlertStore>,
        bus: Arc<dyn EventBus>,
        channels: Vec<Arc<dyn NotificationChannel>>,
        channel_timeout: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            thresholds,
            history,
            bus,
            channels,
            channel_timeout,
            metrics,
        }
    }

    pub fn history(&self) -> &Arc<dyn AlertStore> {
        &self.history
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|c| c.name()).collect()
    }

    pub fn severity(&self, context: &AlertContext) -> u8 {
        severity(context, &self.thresholds)
    }

    /// Build, store and publish an alert.
    ///
    /// Both the history append and the publish are always attempted. If either
    /// fails the full alert is logged and returned inside the error.
    pub async fn raise(&self, context: AlertContext) -> Result<Arc<Alert>, AlertError> {
        let alert = Arc::new(self.build(context));

        let appended = self.history.append(&alert).await;
        let published = self.bus.publish(ALERTS_TOPIC, alert.clone()).await;
        self.metrics.alerts_generated.inc();

        let failure = match (appended, published) {
            (Ok(()), Ok(_)) => None,
            (Err(e), _) | (Ok(()), Err(e)) => Some(e),
        };

        match failure {
            None => {
                tracing::info!(
                    alert_id = %alert.id,
                    alert_type = %alert.alert_type,
                    severity = alert.severity,
                    "Alert raised: {}",
                    alert.description
                );
                Ok(alert)
            }
            Some(source) => {
                tracing::error!(
                    alert_id = %alert.id,
                    "Alert storage failed ({}); alert: {}",
                    source,
                    serde_json::to_string(alert.as_ref()).unwrap_or_default()
                );
                Err(AlertError { alert, source })
            }
        }
    }

    fn build(&self, context: AlertContext) -> Alert {
        let severity = self.severity(&context);
        let data = serde_json::to_value(&context).unwrap_or(Value::Null);

        Alert {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            severity,
            alert_type: context.alert_type,
            description: context.description,
            source: Value::Object(context.source),
            data,
        }
    }

    pub fn should_notify(&self, alert: &Alert) -> bool {
        alert.severity >= self.thresholds.notification_severity
    }

    /// One task per enabled channel, all concurrent, each bounded by the
    /// channel timeout. Results come back in channel order.
    pub async fn dispatch(&self, alert: Arc<Alert>) -> DispatchReport {
        if !self.should_notify(&alert) || self.channels.is_empty() {
            return DispatchReport::skipped(&alert);
        }

        let mut tasks = JoinSet::new();
        for (index, channel) in self.channels.iter().enumerate() {
            let task = NotificationTask {
                alert: alert.clone(),
                channel: channel.name(),
            };
            let channel = channel.clone();
            let timeout = self.channel_timeout;

            tasks.spawn(async move {
                let outcome = match tokio::time::timeout(timeout, channel.send(&task.alert)).await {
                    Ok(Ok(())) => ChannelOutcome::Delivered,
                    Ok(Err(e)) => {
                        tracing::error!(alert_id = %task.alert.id, channel = task.channel, "Notification failed: {}", e);
                        ChannelOutcome::Failed(e.to_string())
                    }
                    Err(_) => {
                        let e = NotificationError::Timeout(timeout);
                        tracing::error!(alert_id = %task.alert.id, channel = task.channel, "Notification failed: {}", e);
                        ChannelOutcome::TimedOut
                    }
                };
                (index, ChannelResult { channel: task.channel, outcome })
            });
        }

        let mut results = Vec::with_capacity(self.channels.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                Err(e) => tracing::error!(alert_id = %alert.id, "Notification task panicked: {}", e),
            }
        }
        results.sort_by_key(|(index, _)| *index);

        DispatchReport {
            alert_id: Some(alert.id),
            results: results.into_iter().map(|(_, r)| r).collect(),
        }
    }

    /// Raise then dispatch, notifying even when storage failed
    pub async fn process(&self, context: AlertContext) -> (Arc<Alert>, DispatchReport) {
        let alert = match self.raise(context).await {
            Ok(alert) => alert,
            Err(e) => e.alert,
        };
        let report = self.dispatch(alert.clone()).await;
        (alert, report)
    }
}
