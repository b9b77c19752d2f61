//! Alert records and notification bookkeeping

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Immutable alert as stored, published and notified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: u8,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub description: String,
    pub source: Value,
    pub data: Value,
}

impl Alert {
    /// Pretty JSON, used in logs and notification bodies
    pub fn to_pretty_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| format!("{:?}", self))
    }

    pub fn pretty_data(&self) -> String {
        serde_json::to_string_pretty(&self.data).unwrap_or_default()
    }
}

/// Input to `AlertEngine::raise`
///
/// The numeric fields feed the severity calculation. The whole context,
/// extras included, becomes the alert's `data`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertContext {
    #[serde(rename = "type")]
    pub alert_type: String,
    pub description: String,
    pub source: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suspicious_connections: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl AlertContext {
    pub fn new(alert_type: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            alert_type: alert_type.into(),
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.source.insert(key.to_string(), value.into());
        self
    }

    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }

    pub fn cpu_percent(mut self, value: f64) -> Self {
        self.cpu_percent = Some(value);
        self
    }

    pub fn memory_percent(mut self, value: f64) -> Self {
        self.memory_percent = Some(value);
        self
    }

    pub fn suspicious_connections(mut self, value: f64) -> Self {
        self.suspicious_connections = Some(value);
        self
    }
}

// ============================================================================
// DISPATCH
// ============================================================================

/// One alert bound for one channel
#[derive(Debug, Clone)]
pub struct NotificationTask {
    pub alert: Arc<Alert>,
    pub channel: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum ChannelOutcome {
    Delivered,
    Failed(String),
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelResult {
    pub channel: &'static str,
    pub outcome: ChannelOutcome,
}

/// Per-channel results of one dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub alert_id: Option<Uuid>,
    pub results: Vec<ChannelResult>,
}

impl DispatchReport {
    /// Dispatch skipped: severity below the notification threshold
    pub fn skipped(alert: &Alert) -> Self {
        Self {
            alert_id: Some(alert.id),
            results: Vec::new(),
        }
    }

    pub fn outcome(&self, channel: &str) -> Option<&ChannelOutcome> {
        self.results.iter()
            .find(|r| r.channel == channel)
            .map(|r| &r.outcome)
    }

    pub fn delivered(&self) -> usize {
        self.results.iter()
            .filter(|r| r.outcome == ChannelOutcome::Delivered)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}
