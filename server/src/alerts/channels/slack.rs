//! Slack-compatible webhook channel

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{severity_marker, NotificationChannel};
use crate::alerts::types::Alert;
use crate::config::SlackConfig;
use crate::error::NotificationError;

pub struct SlackChannel {
    client: reqwest::Client,
    webhook_url: String,
}

impl SlackChannel {
    pub fn new(config: &SlackConfig, timeout: Duration) -> Result<Self, NotificationError> {
        if config.webhook_url.trim().is_empty() {
            return Err(NotificationError::Config("slack enabled without webhook_url".to_string()));
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            webhook_url: config.webhook_url.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for SlackChannel {
    fn name(&self) -> &'static str {
        "slack"
    }

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError> {
        let response = self.client
            .post(&self.webhook_url)
            .json(&json!({ "text": message(alert) }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::Status { status: status.as_u16(), body });
        }
        Ok(())
    }
}

pub fn message(alert: &Alert) -> String {
    format!(
        "{} *NetGuard Alert*\n*Type:* {}\n*Severity:* {}/10\n*Time:* {}\n*Description:* {}\n```\n{}\n```",
        severity_marker(alert.severity),
        alert.alert_type,
        alert.severity,
        alert.timestamp.to_rfc3339(),
        alert.description,
        alert.pretty_data(),
    )
}
