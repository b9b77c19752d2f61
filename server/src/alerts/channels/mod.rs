//! Notification channels
//!
//! Each enabled channel gets one send per notified alert. Channels never
//! retry; the engine bounds each send with the configured timeout.

pub mod email;
pub mod slack;

use std::sync::Arc;

use async_trait::async_trait;

use super::types::Alert;
use crate::config::NotificationsConfig;
use crate::error::NotificationError;

pub use email::EmailChannel;
pub use slack::SlackChannel;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &'static str;

    async fn send(&self, alert: &Alert) -> Result<(), NotificationError>;
}

/// Build every enabled channel. Misconfiguration is reported, not skipped.
pub fn from_config(config: &NotificationsConfig) -> Result<Vec<Arc<dyn NotificationChannel>>, NotificationError> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();

    if config.email.enabled {
        channels.push(Arc::new(EmailChannel::new(&config.email, config.timeout())?));
    }
    if config.slack.enabled {
        channels.push(Arc::new(SlackChannel::new(&config.slack, config.timeout())?));
    }

    Ok(channels)
}

/// Marker shown in chat messages
pub fn severity_marker(severity: u8) -> &'static str {
    match severity {
        8.. => "🔴",
        5..=7 => "🟡",
        _ => "🟢",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EmailConfig, SlackConfig};

    #[test]
    fn test_severity_marker_bands() {
        assert_eq!(severity_marker(10), "🔴");
        assert_eq!(severity_marker(8), "🔴");
        assert_eq!(severity_marker(7), "🟡");
        assert_eq!(severity_marker(5), "🟡");
        assert_eq!(severity_marker(4), "🟢");
    }

    #[test]
    fn test_disabled_channels_are_not_built() {
        let channels = from_config(&NotificationsConfig::default()).unwrap();
        assert!(channels.is_empty());
    }

    #[tokio::test]
    async fn test_enabled_channels_in_order() {
        let config = NotificationsConfig {
            email: EmailConfig {
                enabled: true,
                username: "netguard@example.com".to_string(),
                recipients: vec!["soc@example.com".to_string()],
                ..EmailConfig::default()
            },
            slack: SlackConfig {
                enabled: true,
                webhook_url: "https://hooks.example.com/services/T000".to_string(),
            },
            ..NotificationsConfig::default()
        };

        let names: Vec<_> = from_config(&config).unwrap().iter().map(|c| c.name()).collect();
        assert_eq!(names, vec!["email", "slack"]);
    }

    #[test]
    fn test_enabled_slack_without_webhook_is_rejected() {
        let config = NotificationsConfig {
            slack: SlackConfig { enabled: true, webhook_url: String::new() },
            ..NotificationsConfig::default()
        };
        assert!(matches!(from_config(&config), Err(NotificationError::Config(_))));
    }
}
