//! Configuration module
//!
//! Loaded once at startup from an optional YAML file, then overridden by
//! environment variables (a `.env` file is honoured by `main`). The result is
//! validated and shared as an immutable `Arc<Config>`.

use std::env;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub server: ServerConfig,

    #[validate(nested)]
    pub analyzer: AnalyzerConfig,

    #[validate(nested)]
    pub thresholds: Thresholds,

    #[validate(nested)]
    pub notifications: NotificationsConfig,

    /// Broker endpoints for the downstream alert bridge
    pub kafka_servers: Vec<String>,

    /// PostgreSQL URL for alert history; in-memory history when unset
    pub database_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Agent listener host
    pub host: String,

    /// Agent listener port
    pub port: u16,

    /// Metrics / HTTP API host
    pub metrics_host: String,

    /// Metrics / HTTP API port
    pub metrics_port: u16,

    /// Pre-shared AES-256 key, 64 hex chars
    pub encryption_key: Option<String>,

    #[validate(range(min = 64, max = 16777216))]
    pub max_frame_bytes: usize,

    #[validate(range(min = 1))]
    pub queue_capacity: usize,

    pub queue_policy: QueuePolicy,

    pub shutdown_grace_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            metrics_host: "0.0.0.0".to_string(),
            metrics_port: 9090,
            encryption_key: None,
            max_frame_bytes: 1024 * 1024,
            queue_capacity: 1024,
            queue_policy: QueuePolicy::Block,
            shutdown_grace_secs: 5,
        }
    }
}

impl ServerConfig {
    pub fn agent_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.metrics_host, self.metrics_port)
            .parse()
            .map_err(|e| ConfigError::Address(format!("metrics listener: {}", e)))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// What the ingestion queue does when the processing side falls behind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePolicy {
    /// Suspend the session reader until there is room
    #[default]
    Block,
    /// Evict the oldest queued frame
    DropOldest,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Scores below this are anomalous
    pub anomaly_threshold: f64,

    /// Retrain every N buffered vectors
    #[validate(range(min = 1))]
    pub retrain_interval: usize,

    /// Never retrain on this many vectors or fewer
    pub min_training_samples: usize,

    #[validate(range(min = 1, max = 1000))]
    pub trees: usize,

    #[validate(range(min = 2))]
    pub sample_size: usize,

    pub seed: u64,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            anomaly_threshold: -0.5,
            retrain_interval: 1000,
            min_training_samples: 100,
            trees: 100,
            sample_size: 256,
            seed: 42,
        }
    }
}

/// Alert severity thresholds
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct Thresholds {
    #[validate(range(min = 0.0, max = 100.0))]
    pub cpu_percent: f64,

    #[validate(range(min = 0.0, max = 100.0))]
    pub memory_percent: f64,

    #[validate(range(min = 0.0))]
    pub suspicious_connections: f64,

    #[validate(range(max = 10))]
    pub notification_severity: u8,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_percent: 90.0,
            memory_percent: 85.0,
            suspicious_connections: 100.0,
            notification_severity: 7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NotificationsConfig {
    /// Per-channel send deadline
    #[validate(range(min = 1))]
    pub timeout_secs: u64,

    pub email: EmailConfig,

    pub slack: SlackConfig,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            email: EmailConfig::default(),
            slack: SlackConfig::default(),
        }
    }
}

impl NotificationsConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub enabled: bool,
    pub smtp_server: String,
    pub smtp_port: u16,
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub recipients: Vec<String>,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            smtp_server: "localhost".to_string(),
            smtp_port: 587,
            username: String::new(),
            password: String::new(),
            recipients: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SlackConfig {
    pub enabled: bool,
    #[serde(skip_serializing)]
    pub webhook_url: String,
}

impl Config {
    /// Load from an optional YAML file, apply environment overrides, validate
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Environment variables win over file values
    pub fn apply_env(&mut self) {
        if let Ok(host) = env::var("NETGUARD_HOST") {
            self.server.host = host;
        }
        if let Some(port) = env::var("NETGUARD_PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
        if let Some(port) = env::var("NETGUARD_METRICS_PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.metrics_port = port;
        }
        if let Ok(key) = env::var("NETGUARD_ENCRYPTION_KEY") {
            self.server.encryption_key = Some(key);
        }
        if let Ok(url) = env::var("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Ok(password) = env::var("NETGUARD_SMTP_PASSWORD") {
            self.notifications.email.password = password;
        }
        if let Ok(url) = env::var("NETGUARD_SLACK_WEBHOOK") {
            self.notifications.slack.webhook_url = url;
        }
    }

    /// Decode the pre-shared frame key
    pub fn encryption_key(&self) -> Result<[u8; 32], ConfigError> {
        let hex_key = self.server.encryption_key.as_deref()
            .ok_or_else(|| ConfigError::Key(
                "no key configured (set server.encryption_key or NETGUARD_ENCRYPTION_KEY)".to_string()
            ))?;
        crate::crypto::parse_key(hex_key).map_err(|e| ConfigError::Key(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_thresholds() {
        let config = Config::default();
        assert_eq!(config.thresholds.cpu_percent, 90.0);
        assert_eq!(config.thresholds.memory_percent, 85.0);
        assert_eq!(config.thresholds.suspicious_connections, 100.0);
        assert_eq!(config.thresholds.notification_severity, 7);
        assert_eq!(config.analyzer.retrain_interval, 1000);
        assert_eq!(config.server.queue_policy, QueuePolicy::Block);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            r#"
thresholds:
  cpu_percent: 75
notifications:
  slack:
    enabled: true
    webhook_url: "https://hooks.example.com/T000"
kafka_servers: ["broker-1:9092", "broker-2:9092"]
server:
  queue_policy: drop_oldest
"#,
        ).unwrap();

        assert_eq!(config.thresholds.cpu_percent, 75.0);
        assert_eq!(config.thresholds.memory_percent, 85.0);
        assert!(config.notifications.slack.enabled);
        assert!(!config.notifications.email.enabled);
        assert_eq!(config.kafka_servers.len(), 2);
        assert_eq!(config.server.queue_policy, QueuePolicy::DropOldest);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_rejects_out_of_range_thresholds() {
        let config = Config::from_yaml("thresholds:\n  notification_severity: 11\n").unwrap();
        assert!(config.validate().is_err());

        let config = Config::from_yaml("thresholds:\n  cpu_percent: 140\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_key_is_reported() {
        let config = Config::default();
        assert!(matches!(config.encryption_key(), Err(ConfigError::Key(_))));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("netguard.yaml");
        std::fs::write(&path, "server:\n  port: 7000\n  metrics_port: 7001\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.server.port, 7000);
        assert_eq!(config.server.metrics_port, 7001);
    }
}
