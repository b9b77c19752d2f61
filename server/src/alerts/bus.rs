//! Event bus for published alerts

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use super::types::Alert;
use crate::error::StorageError;

pub const ALERTS_TOPIC: &str = "alerts";

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish to `topic`, returning the number of subscribers reached
    async fn publish(&self, topic: &str, alert: Arc<Alert>) -> Result<usize, StorageError>;
}

/// In-process bus on a tokio broadcast channel
///
/// Downstream bridges (a broker forwarder, the alert log) subscribe with
/// [`BroadcastBus::subscribe`]. Publishing with nobody listening is not an
/// error; slow subscribers lag and lose the oldest messages.
pub struct BroadcastBus {
    sender: broadcast::Sender<Arc<Alert>>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Alert>> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, topic: &str, alert: Arc<Alert>) -> Result<usize, StorageError> {
        if topic != ALERTS_TOPIC {
            return Err(StorageError::Publish {
                topic: topic.to_string(),
                reason: "unknown topic".to_string(),
            });
        }
        // SendError only means there are no receivers right now
        Ok(self.sender.send(alert).unwrap_or(0))
    }
}
