//! Wire records
//!
//! Host samples travel as `{"type": "system_stats", "data": {...}}`;
//! connection observations travel as a bare object.

use serde::ser::{Serialize, SerializeStruct, Serializer};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use super::collector::SystemStats;
use super::connections::NetworkObservation;

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    SystemStats(SystemStats),
    NetworkObservation(NetworkObservation),
}

impl Record {
    pub fn kind(&self) -> &'static str {
        match self {
            Record::SystemStats(_) => "system_stats",
            Record::NetworkObservation(_) => "network_observation",
        }
    }
}

impl Serialize for Record {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Record::SystemStats(stats) => {
                let mut record = serializer.serialize_struct("Record", 2)?;
                record.serialize_field("type", "system_stats")?;
                record.serialize_field("data", stats)?;
                record.end()
            }
            Record::NetworkObservation(observation) => observation.serialize(serializer),
        }
    }
}

/// Result of handing a record to the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    Dropped,
    Closed,
}

/// Queue without waiting; a full queue drops the record
pub fn offer(tx: &mpsc::Sender<Record>, record: Record) -> Offer {
    match tx.try_send(record) {
        Ok(()) => Offer::Queued,
        Err(TrySendError::Full(record)) => {
            log::warn!("Send queue full, dropping {} record", record.kind());
            Offer::Dropped
        }
        Err(TrySendError::Closed(_)) => Offer::Closed,
    }
}
