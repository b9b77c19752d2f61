//! Telemetry Decoder
//!
//! Turns a decrypted agent payload into a typed [`TelemetryEvent`].
//! Decoding is pure: no logging, no shared state.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DecodeError;

// ============================================================================
// EVENTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    SystemStat(SystemStat),
    NetworkObservation(NetworkObservation),
}

/// Host resource sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStat {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub net_io: BTreeMap<String, f64>,
    pub timestamp: String,
    pub hostname: Option<String>,
}

/// One observed packet / connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkObservation {
    pub src_ip: String,
    pub dst_ip: String,
    pub protocol: String,
    pub size: u64,
    pub summary: String,
    pub timestamp: String,
}

impl TelemetryEvent {
    pub fn timestamp(&self) -> &str {
        match self {
            TelemetryEvent::SystemStat(s) => &s.timestamp,
            TelemetryEvent::NetworkObservation(o) => &o.timestamp,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::SystemStat(_) => "system_stats",
            TelemetryEvent::NetworkObservation(_) => "network_observation",
        }
    }
}

// ============================================================================
// WIRE FORMAT
// ============================================================================

#[derive(Deserialize)]
struct SystemStatsWire {
    cpu_percent: f64,
    memory_percent: f64,
    disk_usage: f64,
    #[serde(default)]
    network_io: BTreeMap<String, f64>,
    timestamp: String,
    #[serde(default)]
    hostname: Option<String>,
}

#[derive(Deserialize)]
struct ObservationWire {
    timestamp: String,
    #[serde(default)]
    packet_summary: String,
    protocol: String,
    size: u64,
    #[serde(default)]
    src_ip: String,
    #[serde(default)]
    dst_ip: String,
}

const SYSTEM_STATS_TYPE: &str = "system_stats";

/// Decode one plaintext frame
pub fn decode(payload: &[u8]) -> Result<TelemetryEvent, DecodeError> {
    let value: Value = serde_json::from_slice(payload)
        .map_err(|e| DecodeError::MalformedPayload(format!("not a JSON record: {}", e)))?;

    let event = match value.get("type").and_then(Value::as_str) {
        Some(SYSTEM_STATS_TYPE) => {
            let data = value.get("data").cloned()
                .ok_or_else(|| malformed("system_stats record without 'data'"))?;
            let wire: SystemStatsWire = serde_json::from_value(data)
                .map_err(|e| malformed(&e.to_string()))?;

            TelemetryEvent::SystemStat(SystemStat {
                cpu_percent: wire.cpu_percent,
                memory_percent: wire.memory_percent,
                disk_percent: wire.disk_usage,
                net_io: wire.network_io,
                timestamp: wire.timestamp,
                hostname: wire.hostname,
            })
        }
        Some(other) => return Err(malformed(&format!("unknown record type '{}'", other))),
        None => {
            let wire: ObservationWire = serde_json::from_value(value)
                .map_err(|e| malformed(&e.to_string()))?;

            TelemetryEvent::NetworkObservation(NetworkObservation {
                src_ip: wire.src_ip,
                dst_ip: wire.dst_ip,
                protocol: wire.protocol,
                size: wire.size,
                summary: wire.packet_summary,
                timestamp: wire.timestamp,
            })
        }
    };

    if parse_timestamp(event.timestamp()).is_none() {
        return Err(malformed(&format!("unparseable timestamp '{}'", event.timestamp())));
    }

    Ok(event)
}

fn malformed(reason: &str) -> DecodeError {
    DecodeError::MalformedPayload(reason.to_string())
}

/// Wall-clock time of an ISO-8601 / RFC 3339 timestamp, in its own offset
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}
