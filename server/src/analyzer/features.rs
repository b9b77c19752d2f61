//! Feature Vector - fixed-width model input
//!
//! One vector per network observation. The slot order is fixed by
//! [`FEATURE_LAYOUT`]; changing it invalidates every trained snapshot.

use chrono::Timelike;
use serde::Serialize;

use crate::telemetry::{parse_timestamp, NetworkObservation};

// ============================================================================
// LAYOUT
// ============================================================================

pub const FEATURE_COUNT: usize = 5;

pub const FEATURE_LAYOUT: [&str; FEATURE_COUNT] = [
    "size",
    "summary_len",
    "protocol_risk",
    "time_risk",
    "connection_frequency",
];

pub const SIZE: usize = 0;
pub const SUMMARY_LEN: usize = 1;
pub const PROTOCOL_RISK: usize = 2;
pub const TIME_RISK: usize = 3;
pub const CONNECTION_FREQUENCY: usize = 4;

// ============================================================================
// FEATURE VECTOR
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct FeatureVector {
    pub values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn from_values(values: [f64; FEATURE_COUNT]) -> Self {
        Self { values }
    }

    pub fn as_array(&self) -> &[f64; FEATURE_COUNT] {
        &self.values
    }

    pub fn protocol_risk(&self) -> f64 {
        self.values[PROTOCOL_RISK]
    }

    pub fn time_risk(&self) -> f64 {
        self.values[TIME_RISK]
    }

    pub fn connection_frequency(&self) -> f64 {
        self.values[CONNECTION_FREQUENCY]
    }

    /// Named values, for alert payloads and logs
    pub fn to_log_entry(&self) -> serde_json::Value {
        let named: serde_json::Map<String, serde_json::Value> = FEATURE_LAYOUT.iter()
            .zip(self.values.iter())
            .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
            .collect();
        serde_json::Value::Object(named)
    }
}

// ============================================================================
// EXTRACTORS
// ============================================================================

/// Fixed protocol risk table; unknown protocols are the riskiest
pub fn protocol_risk(protocol: &str) -> f64 {
    match protocol.to_ascii_lowercase().as_str() {
        "tcp" => 1.0,
        "udp" => 2.0,
        "icmp" => 3.0,
        _ => 5.0,
    }
}

/// Night-time activity (01:00-05:59) scores higher; unparseable scores highest
pub fn time_risk(timestamp: &str) -> f64 {
    match parse_timestamp(timestamp) {
        Some(dt) if (1..=5).contains(&dt.hour()) => 3.0,
        Some(_) => 1.0,
        None => 5.0,
    }
}

/// Build the vector; `frequency` comes from the connection table
pub fn extract(observation: &NetworkObservation, frequency: usize) -> FeatureVector {
    let mut values = [0.0; FEATURE_COUNT];
    values[SIZE] = observation.size as f64;
    values[SUMMARY_LEN] = observation.summary.chars().count() as f64;
    values[PROTOCOL_RISK] = protocol_risk(&observation.protocol);
    values[TIME_RISK] = time_risk(&observation.timestamp);
    values[CONNECTION_FREQUENCY] = frequency as f64;
    FeatureVector::from_values(values)
}
