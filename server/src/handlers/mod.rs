//! HTTP handlers

pub mod agents;
pub mod alerts;
pub mod health;
pub mod metrics;
