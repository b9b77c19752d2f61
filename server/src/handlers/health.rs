//! Health check handler

use axum::{extract::State, Json};
use serde::Serialize;

use crate::analyzer::SnapshotInfo;
use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    timestamp: i64,
    active_agents: usize,
    training_samples: usize,
    model: Option<SnapshotInfo>,
}

pub async fn check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: chrono::Utc::now().timestamp(),
        active_agents: state.registry.len(),
        training_samples: state.analyzer.training_len(),
        model: state.analyzer.snapshot().map(|s| s.info()),
    })
}
