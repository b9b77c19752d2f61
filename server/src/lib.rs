//! NetGuard Server
//!
//! Ingests encrypted telemetry from remote agents, scores network
//! observations for anomalies and turns them into graded alerts.
//!
//! # Architecture
//!
//! ```text
//! agent ──frames──▶ session reader ──queue──▶ pipeline
//!                                               │ decode
//!                                               │ analyze ──▶ model snapshot (arc-swap)
//!                                               ▼
//!                                         alert engine ──▶ history / bus / channels
//!
//! HTTP (axum): /metrics  /health  /api/v1/agents  /api/v1/alerts
//! ```

pub mod alerts;
pub mod analyzer;
pub mod app;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod pipeline;
pub mod session;
pub mod telemetry;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

pub use error::{AppError, AppResult};

/// Shared state of the HTTP surface
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub metrics: metrics::Metrics,
    pub registry: Arc<session::SessionRegistry>,
    pub analyzer: Arc<analyzer::Analyzer>,
    pub alerts: Arc<alerts::AlertEngine>,
}

/// Metrics and read-only API routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::check))
        .route("/metrics", get(handlers::metrics::render))
        .route("/api/v1/agents", get(handlers::agents::list))
        .route("/api/v1/agents/:id", get(handlers::agents::get))
        .route("/api/v1/alerts", get(handlers::alerts::list))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
