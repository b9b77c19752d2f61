//! Alert history

use axum::{extract::{Query, State}, Json};
use serde::Deserialize;
use validator::Validate;

use crate::alerts::Alert;
use crate::{AppError, AppResult, AppState};

const DEFAULT_LIMIT: usize = 50;

#[derive(Debug, Deserialize, Validate)]
pub struct AlertQuery {
    #[validate(range(min = 1, max = 1000))]
    pub limit: Option<usize>,
}

/// Most recent alerts, newest first
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> AppResult<Json<Vec<Alert>>> {
    query.validate()
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    let alerts = state.alerts
        .history()
        .recent(query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(Json(alerts))
}
