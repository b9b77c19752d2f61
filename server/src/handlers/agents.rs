//! Active agent sessions

use axum::{extract::{Path, State}, Json};

use crate::session::SessionInfo;
use crate::{AppError, AppResult, AppState};

/// List active sessions, oldest first
pub async fn list(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<SessionInfo>> {
    let session = state.registry
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Session {} not found", id)))?;

    Ok(Json(session))
}
