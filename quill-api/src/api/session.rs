//! Session API Handler

use axum::{Json, extract::State};
use quill_core::domain::session::SessionStats;

use crate::api::AppState;
use crate::api::error::ApiResult;

/// GET /session
/// Provider request count and rate limit state shared by all dispatchers
pub async fn session_stats(State(state): State<AppState>) -> ApiResult<Json<SessionStats>> {
    let stats = state.guard.stats().await?;
    Ok(Json(stats))
}
