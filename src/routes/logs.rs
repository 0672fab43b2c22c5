use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::pipeline::persistence::{add_tag, remove_tag};
use crate::query::{fetch_logs, get_stats, get_tags, LogFilter};
use crate::routes::error::ApiError;
use crate::state::AppState;

/// GET /logs — filtered tail with tags.
pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<LogFilter>,
) -> Response {
    match fetch_logs(&state.pool, &filter).await {
        Ok(logs) => Json(serde_json::json!({
            "count": logs.len(),
            "logs": logs,
        }))
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /stats — whole-table counts per level. Deliberately ignores every
/// filter parameter; see the stats invariance contract.
pub async fn stats(State(state): State<Arc<AppState>>) -> Response {
    match get_stats(&state.pool).await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /tags — distinct tags with counts.
pub async fn tags(State(state): State<Arc<AppState>>) -> Response {
    match get_tags(&state.pool).await {
        Ok(tags) => Json(tags).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TagBody {
    pub tag: String,
}

/// POST /logs/:id/tags
pub async fn add_log_tag(
    State(state): State<Arc<AppState>>,
    Path(log_id): Path<i64>,
    Json(body): Json<TagBody>,
) -> Response {
    let tag = body.tag.trim();
    if tag.is_empty() || tag.len() > 64 {
        return ApiError::validation("INVALID_TAG", "tag must be 1-64 characters")
            .into_response();
    }
    match add_tag(&state.pool, log_id, tag).await {
        Ok(true) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Ok(false) => {
            ApiError::not_found("LOG_NOT_FOUND", format!("no log entry with id {log_id}"))
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// DELETE /logs/:id/tags/:tag
pub async fn remove_log_tag(
    State(state): State<Arc<AppState>>,
    Path((log_id, tag)): Path<(i64, String)>,
) -> Response {
    match remove_tag(&state.pool, log_id, &tag).await {
        Ok(true) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Ok(false) => {
            ApiError::not_found("LOG_NOT_FOUND", format!("no log entry with id {log_id}"))
                .into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
