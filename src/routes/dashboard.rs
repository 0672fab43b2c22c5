use axum::{
    extract::{Query, State},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::query::aggregate::{self, TimeWindow, WindowQuery};
use crate::routes::error::ApiError;
use crate::state::AppState;

const DEFAULT_TOP_ERRORS: usize = 10;
const MAX_TOP_ERRORS: usize = 100;

fn window_of(q: &WindowQuery) -> TimeWindow {
    TimeWindow::parse(q.window.as_deref().or(q.time_range.as_deref()))
}

/// GET /dashboard — cached aggregate for one window.
pub async fn dashboard(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Response {
    let window = window_of(&q);
    let cache_key = format!("dashboard:{}", window.label());
    if let Some(cached) = state.dashboard_cache.get(&cache_key) {
        return Json(cached).into_response();
    }

    match aggregate::dashboard(&state.pool, window).await {
        Ok(payload) => match serde_json::to_value(&payload) {
            Ok(value) => {
                state.dashboard_cache.set(&cache_key, value.clone());
                Json(value).into_response()
            }
            Err(e) => {
                tracing::error!("❌ [Dashboard] Serialization failed: {}", e);
                ApiError::internal("dashboard serialization failed").into_response()
            }
        },
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /dashboard/service?service=&timeRange=
pub async fn service_dashboard(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Response {
    let Some(service) = q.service.as_deref().filter(|s| !s.is_empty()) else {
        return ApiError::validation("MISSING_SERVICE", "service query parameter is required")
            .into_response();
    };
    let window = window_of(&q);
    let cache_key = format!("service:{}:{}", service, window.label());
    if let Some(cached) = state.dashboard_cache.get(&cache_key) {
        return Json(cached).into_response();
    }

    match aggregate::service_rollup(&state.pool, service, window).await {
        Ok(payload) => {
            state.dashboard_cache.set(&cache_key, payload.clone());
            Json(payload).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /dashboard/top-errors?limit=&timeRange=
pub async fn top_errors(
    State(state): State<Arc<AppState>>,
    Query(q): Query<WindowQuery>,
) -> Response {
    let window = window_of(&q);
    let limit = q.limit.unwrap_or(DEFAULT_TOP_ERRORS).clamp(1, MAX_TOP_ERRORS);
    let cache_key = format!("top:{}:{}", limit, window.label());
    if let Some(cached) = state.dashboard_cache.get(&cache_key) {
        return Json(cached).into_response();
    }

    match aggregate::top_errors(&state.pool, window, limit).await {
        Ok(errors) => {
            let payload = serde_json::json!({
                "window": window.label(),
                "top_errors": errors,
                "generated_at": chrono::Utc::now(),
            });
            state.dashboard_cache.set(&cache_key, payload.clone());
            Json(payload).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /cache/invalidate — manual stale-cache escape hatch.
pub async fn invalidate_cache(State(state): State<Arc<AppState>>) -> Response {
    state.dashboard_cache.clear();
    tracing::info!("🧽 [Dashboard] Cache invalidated manually");
    Json(serde_json::json!({"status": "ok"})).into_response()
}
