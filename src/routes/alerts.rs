use axum::{
    extract::{Path, State},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::alert::{list_configs, list_open_alerts, upsert_config, AlertConfigUpdate};
use crate::routes::error::ApiError;
use crate::state::AppState;

/// GET /alerts — currently open alerts.
pub async fn open_alerts(State(state): State<Arc<AppState>>) -> Response {
    match list_open_alerts(&state.pool).await {
        Ok(alerts) => Json(serde_json::json!({"alerts": alerts})).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// GET /alerts/configs
pub async fn configs(State(state): State<Arc<AppState>>) -> Response {
    match list_configs(&state.pool).await {
        Ok(configs) => Json(serde_json::json!({"configs": configs})).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// PUT /alerts/configs/:service — create or update one service's thresholds.
pub async fn put_config(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
    Json(update): Json<AlertConfigUpdate>,
) -> Response {
    let service = service.trim().to_string();
    if service.is_empty() || service.len() > 128 {
        return ApiError::validation("INVALID_SERVICE", "service must be 1-128 characters")
            .into_response();
    }
    if let Some(threshold) = update.error_threshold_per_min {
        if threshold < 0.0 {
            return ApiError::validation(
                "INVALID_THRESHOLD",
                "error_threshold_per_min must be non-negative",
            )
            .into_response();
        }
    }

    match upsert_config(&state.pool, &service, &update).await {
        Ok(config) => {
            tracing::info!("🔧 [Alerts] Config updated for '{}'", service);
            Json(config).into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
