use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::insight::InsightError;
use crate::middleware::auth::AuthUser;
use crate::routes::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateBody {
    pub model: String,
}

fn insight_error_response(err: InsightError) -> Response {
    let status = match &err {
        InsightError::LogNotFound => StatusCode::NOT_FOUND,
        InsightError::UpstreamUnavailable | InsightError::Timeout | InsightError::Provider(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        InsightError::ParseFailed(_)
        | InsightError::EncryptionDisabled
        | InsightError::CredentialDecrypt
        | InsightError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    ApiError::new(status, err.code(), err.to_string()).into_response()
}

/// POST /logs/:id/insights — generate (or regenerate) the analysis.
pub async fn generate_insight(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(log_id): Path<i64>,
    Json(body): Json<GenerateBody>,
) -> Response {
    let model = body.model.trim();
    if model.is_empty() {
        return ApiError::validation("MISSING_MODEL", "model must not be empty").into_response();
    }

    match state.insights.generate(&user.user_id, log_id, model).await {
        Ok(insight) => Json(insight).into_response(),
        Err(e) => insight_error_response(e),
    }
}

/// GET /logs/:id/insights — the cached insight, if any.
pub async fn get_insight(
    State(state): State<Arc<AppState>>,
    Path(log_id): Path<i64>,
) -> Response {
    match state.insights.get(log_id).await {
        Ok(Some(insight)) => Json(insight).into_response(),
        Ok(None) => ApiError::not_found(
            "INSIGHT_NOT_FOUND",
            format!("no insight generated for log {log_id}"),
        )
        .into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}
