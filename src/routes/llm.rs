use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use std::sync::Arc;

use crate::edge::llm::{create_config, delete_config, list_configs, CreateLlmConfig, LlmConfigError};
use crate::middleware::auth::AuthUser;
use crate::routes::error::ApiError;
use crate::state::AppState;

/// GET /llm/configs — the caller's provider credentials, keys masked.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    match list_configs(&state.pool, &user.user_id).await {
        Ok(configs) => Json(serde_json::json!({"configs": configs})).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /llm/configs — stores a credential envelope-encrypted.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateLlmConfig>,
) -> Response {
    if body.model.trim().is_empty() {
        return ApiError::validation("MISSING_MODEL", "model must not be empty").into_response();
    }
    match create_config(&state.pool, state.envelope.as_ref(), &user.user_id, &body).await {
        Ok(config) => {
            tracing::info!(
                "🔐 [LLM] Credential stored for {} ({})",
                user.username,
                config.provider
            );
            (StatusCode::CREATED, Json(config)).into_response()
        }
        Err(LlmConfigError::InvalidProvider(p)) => {
            ApiError::validation("INVALID_PROVIDER", format!("unknown provider '{p}'"))
                .into_response()
        }
        Err(LlmConfigError::EncryptionDisabled) => ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ENCRYPTION_DISABLED",
            "credential storage requires DEVSMITH_MASTER_KEY",
        )
        .into_response(),
        Err(e) => {
            tracing::error!("❌ [LLM] Config create failed: {}", e);
            ApiError::internal("credential storage failed").into_response()
        }
    }
}

/// DELETE /llm/configs/:id
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(config_id): Path<String>,
) -> Response {
    match delete_config(&state.pool, &user.user_id, &config_id).await {
        Ok(true) => Json(serde_json::json!({"status": "deleted"})).into_response(),
        Ok(false) => {
            ApiError::not_found("CONFIG_NOT_FOUND", "no such credential config").into_response()
        }
        Err(e) => ApiError::from(e).into_response(),
    }
}
