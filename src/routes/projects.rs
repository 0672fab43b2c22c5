use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::sync::Arc;

use crate::middleware::auth::AuthUser;
use crate::pipeline::projects::{
    create_project, deactivate, list_projects, regenerate_key, ProjectError,
};
use crate::routes::error::ApiError;
use crate::state::AppState;

static SLUG_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]{0,63}$").unwrap());

#[derive(Debug, Deserialize)]
pub struct CreateProjectBody {
    pub name: String,
    pub slug: String,
}

/// GET /projects — the caller's projects.
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    match list_projects(&state.pool, &user.user_id).await {
        Ok(projects) => Json(serde_json::json!({"projects": projects})).into_response(),
        Err(e) => ApiError::from(e).into_response(),
    }
}

/// POST /projects — explicit tenant creation. The API key appears in this
/// response and nowhere else, ever.
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<CreateProjectBody>,
) -> Response {
    let slug = body.slug.trim();
    if !SLUG_PATTERN.is_match(slug) {
        return ApiError::validation(
            "INVALID_SLUG",
            "slug must be lowercase alphanumeric with dashes, max 64 chars",
        )
        .into_response();
    }
    let name = body.name.trim();
    if name.is_empty() {
        return ApiError::validation("INVALID_NAME", "name must not be empty").into_response();
    }

    match create_project(&state.pool, &user.user_id, slug, name).await {
        Ok((project, api_key)) => {
            tracing::info!("🆕 [Projects] '{}' created by {}", slug, user.username);
            (
                StatusCode::CREATED,
                Json(serde_json::json!({
                    "project": project,
                    "api_key": api_key,
                })),
            )
                .into_response()
        }
        Err(ProjectError::SlugTaken) => ApiError::new(
            StatusCode::CONFLICT,
            "SLUG_TAKEN",
            format!("an active project already uses slug '{slug}'"),
        )
        .into_response(),
        Err(e) => {
            tracing::error!("❌ [Projects] Create failed: {}", e);
            ApiError::internal("project creation failed").into_response()
        }
    }
}

async fn owned_project(
    state: &AppState,
    project_id: &str,
    user_id: &str,
) -> Result<bool, sqlx::Error> {
    let row: Option<(Option<String>,)> =
        sqlx::query_as("SELECT user_id FROM projects WHERE id = ?")
            .bind(project_id)
            .fetch_optional(&state.pool)
            .await?;
    Ok(matches!(row, Some((Some(owner),)) if owner == user_id))
}

/// POST /projects/:id/regenerate-key
pub async fn regenerate(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(project_id): Path<String>,
) -> Response {
    match owned_project(&state, &project_id, &user.user_id).await {
        Ok(false) => {
            return ApiError::not_found("PROJECT_NOT_FOUND", "no such project").into_response()
        }
        Err(e) => return ApiError::from(e).into_response(),
        Ok(true) => {}
    }
    match regenerate_key(&state.pool, &project_id).await {
        Ok(Some(api_key)) => Json(serde_json::json!({"api_key": api_key})).into_response(),
        Ok(None) => ApiError::not_found("PROJECT_NOT_FOUND", "no such project").into_response(),
        Err(e) => {
            tracing::error!("❌ [Projects] Key regeneration failed: {}", e);
            ApiError::internal("key regeneration failed").into_response()
        }
    }
}

/// DELETE /projects/:id — soft-deactivation; logs stay, ingestion stops.
pub async fn remove(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(project_id): Path<String>,
) -> Response {
    match owned_project(&state, &project_id, &user.user_id).await {
        Ok(false) => {
            return ApiError::not_found("PROJECT_NOT_FOUND", "no such project").into_response()
        }
        Err(e) => return ApiError::from(e).into_response(),
        Ok(true) => {}
    }
    match deactivate(&state.pool, &project_id).await {
        Ok(true) => Json(serde_json::json!({"status": "deactivated"})).into_response(),
        Ok(false) => {
            ApiError::not_found("PROJECT_NOT_FOUND", "project already deactivated").into_response()
        }
        Err(e) => {
            tracing::error!("❌ [Projects] Deactivation failed: {}", e);
            ApiError::internal("deactivation failed").into_response()
        }
    }
}
