use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::edge::oauth::{consume_state, mint_state, upsert_user, OAuthError};
use crate::edge::session::{SESSION_COOKIE, SESSION_TTL_SECS};
use crate::routes::error::ApiError;
use crate::state::AppState;

/// Readable-by-JS cookie carrying the service JWT for API calls.
const JWT_COOKIE: &str = "devsmith_jwt";

/// Plain 302. The auth contract pins the status; axum's `Redirect` helpers
/// emit 303/307/308.
pub fn found(location: &str) -> Response {
    match location.parse() {
        Ok(value) => {
            let mut response = StatusCode::FOUND.into_response();
            response.headers_mut().insert(header::LOCATION, value);
            response
        }
        Err(_) => ApiError::internal("invalid redirect target").into_response(),
    }
}

fn oauth_unavailable() -> Response {
    ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "OAUTH_NOT_CONFIGURED",
        "GitHub OAuth is not configured on this deployment",
    )
    .into_response()
}

/// GET /auth/login — mints the single-use state and bounces to GitHub.
pub async fn login(State(state): State<Arc<AppState>>) -> Response {
    let Some(oauth) = &state.oauth else {
        return oauth_unavailable();
    };
    match mint_state(state.kv.as_ref()).await {
        Ok(token) => found(&oauth.authorize_url(&token)),
        Err(e) => {
            tracing::error!("❌ [Edge] Could not mint OAuth state: {}", e);
            ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "STATE_STORE_UNAVAILABLE",
                "Could not start the login flow",
            )
            .into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub code: String,
    pub state: String,
}

/// GET /auth/callback — validates the state exactly once, exchanges the
/// code, creates/updates the user, and mints session + JWT.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(oauth) = &state.oauth else {
        return oauth_unavailable();
    };

    if let Err(e) = consume_state(state.kv.as_ref(), &query.state).await {
        tracing::warn!("🚫 [Edge] OAuth state rejected: {}", e);
        return ApiError::new(
            StatusCode::UNAUTHORIZED,
            "OAUTH_STATE_INVALID",
            "The login state is invalid, expired, or already used",
        )
        .into_response();
    }

    // State is consumed: any failure past this point is terminal for this
    // flow and the user restarts from /auth/login.
    let gh_user = match oauth.exchange_code(&query.code).await {
        Ok(user) => user,
        Err(OAuthError::Upstream(detail)) => {
            tracing::error!("❌ [Edge] OAuth exchange failed: {}", detail);
            return ApiError::new(
                StatusCode::BAD_GATEWAY,
                "OAUTH_UPSTREAM",
                "The identity provider did not complete the login",
            )
            .into_response();
        }
        Err(e) => {
            tracing::error!("❌ [Edge] OAuth callback failed: {}", e);
            return ApiError::internal("login failed").into_response();
        }
    };

    let user_id = match upsert_user(&state.pool, &gh_user).await {
        Ok(id) => id,
        Err(e) => {
            tracing::error!("❌ [Edge] User upsert failed: {}", e);
            return ApiError::internal("login failed").into_response();
        }
    };

    let session_token = match state.sessions.create(&user_id, &gh_user.login).await {
        Ok(token) => token,
        Err(e) => {
            tracing::error!("❌ [Edge] Session create failed: {}", e);
            return ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "SESSION_STORE_UNAVAILABLE",
                "Could not create the session",
            )
            .into_response();
        }
    };

    let jwt = match state.jwt.issue(
        &user_id,
        gh_user.id,
        &gh_user.login,
        gh_user.email.as_deref(),
    ) {
        Ok(jwt) => jwt,
        Err(e) => {
            tracing::error!("❌ [Edge] JWT issue failed: {}", e);
            return ApiError::internal("login failed").into_response();
        }
    };

    tracing::info!("🔓 [Edge] User '{}' logged in", gh_user.login);
    let target = std::env::var("PORTAL_URL").unwrap_or_else(|_| "/".to_string());
    let mut response = found(&target);
    let headers = response.headers_mut();
    if let Ok(cookie) = format!(
        "{SESSION_COOKIE}={session_token}; HttpOnly; Path=/; Max-Age={SESSION_TTL_SECS}; SameSite=Lax"
    )
    .parse()
    {
        headers.append(header::SET_COOKIE, cookie);
    }
    if let Ok(cookie) =
        format!("{JWT_COOKIE}={jwt}; Path=/; Max-Age={SESSION_TTL_SECS}; SameSite=Lax").parse()
    {
        headers.append(header::SET_COOKIE, cookie);
    }
    response
}

/// POST /auth/logout — drops the server-side session and clears cookies.
pub async fn logout(State(state): State<Arc<AppState>>, headers: header::HeaderMap) -> Response {
    if let Some(token) = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| {
            raw.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == SESSION_COOKIE).then(|| value.to_string())
            })
        })
    {
        if let Err(e) = state.sessions.destroy(&token).await {
            tracing::warn!("⚠️ [Edge] Session destroy failed: {}", e);
        }
    }

    let mut response = Json(serde_json::json!({"status": "logged_out"})).into_response();
    let headers_mut = response.headers_mut();
    for name in [SESSION_COOKIE, JWT_COOKIE] {
        if let Ok(cookie) = format!("{name}=; Path=/; Max-Age=0; SameSite=Lax").parse() {
            headers_mut.append(header::SET_COOKIE, cookie);
        }
    }
    response
}
