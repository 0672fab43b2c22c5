//! Shared auth gate for every protected surface. Accepts the session cookie
//! (server-side look-up with sliding expiry) or a Bearer JWT for
//! service-to-service calls. Browsers bounce to the login flow; API callers
//! get a 401 envelope.

use axum::{
    body::Body,
    extract::State,
    http::{header, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;

use crate::edge::session::SESSION_COOKIE;
use crate::routes::error::ApiError;
use crate::state::AppState;

/// The authenticated identity, attached to the request for handlers.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
}

fn session_cookie(req: &Request<Body>) -> Option<String> {
    let raw = req.headers().get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

fn bearer_token(req: &Request<Body>) -> Option<String> {
    let raw = req.headers().get(header::AUTHORIZATION)?.to_str().ok()?;
    raw.strip_prefix("Bearer ").map(str::to_string)
}

fn wants_html(req: &Request<Body>) -> bool {
    req.headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|accept| accept.contains("text/html"))
        .unwrap_or(false)
}

pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    // Session cookie first: it is the authoritative "logged in".
    if let Some(token) = session_cookie(&req) {
        match state.sessions.validate(&token).await {
            Ok(Some(session)) => {
                req.extensions_mut().insert(AuthUser {
                    user_id: session.user_id,
                    username: session.github_username,
                });
                return next.run(req).await;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!("❌ [Edge] Session store unavailable: {}", e);
                return ApiError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SESSION_STORE_UNAVAILABLE",
                    "Could not validate the session",
                )
                .into_response();
            }
        }
    }

    // Stateless service-to-service path.
    if let Some(token) = bearer_token(&req) {
        if let Ok(claims) = state.jwt.validate(&token) {
            req.extensions_mut().insert(AuthUser {
                user_id: claims.sub,
                username: claims.username,
            });
            return next.run(req).await;
        }
        tracing::warn!("🚫 [Edge] Invalid bearer token presented");
    }

    state.record_security_violation(req.uri().path()).await;
    if wants_html(&req) {
        crate::routes::auth::found("/auth/login")
    } else {
        ApiError::unauthorized("Authentication required").into_response()
    }
}
