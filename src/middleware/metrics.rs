//! Request metrics recorder. Feeds the response-time alert check and the
//! dashboard percentiles. The insert is spawned so the response path never
//! waits on the database.

use axum::{body::Body, extract::State, http::Request, middleware::Next, response::Response};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;

use crate::state::AppState;

pub async fn record_request(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(req).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
    let status = response.status().as_u16() as i64;

    let pool = state.pool.clone();
    let service = state.service_name.clone();
    tokio::spawn(async move {
        let result = sqlx::query(
            "INSERT INTO request_metrics (service, path, status_code, duration_ms, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(service)
        .bind(path)
        .bind(status)
        .bind(duration_ms)
        .bind(Utc::now())
        .execute(&pool)
        .await;
        if let Err(e) = result {
            tracing::debug!("Request metric dropped: {}", e);
        }
    });

    response
}
