use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub heartbeat: String,
}

/// Liveness probe for the front-door and the healthcheck CLI.
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "devsmith-logs".to_string(),
        heartbeat: chrono::Utc::now().to_rfc3339(),
    })
}
