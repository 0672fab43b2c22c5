use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::pipeline::{
    persistence::insert_batch,
    projects::{resolve_for_ingest, ProjectError},
    validate_batch, BatchReject, IngestBatch, IngestResponse,
};
use crate::routes::error::ApiError;
use crate::state::AppState;

/// Batches at or above this size make the cached dashboard stale enough to
/// warrant dropping it.
const CACHE_INVALIDATE_THRESHOLD: usize = 50;

/// The trust zone: callers on loopback or a private network are the
/// platform's own services (the front-door proxies everything external).
fn is_internal(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => {
            v6.is_loopback()
                // fc00::/7 unique-local
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || v6.to_ipv4_mapped().map(|v4| v4.is_loopback() || v4.is_private()).unwrap_or(false)
        }
    }
}

fn reject_to_error(rej: BatchReject) -> ApiError {
    ApiError::validation(rej.code, rej.message)
}

/// POST /ingest — authenticated by network position (see the trust-zone
/// note) and project state. All-or-nothing per batch.
pub async fn ingest(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(batch): Json<IngestBatch>,
) -> Response {
    let slug = batch.project_slug.trim();
    if slug.is_empty() {
        return ApiError::validation("INVALID_PROJECT_SLUG", "project_slug must not be empty")
            .into_response();
    }

    let rows = match validate_batch(&batch.logs) {
        Ok(rows) => rows,
        Err(rej) => return reject_to_error(rej).into_response(),
    };

    let project_id = match resolve_for_ingest(&state.pool, slug, is_internal(addr.ip())).await {
        Ok(id) => id,
        Err(ProjectError::NotFound) => {
            return ApiError::not_found(
                "PROJECT_NOT_FOUND",
                format!("no project with slug '{slug}'"),
            )
            .into_response()
        }
        Err(ProjectError::Inactive) => {
            return ApiError::new(
                StatusCode::FORBIDDEN,
                "PROJECT_INACTIVE",
                format!("project '{slug}' is deactivated; ingestion denied"),
            )
            .into_response()
        }
        Err(e) => {
            tracing::error!("❌ [Ingest] Project resolution failed: {}", e);
            return ApiError::internal("project resolution failed").into_response();
        }
    };

    let accepted = rows.len();
    if let Err(e) = insert_batch(&state.pool, &project_id, &rows).await {
        tracing::error!("❌ [Ingest] Bulk insert failed for '{}': {}", slug, e);
        return ApiError::internal("batch insert failed; safe to retry").into_response();
    }

    if accepted >= CACHE_INVALIDATE_THRESHOLD {
        state.dashboard_cache.clear();
    }

    tracing::debug!("📥 [Ingest] Accepted {} entries for '{}'", accepted, slug);
    (
        StatusCode::CREATED,
        Json(IngestResponse {
            accepted,
            message: format!("accepted {accepted} log entries"),
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trust_zone_membership() {
        assert!(is_internal("127.0.0.1".parse().unwrap()));
        assert!(is_internal("10.1.2.3".parse().unwrap()));
        assert!(is_internal("172.20.0.5".parse().unwrap()));
        assert!(is_internal("192.168.1.10".parse().unwrap()));
        assert!(is_internal("::1".parse().unwrap()));
        assert!(!is_internal("8.8.8.8".parse().unwrap()));
        assert!(!is_internal("2001:4860:4860::8888".parse().unwrap()));
    }
}
