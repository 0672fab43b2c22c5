//! Scheduled health refresh. Each tick derives a status snapshot per active
//! service from its recent error ratio and appends it to `health_checks`;
//! the alert engine's service-down check reads the streak.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};

/// How far back a snapshot looks.
const LOOKBACK_MINUTES: i64 = 15;
/// At or above this error ratio a service is unhealthy.
const UNHEALTHY_RATIO: f64 = 0.5;
/// At or above this ratio it is degraded.
const DEGRADED_RATIO: f64 = 0.1;

pub async fn refresh_service_health(pool: &SqlitePool) -> anyhow::Result<usize> {
    let cutoff = Utc::now() - ChronoDuration::minutes(LOOKBACK_MINUTES);
    let rows = sqlx::query(
        "SELECT COALESCE(NULLIF(service_name, ''), service) AS svc,
                COUNT(*) AS total,
                SUM(CASE WHEN level IN ('ERROR', 'CRITICAL') THEN 1 ELSE 0 END) AS errors
         FROM logs WHERE timestamp >= ?
         GROUP BY svc",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    let now = Utc::now();
    let refreshed = rows.len();
    for row in rows {
        let service: String = row.get("svc");
        let total: i64 = row.get("total");
        let errors: i64 = row.get("errors");
        let ratio = errors as f64 / total.max(1) as f64;

        let status = if ratio >= UNHEALTHY_RATIO {
            "unhealthy"
        } else if ratio >= DEGRADED_RATIO {
            "degraded"
        } else {
            "healthy"
        };
        let detail = format!("{errors} errors / {total} logs in {LOOKBACK_MINUTES}m");

        sqlx::query(
            "INSERT INTO health_checks (service, status, detail, checked_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&service)
        .bind(status)
        .bind(&detail)
        .bind(now)
        .execute(pool)
        .await?;
    }

    Ok(refreshed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipeline::persistence::insert_internal_log;

    async fn latest_status(pool: &SqlitePool, service: &str) -> String {
        let (status,): (String,) = sqlx::query_as(
            "SELECT status FROM health_checks WHERE service = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(service)
        .fetch_one(pool)
        .await
        .unwrap();
        status
    }

    #[tokio::test]
    async fn classifies_by_error_ratio() {
        let pool = test_pool().await;
        // api: 1 error in 10 → degraded
        for i in 0..10 {
            let level = if i == 0 { "ERROR" } else { "INFO" };
            insert_internal_log(&pool, "api", level, "x", serde_json::json!({})).await.unwrap();
        }
        // worker: all errors → unhealthy
        for _ in 0..4 {
            insert_internal_log(&pool, "worker", "ERROR", "x", serde_json::json!({})).await.unwrap();
        }
        // portal: quiet and clean → healthy
        insert_internal_log(&pool, "portal", "INFO", "x", serde_json::json!({})).await.unwrap();

        let refreshed = refresh_service_health(&pool).await.unwrap();
        assert_eq!(refreshed, 3);
        assert_eq!(latest_status(&pool, "api").await, "degraded");
        assert_eq!(latest_status(&pool, "worker").await, "unhealthy");
        assert_eq!(latest_status(&pool, "portal").await, "healthy");
    }

    #[tokio::test]
    async fn snapshots_accumulate_per_tick() {
        let pool = test_pool().await;
        insert_internal_log(&pool, "api", "INFO", "x", serde_json::json!({})).await.unwrap();

        refresh_service_health(&pool).await.unwrap();
        refresh_service_health(&pool).await.unwrap();
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM health_checks WHERE service = 'api'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 2, "each tick appends a snapshot");
    }
}
