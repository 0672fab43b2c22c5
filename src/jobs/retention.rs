//! TTL retention sweep. Deletes rows past the cutoff in bounded chunks so
//! one tick can never hold the database for longer than its wall-clock
//! budget. Log entries are swept only when `LOG_RETENTION_DAYS` opts in.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::SqlitePool;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    /// Analysis captures (and operational tables) older than this go.
    pub retention_days: i64,
    /// Raw log retention is an admin decision; None keeps logs forever.
    pub log_retention_days: Option<i64>,
    pub chunk_size: i64,
    pub tick_budget: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            retention_days: 14,
            log_retention_days: None,
            chunk_size: 500,
            tick_budget: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Default, PartialEq)]
pub struct SweepReport {
    pub insights_deleted: u64,
    pub logs_deleted: u64,
    pub health_rows_deleted: u64,
    pub metrics_deleted: u64,
}

async fn delete_chunked(
    pool: &SqlitePool,
    table: &str,
    time_column: &str,
    cutoff: chrono::DateTime<Utc>,
    chunk_size: i64,
    deadline: Instant,
) -> Result<u64, sqlx::Error> {
    let sql = format!(
        "DELETE FROM {table} WHERE id IN
         (SELECT id FROM {table} WHERE {time_column} < ? LIMIT ?)"
    );
    let mut total = 0u64;
    loop {
        let deleted = sqlx::query(&sql)
            .bind(cutoff)
            .bind(chunk_size)
            .execute(pool)
            .await?
            .rows_affected();
        total += deleted;
        if deleted < chunk_size as u64 {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!(
                "⚠️ [Retention] Budget exhausted sweeping {} ({} rows so far); resuming next tick",
                table,
                total
            );
            break;
        }
    }
    Ok(total)
}

/// One retention tick. Weakly decreases row counts; never touches a row
/// younger than its cutoff.
pub async fn sweep(
    pool: &SqlitePool,
    settings: &RetentionSettings,
) -> anyhow::Result<SweepReport> {
    let deadline = Instant::now() + settings.tick_budget;
    let cutoff = Utc::now() - ChronoDuration::days(settings.retention_days);
    let mut report = SweepReport::default();

    report.insights_deleted =
        delete_chunked(pool, "ai_insights", "generated_at", cutoff, settings.chunk_size, deadline)
            .await?;
    report.health_rows_deleted =
        delete_chunked(pool, "health_checks", "checked_at", cutoff, settings.chunk_size, deadline)
            .await?;
    report.metrics_deleted =
        delete_chunked(pool, "request_metrics", "recorded_at", cutoff, settings.chunk_size, deadline)
            .await?;

    if let Some(log_days) = settings.log_retention_days {
        let log_cutoff = Utc::now() - ChronoDuration::days(log_days);
        report.logs_deleted =
            delete_chunked(pool, "logs", "created_at", log_cutoff, settings.chunk_size, deadline)
                .await?;
    }

    if report != SweepReport::default() {
        tracing::info!(
            "🧹 [Retention] Swept {} insights, {} health rows, {} metrics, {} logs",
            report.insights_deleted,
            report.health_rows_deleted,
            report.metrics_deleted,
            report.logs_deleted
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipeline::persistence::insert_internal_log;

    async fn seed_insight(pool: &SqlitePool, log_id: i64, age_days: i64) {
        sqlx::query(
            "INSERT INTO ai_insights (id, log_id, analysis, suggestions, model_used, generated_at)
             VALUES (?, ?, 'a', '[]', 'm', ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(log_id)
        .bind(Utc::now() - ChronoDuration::days(age_days))
        .execute(pool)
        .await
        .unwrap();
    }

    async fn insight_count(pool: &SqlitePool) -> i64 {
        let (n,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM ai_insights")
            .fetch_one(pool)
            .await
            .unwrap();
        n
    }

    #[tokio::test]
    async fn sweeps_only_past_the_cutoff() {
        let pool = test_pool().await;
        let old_log = insert_internal_log(&pool, "api", "ERROR", "old", serde_json::json!({}))
            .await
            .unwrap();
        let new_log = insert_internal_log(&pool, "api", "ERROR", "new", serde_json::json!({}))
            .await
            .unwrap();
        seed_insight(&pool, old_log, 30).await;
        seed_insight(&pool, new_log, 1).await;

        let report = sweep(&pool, &RetentionSettings::default()).await.unwrap();
        assert_eq!(report.insights_deleted, 1);
        assert_eq!(insight_count(&pool).await, 1, "young row survives");

        // A second sweep is a no-op: row counts weakly decrease.
        let report = sweep(&pool, &RetentionSettings::default()).await.unwrap();
        assert_eq!(report.insights_deleted, 0);
        assert_eq!(insight_count(&pool).await, 1);
    }

    #[tokio::test]
    async fn chunked_delete_clears_everything_eventually() {
        let pool = test_pool().await;
        for i in 0..7 {
            let log_id =
                insert_internal_log(&pool, "api", "ERROR", &format!("m{i}"), serde_json::json!({}))
                    .await
                    .unwrap();
            seed_insight(&pool, log_id, 30).await;
        }

        let settings = RetentionSettings {
            chunk_size: 2,
            ..Default::default()
        };
        let report = sweep(&pool, &settings).await.unwrap();
        assert_eq!(report.insights_deleted, 7);
        assert_eq!(insight_count(&pool).await, 0);
    }

    #[tokio::test]
    async fn logs_survive_unless_opted_in() {
        let pool = test_pool().await;
        let log_id = insert_internal_log(&pool, "api", "INFO", "ancient", serde_json::json!({}))
            .await
            .unwrap();
        sqlx::query("UPDATE logs SET created_at = ? WHERE id = ?")
            .bind(Utc::now() - ChronoDuration::days(100))
            .bind(log_id)
            .execute(&pool)
            .await
            .unwrap();

        let report = sweep(&pool, &RetentionSettings::default()).await.unwrap();
        assert_eq!(report.logs_deleted, 0);

        let settings = RetentionSettings {
            log_retention_days: Some(30),
            ..Default::default()
        };
        let report = sweep(&pool, &settings).await.unwrap();
        assert_eq!(report.logs_deleted, 1);
    }
}
