//! Bulk log persistence. One transaction per batch: either every entry and
//! its tags land, or none do. Auto-tagging runs inside the same transaction
//! so a row is never visible without its deterministic tag set.

use chrono::Utc;
use sqlx::SqlitePool;

use super::tagging::auto_tags;
use super::{NewLog, EXTERNAL_SERVICE};

/// Inserts a validated batch for one project. Entries are written in
/// submission order, which with the AUTOINCREMENT key yields monotonically
/// increasing ids. Returns the new row ids.
pub async fn insert_batch(
    pool: &SqlitePool,
    project_id: &str,
    rows: &[NewLog],
) -> Result<Vec<i64>, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let created_at = Utc::now();
    let mut ids = Vec::with_capacity(rows.len());

    for row in rows {
        let result = sqlx::query(
            "INSERT INTO logs (project_id, service, service_name, level, message, timestamp, created_at, metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(project_id)
        .bind(EXTERNAL_SERVICE)
        .bind(&row.service_name)
        .bind(&row.level)
        .bind(&row.message)
        .bind(row.timestamp)
        .bind(created_at)
        .bind(&row.metadata)
        .execute(&mut *tx)
        .await?;

        let log_id = result.last_insert_rowid();
        let tag_service = row.service_name.as_deref().unwrap_or(EXTERNAL_SERVICE);
        for tag in auto_tags(tag_service, &row.level, &row.message) {
            sqlx::query("INSERT OR IGNORE INTO log_tags (log_id, tag) VALUES (?, ?)")
                .bind(log_id)
                .bind(&tag)
                .execute(&mut *tx)
                .await?;
        }
        ids.push(log_id);
    }

    tx.commit().await?;
    Ok(ids)
}

/// Writes a single log entry produced by the platform itself (for example
/// the AI insight service reporting its own failures). Goes through the
/// same auto-tag path as ingested entries.
pub async fn insert_internal_log(
    pool: &SqlitePool,
    service: &str,
    level: &str,
    message: &str,
    metadata: serde_json::Value,
) -> Result<i64, sqlx::Error> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();

    let result = sqlx::query(
        "INSERT INTO logs (project_id, service, service_name, level, message, timestamp, created_at, metadata)
         VALUES (NULL, ?, NULL, ?, ?, ?, ?, ?)",
    )
    .bind(service)
    .bind(level)
    .bind(message)
    .bind(now)
    .bind(now)
    .bind(metadata.to_string())
    .execute(&mut *tx)
    .await?;

    let log_id = result.last_insert_rowid();
    for tag in auto_tags(service, level, message) {
        sqlx::query("INSERT OR IGNORE INTO log_tags (log_id, tag) VALUES (?, ?)")
            .bind(log_id)
            .bind(&tag)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(log_id)
}

/// Manual tag addition. Does not re-run the keyword rules.
/// Returns false when the log does not exist.
pub async fn add_tag(pool: &SqlitePool, log_id: i64, tag: &str) -> Result<bool, sqlx::Error> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM logs WHERE id = ?")
        .bind(log_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Ok(false);
    }
    sqlx::query("INSERT OR IGNORE INTO log_tags (log_id, tag) VALUES (?, ?)")
        .bind(log_id)
        .bind(tag.trim().to_lowercase())
        .execute(pool)
        .await?;
    Ok(true)
}

/// Manual tag removal. Returns false when the log does not exist.
pub async fn remove_tag(pool: &SqlitePool, log_id: i64, tag: &str) -> Result<bool, sqlx::Error> {
    let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM logs WHERE id = ?")
        .bind(log_id)
        .fetch_optional(pool)
        .await?;
    if exists.is_none() {
        return Ok(false);
    }
    sqlx::query("DELETE FROM log_tags WHERE log_id = ? AND tag = ?")
        .bind(log_id)
        .bind(tag.trim().to_lowercase())
        .execute(pool)
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipeline::{validate_batch, IngestEntry};

    fn entry(level: &str, message: &str) -> IngestEntry {
        IngestEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.to_string(),
            service_name: Some("api".to_string()),
            context: None,
        }
    }

    #[tokio::test]
    async fn batch_lands_in_order_with_tags() {
        let pool = test_pool().await;
        let rows = validate_batch(&[
            entry("INFO", "x"),
            entry("ERROR", "db refused"),
            entry("WARN", "y"),
        ])
        .unwrap();

        let ids = insert_batch(&pool, "p-1", &rows).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]), "ids are monotonic");

        let tags: Vec<(String,)> =
            sqlx::query_as("SELECT tag FROM log_tags WHERE log_id = ? ORDER BY tag")
                .bind(ids[1])
                .fetch_all(&pool)
                .await
                .unwrap();
        let tags: Vec<_> = tags.into_iter().map(|t| t.0).collect();
        assert!(tags.contains(&"database".to_string()), "keyword tag from message");
        assert!(tags.contains(&"error".to_string()));
        assert!(tags.contains(&"api".to_string()));
    }

    #[tokio::test]
    async fn identical_messages_get_identical_tag_sets() {
        let pool = test_pool().await;
        let rows = validate_batch(&[
            entry("ERROR", "postgres query failed on login"),
            entry("ERROR", "postgres query failed on login"),
        ])
        .unwrap();
        let ids = insert_batch(&pool, "p-1", &rows).await.unwrap();

        let fetch = |id: i64| {
            let pool = pool.clone();
            async move {
                let rows: Vec<(String,)> =
                    sqlx::query_as("SELECT tag FROM log_tags WHERE log_id = ? ORDER BY tag")
                        .bind(id)
                        .fetch_all(&pool)
                        .await
                        .unwrap();
                rows.into_iter().map(|t| t.0).collect::<Vec<_>>()
            }
        };
        assert_eq!(fetch(ids[0]).await, fetch(ids[1]).await);
    }

    #[tokio::test]
    async fn manual_tags_do_not_rerun_rules() {
        let pool = test_pool().await;
        let rows = validate_batch(&[entry("INFO", "plain message")]).unwrap();
        let ids = insert_batch(&pool, "p-1", &rows).await.unwrap();

        assert!(add_tag(&pool, ids[0], "Custom").await.unwrap());
        let tags: Vec<(String,)> = sqlx::query_as("SELECT tag FROM log_tags WHERE log_id = ?")
            .bind(ids[0])
            .fetch_all(&pool)
            .await
            .unwrap();
        assert!(tags.iter().any(|t| t.0 == "custom"), "stored lowercased");

        assert!(remove_tag(&pool, ids[0], "custom").await.unwrap());
        assert!(!add_tag(&pool, 999_999, "x").await.unwrap());
    }

    #[tokio::test]
    async fn internal_log_is_auto_tagged() {
        let pool = test_pool().await;
        let id = insert_internal_log(
            &pool,
            "ai-insights",
            "ERROR",
            "model call failed",
            serde_json::json!({"log_id": 7}),
        )
        .await
        .unwrap();

        let tags: Vec<(String,)> = sqlx::query_as("SELECT tag FROM log_tags WHERE log_id = ?")
            .bind(id)
            .fetch_all(&pool)
            .await
            .unwrap();
        let tags: Vec<_> = tags.into_iter().map(|t| t.0).collect();
        assert!(tags.contains(&"ai-insights".to_string()));
        assert!(tags.contains(&"ai".to_string()), "'model' keyword fires");
    }

    #[tokio::test]
    async fn deleting_a_log_cascades_to_tags() {
        let pool = test_pool().await;
        let rows = validate_batch(&[entry("ERROR", "docker build failed")]).unwrap();
        let ids = insert_batch(&pool, "p-1", &rows).await.unwrap();

        sqlx::query("DELETE FROM logs WHERE id = ?")
            .bind(ids[0])
            .execute(&pool)
            .await
            .unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM log_tags WHERE log_id = ?")
            .bind(ids[0])
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
