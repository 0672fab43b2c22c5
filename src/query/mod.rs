//! Read side: filtered log queries, whole-table stats, and the tag index.

pub mod aggregate;
pub mod cache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;

pub const DEFAULT_LIMIT: i64 = 1000;
pub const MAX_LIMIT: i64 = 5000;

#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub id: i64,
    pub project_id: Option<String>,
    pub service: String,
    pub service_name: Option<String>,
    pub level: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
    pub user_id: Option<String>,
}

/// Query-string filters for `GET /logs`.
#[derive(Debug, Default, Deserialize)]
pub struct LogFilter {
    pub level: Option<String>,
    pub service: Option<String>,
    pub tag: Option<String>,
    pub search: Option<String>,
    pub project: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Filtered tail over the log table, newest first. Tags come from a second
/// query over the junction table rather than a row-multiplying join.
pub async fn fetch_logs(pool: &SqlitePool, filter: &LogFilter) -> Result<Vec<LogRecord>, sqlx::Error> {
    let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
    let offset = filter.offset.unwrap_or(0).max(0);

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, project_id, service, service_name, level, message, timestamp, created_at, metadata, user_id
         FROM logs WHERE 1=1",
    );
    if let Some(level) = filter.level.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND level = ").push_bind(level.to_uppercase());
    }
    if let Some(service) = filter.service.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND (service = ")
            .push_bind(service.to_string())
            .push(" OR service_name = ")
            .push_bind(service.to_string())
            .push(")");
    }
    if let Some(tag) = filter.tag.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND EXISTS (SELECT 1 FROM log_tags WHERE log_tags.log_id = logs.id AND log_tags.tag = ")
            .push_bind(tag.to_lowercase())
            .push(")");
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND message LIKE ")
            .push_bind(format!("%{}%", search));
    }
    if let Some(project) = filter.project.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND project_id IN (SELECT id FROM projects WHERE slug = ")
            .push_bind(project.to_string())
            .push(")");
    }
    qb.push(" ORDER BY id DESC LIMIT ")
        .push_bind(limit)
        .push(" OFFSET ")
        .push_bind(offset);

    let rows = qb.build().fetch_all(pool).await?;
    let mut records: Vec<LogRecord> = rows
        .into_iter()
        .map(|row| LogRecord {
            id: row.get("id"),
            project_id: row.get("project_id"),
            service: row.get("service"),
            service_name: row.get("service_name"),
            level: row.get("level"),
            message: row.get("message"),
            timestamp: row.get("timestamp"),
            created_at: row.get("created_at"),
            metadata: serde_json::from_str(&row.get::<String, _>("metadata"))
                .unwrap_or_else(|_| serde_json::json!({})),
            tags: Vec::new(),
            user_id: row.get("user_id"),
        })
        .collect();

    if !records.is_empty() {
        let mut tag_qb: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT log_id, tag FROM log_tags WHERE log_id IN (");
        let mut separated = tag_qb.separated(", ");
        for record in &records {
            separated.push_bind(record.id);
        }
        tag_qb.push(") ORDER BY tag");

        let mut by_log: HashMap<i64, Vec<String>> = HashMap::new();
        for row in tag_qb.build().fetch_all(pool).await? {
            by_log
                .entry(row.get("log_id"))
                .or_default()
                .push(row.get("tag"));
        }
        for record in &mut records {
            if let Some(tags) = by_log.remove(&record.id) {
                record.tags = tags;
            }
        }
    }

    Ok(records)
}

/// Whole-table counts per level. Contractually independent of any filter
/// state: the dashboard's filter UI must never change this response.
#[derive(Debug, Default, PartialEq, Serialize)]
pub struct StatsResponse {
    pub debug: i64,
    pub info: i64,
    pub warning: i64,
    pub error: i64,
    pub critical: i64,
}

pub async fn get_stats(pool: &SqlitePool) -> Result<StatsResponse, sqlx::Error> {
    let rows = sqlx::query("SELECT level, COUNT(*) AS count FROM logs GROUP BY level")
        .fetch_all(pool)
        .await?;

    let mut stats = StatsResponse::default();
    for row in rows {
        let level: String = row.get("level");
        let count: i64 = row.get("count");
        match level.as_str() {
            "DEBUG" => stats.debug = count,
            "INFO" => stats.info = count,
            "WARN" => stats.warning = count,
            "ERROR" => stats.error = count,
            "CRITICAL" => stats.critical = count,
            _ => {}
        }
    }
    Ok(stats)
}

#[derive(Debug, Serialize)]
pub struct TagsResponse {
    pub tags: Vec<String>,
    pub counts: HashMap<String, i64>,
}

/// Distinct tags with usage counts, most used first.
pub async fn get_tags(pool: &SqlitePool) -> Result<TagsResponse, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT tag, COUNT(*) AS count FROM log_tags GROUP BY tag ORDER BY count DESC, tag ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut tags = Vec::with_capacity(rows.len());
    let mut counts = HashMap::with_capacity(rows.len());
    for row in rows {
        let tag: String = row.get("tag");
        counts.insert(tag.clone(), row.get::<i64, _>("count"));
        tags.push(tag);
    }
    Ok(TagsResponse { tags, counts })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipeline::persistence::insert_batch;
    use crate::pipeline::{validate_batch, IngestEntry};

    async fn seed(pool: &SqlitePool) {
        let entries = vec![
            IngestEntry {
                timestamp: Utc::now().to_rfc3339(),
                level: "INFO".into(),
                message: "x".into(),
                service_name: Some("api".into()),
                context: None,
            },
            IngestEntry {
                timestamp: Utc::now().to_rfc3339(),
                level: "ERROR".into(),
                message: "db refused".into(),
                service_name: Some("api".into()),
                context: None,
            },
            IngestEntry {
                timestamp: Utc::now().to_rfc3339(),
                level: "WARN".into(),
                message: "y".into(),
                service_name: Some("worker".into()),
                context: None,
            },
        ];
        let rows = validate_batch(&entries).unwrap();
        insert_batch(pool, "p-1", &rows).await.unwrap();
    }

    #[tokio::test]
    async fn tag_and_service_filters_compose() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filter = LogFilter {
            service: Some("external".into()),
            tag: Some("database".into()),
            ..Default::default()
        };
        let records = fetch_logs(&pool, &filter).await.unwrap();
        assert_eq!(records.len(), 1, "only the db-tagged error row");
        assert_eq!(records[0].level, "ERROR");
        assert_eq!(records[0].message, "db refused");
        assert!(records[0].tags.contains(&"database".to_string()));
    }

    #[tokio::test]
    async fn search_filters_messages() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filter = LogFilter {
            search: Some("refused".into()),
            ..Default::default()
        };
        let records = fetch_logs(&pool, &filter).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn newest_first_with_limit() {
        let pool = test_pool().await;
        seed(&pool).await;

        let filter = LogFilter {
            limit: Some(2),
            ..Default::default()
        };
        let records = fetch_logs(&pool, &filter).await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].id > records[1].id);
    }

    #[tokio::test]
    async fn stats_ignore_filters() {
        let pool = test_pool().await;
        seed(&pool).await;

        let all = get_stats(&pool).await.unwrap();
        assert_eq!(all.info, 1);
        assert_eq!(all.error, 1);
        assert_eq!(all.warning, 1);

        // Simulating any filter state on the read side: stats stay identical
        // because they never consult the filter.
        let filtered_view = fetch_logs(
            &pool,
            &LogFilter {
                level: Some("ERROR".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(filtered_view.len(), 1);
        assert_eq!(get_stats(&pool).await.unwrap(), all);
    }

    #[tokio::test]
    async fn tags_endpoint_counts() {
        let pool = test_pool().await;
        seed(&pool).await;

        let tags = get_tags(&pool).await.unwrap();
        assert!(tags.tags.contains(&"api".to_string()));
        assert_eq!(tags.counts["api"], 2);
        assert_eq!(tags.counts["database"], 1);
    }
}
