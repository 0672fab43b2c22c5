//! Windowed aggregation for the dashboard surfaces: per-service stats,
//! health rollups, frequency-ranked top errors, and threshold violations.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;

/// Supported aggregation windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeWindow {
    Hour,
    Day,
    Week,
}

impl TimeWindow {
    /// Accepts the spellings the UI sends; defaults to one hour.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(str::trim) {
            Some("1d") | Some("24h") => Self::Day,
            Some("1w") | Some("7d") => Self::Week,
            _ => Self::Hour,
        }
    }

    pub fn minutes(self) -> i64 {
        match self {
            Self::Hour => 60,
            Self::Day => 24 * 60,
            Self::Week => 7 * 24 * 60,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Hour => "1h",
            Self::Day => "1d",
            Self::Week => "1w",
        }
    }

    pub fn cutoff(self) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(self.minutes())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub service: String,
    pub total: i64,
    pub debug: i64,
    pub info: i64,
    pub warning: i64,
    pub error: i64,
    pub critical: i64,
    /// Errors per minute over the window, rounded to centiseconds.
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TopError {
    pub service: String,
    pub level: String,
    pub message: String,
    pub count: i64,
    pub first_id: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceHealthEntry {
    pub service: String,
    pub status: String,
    pub detail: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub service: String,
    pub error_rate: f64,
    pub threshold: f64,
}

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub window: String,
    pub service_stats: Vec<ServiceStats>,
    pub service_health: Vec<ServiceHealthEntry>,
    pub top_errors: Vec<TopError>,
    pub violations: Vec<Violation>,
    /// `{}` when fewer than 20 samples exist; percentiles would mislead.
    pub response_times: serde_json::Value,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct WindowQuery {
    pub window: Option<String>,
    #[serde(rename = "timeRange")]
    pub time_range: Option<String>,
    pub service: Option<String>,
    pub limit: Option<usize>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The service a log row belongs to for aggregation purposes: the submitting
/// application's name when present, otherwise the pipeline-assigned service.
const EFFECTIVE_SERVICE: &str = "COALESCE(NULLIF(service_name, ''), service)";

pub async fn service_stats(
    pool: &SqlitePool,
    window: TimeWindow,
) -> Result<Vec<ServiceStats>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT {EFFECTIVE_SERVICE} AS svc, level, COUNT(*) AS count
         FROM logs WHERE timestamp >= ?
         GROUP BY svc, level"
    ))
    .bind(window.cutoff())
    .fetch_all(pool)
    .await?;

    let mut by_service: HashMap<String, ServiceStats> = HashMap::new();
    for row in rows {
        let svc: String = row.get("svc");
        let level: String = row.get("level");
        let count: i64 = row.get("count");
        let entry = by_service.entry(svc.clone()).or_insert_with(|| ServiceStats {
            service: svc,
            total: 0,
            debug: 0,
            info: 0,
            warning: 0,
            error: 0,
            critical: 0,
            error_rate: 0.0,
        });
        entry.total += count;
        match level.as_str() {
            "DEBUG" => entry.debug += count,
            "INFO" => entry.info += count,
            "WARN" => entry.warning += count,
            "ERROR" => entry.error += count,
            "CRITICAL" => entry.critical += count,
            _ => {}
        }
    }

    let minutes = window.minutes() as f64;
    let mut stats: Vec<ServiceStats> = by_service
        .into_values()
        .map(|mut s| {
            s.error_rate = round2((s.error + s.critical) as f64 / minutes);
            s
        })
        .collect();
    stats.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.service.cmp(&b.service)));
    Ok(stats)
}

static DIGIT_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());
static WHITESPACE_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Collapses a message to its shape so repeated errors group together:
/// lowercased, digit runs replaced with `N`, whitespace collapsed, capped
/// at 200 chars.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let digits = DIGIT_RUNS.replace_all(&lowered, "N");
    let collapsed = WHITESPACE_RUNS.replace_all(digits.trim(), " ");
    collapsed.chars().take(200).collect()
}

/// Frequency-ranked error groups in the window. Ties on count break toward
/// the lower first id, which keeps the ordering deterministic.
pub async fn top_errors(
    pool: &SqlitePool,
    window: TimeWindow,
    limit: usize,
) -> Result<Vec<TopError>, sqlx::Error> {
    let rows = sqlx::query(&format!(
        "SELECT id, {EFFECTIVE_SERVICE} AS svc, level, message
         FROM logs
         WHERE timestamp >= ? AND level IN ('ERROR', 'CRITICAL')"
    ))
    .bind(window.cutoff())
    .fetch_all(pool)
    .await?;

    let mut groups: HashMap<(String, String, String), (i64, i64, String)> = HashMap::new();
    for row in rows {
        let id: i64 = row.get("id");
        let svc: String = row.get("svc");
        let level: String = row.get("level");
        let message: String = row.get("message");
        let key = (svc, level, normalize_message(&message));
        let entry = groups.entry(key).or_insert((0, id, message));
        entry.0 += 1;
        if id < entry.1 {
            entry.1 = id;
        }
    }

    let mut ranked: Vec<TopError> = groups
        .into_iter()
        .map(|((service, level, _), (count, first_id, message))| TopError {
            service,
            level,
            message,
            count,
            first_id,
        })
        .collect();
    ranked.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.first_id.cmp(&b.first_id)));
    ranked.truncate(limit);
    Ok(ranked)
}

/// The most recent health snapshot per service.
pub async fn service_health(pool: &SqlitePool) -> Result<Vec<ServiceHealthEntry>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT service, status, detail, checked_at FROM health_checks
         WHERE id IN (SELECT MAX(id) FROM health_checks GROUP BY service)
         ORDER BY service",
    )
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| ServiceHealthEntry {
            service: row.get("service"),
            status: row.get("status"),
            detail: row.get("detail"),
            checked_at: row.get("checked_at"),
        })
        .collect())
}

/// Services whose windowed error rate exceeds their configured threshold.
pub async fn violations(
    pool: &SqlitePool,
    stats: &[ServiceStats],
) -> Result<Vec<Violation>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT service, error_threshold_per_min FROM alert_configs WHERE enabled = 1",
    )
    .fetch_all(pool)
    .await?;
    let thresholds: HashMap<String, f64> = rows
        .into_iter()
        .map(|row| (row.get("service"), row.get("error_threshold_per_min")))
        .collect();

    Ok(stats
        .iter()
        .filter_map(|s| {
            let threshold = *thresholds.get(&s.service)?;
            (s.error_rate > threshold).then(|| Violation {
                service: s.service.clone(),
                error_rate: s.error_rate,
                threshold,
            })
        })
        .collect())
}

/// Sort-and-index percentile. `values` must be sorted ascending.
fn percentile(values: &[f64], p: f64) -> f64 {
    let n = values.len();
    let idx = ((n as f64) * p).ceil() as usize;
    values[idx.clamp(1, n) - 1]
}

/// P50/P95/P99 over request durations in the window. Returns `{}` for
/// fewer than 20 samples.
pub async fn response_time_percentiles(
    pool: &SqlitePool,
    window: TimeWindow,
) -> Result<serde_json::Value, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT duration_ms FROM request_metrics WHERE recorded_at >= ? ORDER BY duration_ms ASC",
    )
    .bind(window.cutoff())
    .fetch_all(pool)
    .await?;

    let durations: Vec<f64> = rows.into_iter().map(|r| r.get("duration_ms")).collect();
    if durations.len() < 20 {
        return Ok(serde_json::json!({}));
    }
    Ok(serde_json::json!({
        "p50": round2(percentile(&durations, 0.50)),
        "p95": round2(percentile(&durations, 0.95)),
        "p99": round2(percentile(&durations, 0.99)),
        "samples": durations.len(),
    }))
}

/// The full dashboard payload for one window.
pub async fn dashboard(
    pool: &SqlitePool,
    window: TimeWindow,
) -> Result<DashboardResponse, sqlx::Error> {
    let stats = service_stats(pool, window).await?;
    let health = service_health(pool).await?;
    let errors = top_errors(pool, window, 10).await?;
    let violations = violations(pool, &stats).await?;
    let response_times = response_time_percentiles(pool, window).await?;

    Ok(DashboardResponse {
        window: window.label().to_string(),
        service_stats: stats,
        service_health: health,
        top_errors: errors,
        violations,
        response_times,
        generated_at: Utc::now(),
    })
}

/// Per-service rollup for `GET /dashboard/service`.
pub async fn service_rollup(
    pool: &SqlitePool,
    service: &str,
    window: TimeWindow,
) -> Result<serde_json::Value, sqlx::Error> {
    let stats = service_stats(pool, window).await?;
    let own = stats.into_iter().find(|s| s.service == service);
    let errors = top_errors(pool, window, 10).await?;
    let own_errors: Vec<TopError> = errors.into_iter().filter(|e| e.service == service).collect();
    let health = service_health(pool).await?;
    let own_health = health.into_iter().find(|h| h.service == service);

    Ok(serde_json::json!({
        "service": service,
        "window": window.label(),
        "stats": own,
        "top_errors": own_errors,
        "health": own_health,
        "generated_at": Utc::now(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::pipeline::persistence::insert_internal_log;

    async fn seed_errors(pool: &SqlitePool, service: &str, count: usize, message: &str) {
        for _ in 0..count {
            insert_internal_log(pool, service, "ERROR", message, serde_json::json!({}))
                .await
                .unwrap();
        }
    }

    #[test]
    fn window_parsing() {
        assert_eq!(TimeWindow::parse(Some("1h")), TimeWindow::Hour);
        assert_eq!(TimeWindow::parse(Some("24h")), TimeWindow::Day);
        assert_eq!(TimeWindow::parse(Some("1w")), TimeWindow::Week);
        assert_eq!(TimeWindow::parse(Some("7d")), TimeWindow::Week);
        assert_eq!(TimeWindow::parse(None), TimeWindow::Hour);
        assert_eq!(TimeWindow::parse(Some("garbage")), TimeWindow::Hour);
    }

    #[test]
    fn message_normalization_groups_variants() {
        assert_eq!(
            normalize_message("Timeout after 1500ms on attempt 3"),
            normalize_message("timeout  after 22ms on ATTEMPT 9"),
        );
        assert_ne!(
            normalize_message("connection refused"),
            normalize_message("connection reset"),
        );
    }

    #[test]
    fn percentile_indexing() {
        let values: Vec<f64> = (1..=100).map(|v| v as f64).collect();
        assert_eq!(percentile(&values, 0.50), 50.0);
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 0.99), 99.0);
    }

    #[tokio::test]
    async fn error_rate_is_per_minute() {
        let pool = test_pool().await;
        seed_errors(&pool, "api", 6, "boom").await;

        let stats = service_stats(&pool, TimeWindow::Hour).await.unwrap();
        let api = stats.iter().find(|s| s.service == "api").unwrap();
        assert_eq!(api.error, 6);
        assert_eq!(api.error_rate, 0.1, "6 errors over 60 minutes");
    }

    #[tokio::test]
    async fn top_errors_rank_by_count_then_id() {
        let pool = test_pool().await;
        seed_errors(&pool, "api", 3, "db timeout after 10ms").await;
        seed_errors(&pool, "api", 3, "db timeout after 99ms").await; // same group
        seed_errors(&pool, "worker", 2, "queue full").await;

        let ranked = top_errors(&pool, TimeWindow::Hour, 10).await.unwrap();
        assert_eq!(ranked[0].count, 6, "normalized variants grouped");
        assert_eq!(ranked[0].service, "api");
        assert_eq!(ranked[1].count, 2);
    }

    #[tokio::test]
    async fn percentiles_need_twenty_samples() {
        let pool = test_pool().await;
        let now = Utc::now();
        for i in 0..19 {
            sqlx::query(
                "INSERT INTO request_metrics (service, path, status_code, duration_ms, recorded_at)
                 VALUES ('logs', '/logs', 200, ?, ?)",
            )
            .bind(i as f64)
            .bind(now)
            .execute(&pool)
            .await
            .unwrap();
        }
        let out = response_time_percentiles(&pool, TimeWindow::Hour).await.unwrap();
        assert_eq!(out, serde_json::json!({}), "19 samples is not enough");

        sqlx::query(
            "INSERT INTO request_metrics (service, path, status_code, duration_ms, recorded_at)
             VALUES ('logs', '/logs', 200, 100.0, ?)",
        )
        .bind(now)
        .execute(&pool)
        .await
        .unwrap();
        let out = response_time_percentiles(&pool, TimeWindow::Hour).await.unwrap();
        assert!(out.get("p95").is_some());
    }

    #[tokio::test]
    async fn violations_compare_against_config() {
        let pool = test_pool().await;
        seed_errors(&pool, "api", 120, "boom").await; // 2/min over 1h
        sqlx::query(
            "INSERT INTO alert_configs (id, service, error_threshold_per_min, warn_threshold_per_min, enabled, created_at, updated_at)
             VALUES ('c1', 'api', 1.0, 10.0, 1, ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();

        let stats = service_stats(&pool, TimeWindow::Hour).await.unwrap();
        let violations = violations(&pool, &stats).await.unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].service, "api");
        assert!(violations[0].error_rate > violations[0].threshold);
    }
}
