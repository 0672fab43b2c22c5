//! Threshold alerting: per-service configuration, the open-alert state
//! machine, and retry-backed delivery.

pub mod evaluator;
pub mod notify;
pub mod retry;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

/// A fired alert as handed to the notifiers.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub id: String,
    pub alert_type: String,
    pub severity: String,
    pub service: String,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub occurrence_count: i64,
    pub triggered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AlertConfig {
    pub id: String,
    pub service: String,
    pub error_threshold_per_min: f64,
    pub warn_threshold_per_min: f64,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct AlertConfigUpdate {
    pub error_threshold_per_min: Option<f64>,
    pub warn_threshold_per_min: Option<f64>,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
    pub enabled: Option<bool>,
}

fn config_from_row(row: sqlx::sqlite::SqliteRow) -> AlertConfig {
    AlertConfig {
        id: row.get("id"),
        service: row.get("service"),
        error_threshold_per_min: row.get("error_threshold_per_min"),
        warn_threshold_per_min: row.get("warn_threshold_per_min"),
        email: row.get("email"),
        webhook_url: row.get("webhook_url"),
        enabled: row.get::<i64, _>("enabled") == 1,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub async fn list_configs(pool: &SqlitePool) -> Result<Vec<AlertConfig>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM alert_configs ORDER BY service")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(config_from_row).collect())
}

pub async fn enabled_configs(pool: &SqlitePool) -> Result<Vec<AlertConfig>, sqlx::Error> {
    let rows = sqlx::query("SELECT * FROM alert_configs WHERE enabled = 1")
        .fetch_all(pool)
        .await?;
    Ok(rows.into_iter().map(config_from_row).collect())
}

/// Creates or updates the threshold config for one service. Only the
/// fields present in the update change; a fresh config starts from the
/// defaults baked into the schema.
pub async fn upsert_config(
    pool: &SqlitePool,
    service: &str,
    update: &AlertConfigUpdate,
) -> Result<AlertConfig, sqlx::Error> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO alert_configs (id, service, created_at, updated_at)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(service) DO NOTHING",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(service)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    if let Some(v) = update.error_threshold_per_min {
        sqlx::query("UPDATE alert_configs SET error_threshold_per_min = ?, updated_at = ? WHERE service = ?")
            .bind(v).bind(now).bind(service).execute(pool).await?;
    }
    if let Some(v) = update.warn_threshold_per_min {
        sqlx::query("UPDATE alert_configs SET warn_threshold_per_min = ?, updated_at = ? WHERE service = ?")
            .bind(v).bind(now).bind(service).execute(pool).await?;
    }
    if let Some(v) = &update.email {
        sqlx::query("UPDATE alert_configs SET email = ?, updated_at = ? WHERE service = ?")
            .bind(v).bind(now).bind(service).execute(pool).await?;
    }
    if let Some(v) = &update.webhook_url {
        sqlx::query("UPDATE alert_configs SET webhook_url = ?, updated_at = ? WHERE service = ?")
            .bind(v).bind(now).bind(service).execute(pool).await?;
    }
    if let Some(v) = update.enabled {
        sqlx::query("UPDATE alert_configs SET enabled = ?, updated_at = ? WHERE service = ?")
            .bind(v as i64).bind(now).bind(service).execute(pool).await?;
    }

    let row = sqlx::query("SELECT * FROM alert_configs WHERE service = ?")
        .bind(service)
        .fetch_one(pool)
        .await?;
    Ok(config_from_row(row))
}

#[derive(Debug, Clone, Serialize)]
pub struct ActiveAlert {
    pub id: String,
    pub alert_type: String,
    pub severity: String,
    pub service: String,
    pub message: String,
    pub metric_value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
    pub last_occurred_at: DateTime<Utc>,
    pub occurrence_count: i64,
    pub resolved_at: Option<DateTime<Utc>>,
}

pub(crate) fn alert_from_row(row: sqlx::sqlite::SqliteRow) -> ActiveAlert {
    ActiveAlert {
        id: row.get("id"),
        alert_type: row.get("alert_type"),
        severity: row.get("severity"),
        service: row.get("service"),
        message: row.get("message"),
        metric_value: row.get("metric_value"),
        threshold: row.get("threshold"),
        triggered_at: row.get("triggered_at"),
        last_occurred_at: row.get("last_occurred_at"),
        occurrence_count: row.get("occurrence_count"),
        resolved_at: row.get("resolved_at"),
    }
}

/// Open alerts, newest activity first.
pub async fn list_open_alerts(pool: &SqlitePool) -> Result<Vec<ActiveAlert>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM active_alerts WHERE resolved_at IS NULL ORDER BY last_occurred_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(alert_from_row).collect())
}

pub async fn get_open_alert(
    pool: &SqlitePool,
    alert_type: &str,
    service: &str,
) -> Result<Option<ActiveAlert>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT * FROM active_alerts WHERE alert_type = ? AND service = ? AND resolved_at IS NULL",
    )
    .bind(alert_type)
    .bind(service)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(alert_from_row))
}
