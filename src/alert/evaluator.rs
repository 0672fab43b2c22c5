//! The periodic evaluator. One long-lived loop ticks at a configured
//! interval and runs three independent checks; firing and resolving go
//! through conditional upserts on the open-alert partial unique index, so
//! two concurrent ticks can never double-fire.

use chrono::{Duration as ChronoDuration, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::notify::DeliveryJob;
use super::{alert_from_row, enabled_configs, ActiveAlert};

pub const ALERT_TYPE_ERROR_RATE: &str = "error_rate_high";
pub const ALERT_TYPE_RESPONSE_TIME: &str = "response_time_high";
pub const ALERT_TYPE_SERVICE_HEALTH: &str = "service_health_failed";

/// Consecutive non-healthy snapshots before a service counts as down.
const SERVICE_DOWN_THRESHOLD: i64 = 3;
/// Minimum sample size for a meaningful P95.
const MIN_METRIC_SAMPLES: usize = 20;

pub struct AlertEngine {
    pool: SqlitePool,
    interval: Duration,
    /// Rolling window the rate checks look back over.
    window_secs: i64,
    response_time_threshold_ms: f64,
    tx: mpsc::Sender<DeliveryJob>,
}

impl AlertEngine {
    pub fn new(
        pool: SqlitePool,
        interval: Duration,
        window_secs: i64,
        response_time_threshold_ms: f64,
        tx: mpsc::Sender<DeliveryJob>,
    ) -> Self {
        Self {
            pool,
            interval,
            window_secs,
            response_time_threshold_ms,
            tx,
        }
    }

    /// The evaluator loop. Exits within one tick of the shutdown signal.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!(
            "⏱️ [Alerts] Evaluator started (every {:?}, window {}s)",
            self.interval,
            self.window_secs
        );
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_once().await {
                        tracing::error!("❌ [Alerts] Evaluation tick failed: {}", e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("⏹️ [Alerts] Evaluator stopping");
                        break;
                    }
                }
            }
        }
    }

    /// One tick: the three checks run independently; a failing check logs
    /// and does not stop the others.
    pub async fn evaluate_once(&self) -> anyhow::Result<()> {
        if let Err(e) = self.check_error_rates().await {
            tracing::error!("❌ [Alerts] Error-rate check failed: {}", e);
        }
        if let Err(e) = self.check_response_time().await {
            tracing::error!("❌ [Alerts] Response-time check failed: {}", e);
        }
        if let Err(e) = self.check_service_health().await {
            tracing::error!("❌ [Alerts] Service-health check failed: {}", e);
        }
        Ok(())
    }

    async fn check_error_rates(&self) -> Result<(), sqlx::Error> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.window_secs);
        let rows = sqlx::query(
            "SELECT COALESCE(NULLIF(service_name, ''), service) AS svc, COUNT(*) AS count
             FROM logs
             WHERE timestamp >= ? AND level IN ('ERROR', 'CRITICAL')
             GROUP BY svc",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let counts: HashMap<String, i64> = rows
            .into_iter()
            .map(|row| (row.get("svc"), row.get("count")))
            .collect();

        let window_minutes = (self.window_secs as f64 / 60.0).max(f64::MIN_POSITIVE);
        for config in enabled_configs(&self.pool).await? {
            let errors = counts.get(&config.service).copied().unwrap_or(0);
            let rate = errors as f64 / window_minutes;
            if rate > config.error_threshold_per_min {
                let message = format!(
                    "error rate {:.2}/min exceeds threshold {:.2}/min for service '{}'",
                    rate, config.error_threshold_per_min, config.service
                );
                self.fire(
                    ALERT_TYPE_ERROR_RATE,
                    "warning",
                    &config.service,
                    &message,
                    rate,
                    config.error_threshold_per_min,
                    config.email.clone(),
                    config.webhook_url.clone(),
                )
                .await?;
            } else {
                self.clear(ALERT_TYPE_ERROR_RATE, &config.service).await?;
            }
        }
        Ok(())
    }

    async fn check_response_time(&self) -> Result<(), sqlx::Error> {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.window_secs);
        let rows = sqlx::query(
            "SELECT duration_ms FROM request_metrics WHERE recorded_at >= ? ORDER BY duration_ms ASC",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        let durations: Vec<f64> = rows.into_iter().map(|r| r.get("duration_ms")).collect();

        if durations.len() < MIN_METRIC_SAMPLES {
            // Too little traffic to judge; resolve anything stale.
            self.clear(ALERT_TYPE_RESPONSE_TIME, "all").await?;
            return Ok(());
        }
        let idx = ((durations.len() as f64) * 0.95).ceil() as usize;
        let p95 = durations[idx.clamp(1, durations.len()) - 1];

        if p95 > self.response_time_threshold_ms {
            let message = format!(
                "p95 response time {:.0}ms exceeds threshold {:.0}ms",
                p95, self.response_time_threshold_ms
            );
            self.fire(
                ALERT_TYPE_RESPONSE_TIME,
                "warning",
                "all",
                &message,
                p95,
                self.response_time_threshold_ms,
                None,
                None,
            )
            .await?;
        } else {
            self.clear(ALERT_TYPE_RESPONSE_TIME, "all").await?;
        }
        Ok(())
    }

    async fn check_service_health(&self) -> Result<(), sqlx::Error> {
        let services: Vec<(String,)> =
            sqlx::query_as("SELECT DISTINCT service FROM health_checks")
                .fetch_all(&self.pool)
                .await?;

        for (service,) in services {
            let statuses: Vec<(String,)> = sqlx::query_as(
                "SELECT status FROM health_checks WHERE service = ? ORDER BY id DESC LIMIT ?",
            )
            .bind(&service)
            .bind(SERVICE_DOWN_THRESHOLD)
            .fetch_all(&self.pool)
            .await?;

            let all_failing = statuses.len() as i64 >= SERVICE_DOWN_THRESHOLD
                && statuses.iter().all(|(s,)| s != "healthy");
            if all_failing {
                let worst_is_down = statuses.iter().any(|(s,)| s == "unhealthy");
                let severity = if worst_is_down { "critical" } else { "warning" };
                let message = format!(
                    "service '{}' failed its last {} health checks",
                    service, SERVICE_DOWN_THRESHOLD
                );
                self.fire(
                    ALERT_TYPE_SERVICE_HEALTH,
                    severity,
                    &service,
                    &message,
                    statuses.len() as f64,
                    SERVICE_DOWN_THRESHOLD as f64,
                    None,
                    None,
                )
                .await?;
            } else {
                self.clear(ALERT_TYPE_SERVICE_HEALTH, &service).await?;
            }
        }
        Ok(())
    }

    /// Fire-or-update. The conflict target is the partial unique index on
    /// open rows: a repeat fire bumps `occurrence_count` and refreshes the
    /// metric on the existing open alert. Every fire schedules delivery.
    #[allow(clippy::too_many_arguments)]
    async fn fire(
        &self,
        alert_type: &str,
        severity: &str,
        service: &str,
        message: &str,
        metric_value: f64,
        threshold: f64,
        email: Option<String>,
        webhook_url: Option<String>,
    ) -> Result<ActiveAlert, sqlx::Error> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO active_alerts
                 (id, alert_type, severity, service, message, metric_value, threshold,
                  triggered_at, last_occurred_at, occurrence_count, resolved_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL)
             ON CONFLICT(alert_type, service) WHERE resolved_at IS NULL
             DO UPDATE SET
                 occurrence_count = occurrence_count + 1,
                 last_occurred_at = excluded.last_occurred_at,
                 metric_value = excluded.metric_value,
                 severity = excluded.severity,
                 message = excluded.message",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(alert_type)
        .bind(severity)
        .bind(service)
        .bind(message)
        .bind(metric_value)
        .bind(threshold)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(
            "SELECT * FROM active_alerts
             WHERE alert_type = ? AND service = ? AND resolved_at IS NULL",
        )
        .bind(alert_type)
        .bind(service)
        .fetch_one(&self.pool)
        .await?;
        let alert = alert_from_row(row);

        tracing::warn!(
            "🚨 [Alerts] {} on '{}' (occurrence {}): {}",
            alert_type,
            service,
            alert.occurrence_count,
            message
        );

        let event = super::AlertEvent {
            id: alert.id.clone(),
            alert_type: alert.alert_type.clone(),
            severity: alert.severity.clone(),
            service: alert.service.clone(),
            message: alert.message.clone(),
            metric_value: alert.metric_value,
            threshold: alert.threshold,
            occurrence_count: alert.occurrence_count,
            triggered_at: alert.triggered_at,
        };
        // Never block the evaluator on a slow consumer; a full queue drops
        // this delivery and the next tick re-fires anyway.
        if let Err(e) = self.tx.try_send(DeliveryJob {
            alert: event,
            email,
            webhook_url,
        }) {
            tracing::warn!("⚠️ [Alerts] Delivery queue full, dropping notification: {}", e);
        }

        Ok(alert)
    }

    async fn clear(&self, alert_type: &str, service: &str) -> Result<(), sqlx::Error> {
        let resolved = sqlx::query(
            "UPDATE active_alerts SET resolved_at = ?
             WHERE alert_type = ? AND service = ? AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(alert_type)
        .bind(service)
        .execute(&self.pool)
        .await?;
        if resolved.rows_affected() > 0 {
            tracing::info!("✅ [Alerts] Resolved {} for '{}'", alert_type, service);
        }
        Ok(())
    }
}
