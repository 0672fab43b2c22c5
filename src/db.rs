use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;
use anyhow::Result;

/// Opens the primary store and bootstraps the schema.
///
/// Pool limits bound the blast radius of a misbehaving tenant: a stuck batch
/// can exhaust its own connections but not the process.
pub async fn init_db(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(5)
        .max_lifetime(Duration::from_secs(3600))
        .idle_timeout(Duration::from_secs(600))
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Creates all tables and indexes. Safe to run on every startup.
/// Shared with the in-memory test pools so fixtures never drift from prod.
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            github_id INTEGER NOT NULL UNIQUE,
            username TEXT NOT NULL,
            email TEXT,
            avatar_url TEXT,
            created_at TEXT NOT NULL,
            last_login_at TEXT NOT NULL
        )"
    ).execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS projects (
            id TEXT PRIMARY KEY,
            user_id TEXT,
            slug TEXT NOT NULL,
            name TEXT NOT NULL,
            api_key_hash TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )"
    ).execute(pool).await?;

    // Exactly one live project per slug; deactivated rows keep the history.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_projects_live_slug
         ON projects(slug) WHERE is_active = 1"
    ).execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project_id TEXT,
            service TEXT NOT NULL,
            service_name TEXT,
            level TEXT NOT NULL,
            message TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            created_at TEXT NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            user_id TEXT
        )"
    ).execute(pool).await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_service_ts ON logs(service, timestamp)")
        .execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_logs_level_ts ON logs(level, timestamp)")
        .execute(pool).await?;

    // Tag junction. PRIMARY KEY (log_id, tag) deduplicates; the tag index
    // serves `GET /logs?tag=` and `GET /tags`.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS log_tags (
            log_id INTEGER NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (log_id, tag),
            FOREIGN KEY (log_id) REFERENCES logs(id) ON DELETE CASCADE
        )"
    ).execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_log_tags_tag ON log_tags(tag)")
        .execute(pool).await?;

    // One insight per log; regeneration replaces the row through this key.
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS ai_insights (
            id TEXT PRIMARY KEY,
            log_id INTEGER NOT NULL UNIQUE,
            analysis TEXT NOT NULL,
            root_cause TEXT,
            suggestions TEXT NOT NULL DEFAULT '[]',
            model_used TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            FOREIGN KEY (log_id) REFERENCES logs(id) ON DELETE CASCADE
        )"
    ).execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS alert_configs (
            id TEXT PRIMARY KEY,
            service TEXT NOT NULL UNIQUE,
            error_threshold_per_min REAL NOT NULL DEFAULT 5.0,
            warn_threshold_per_min REAL NOT NULL DEFAULT 20.0,
            email TEXT,
            webhook_url TEXT,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )"
    ).execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS active_alerts (
            id TEXT PRIMARY KEY,
            alert_type TEXT NOT NULL,
            severity TEXT NOT NULL,
            service TEXT NOT NULL,
            message TEXT NOT NULL,
            metric_value REAL NOT NULL,
            threshold REAL NOT NULL,
            triggered_at TEXT NOT NULL,
            last_occurred_at TEXT NOT NULL,
            occurrence_count INTEGER NOT NULL DEFAULT 1,
            resolved_at TEXT
        )"
    ).execute(pool).await?;

    // At most one open alert per (type, service). Concurrent evaluator ticks
    // collapse onto this row via ON CONFLICT.
    sqlx::query(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_active_alerts_open
         ON active_alerts(alert_type, service) WHERE resolved_at IS NULL"
    ).execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS llm_configs (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            display_name TEXT NOT NULL,
            api_key_ciphertext TEXT,
            endpoint TEXT,
            model TEXT NOT NULL,
            is_default INTEGER NOT NULL DEFAULT 0,
            request_count INTEGER NOT NULL DEFAULT 0,
            token_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )"
    ).execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_llm_configs_user ON llm_configs(user_id)")
        .execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS health_checks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            status TEXT NOT NULL,
            detail TEXT,
            checked_at TEXT NOT NULL
        )"
    ).execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_health_checks_service ON health_checks(service, checked_at)")
        .execute(pool).await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS request_metrics (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            service TEXT NOT NULL,
            path TEXT NOT NULL,
            status_code INTEGER NOT NULL,
            duration_ms REAL NOT NULL,
            recorded_at TEXT NOT NULL
        )"
    ).execute(pool).await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_request_metrics_ts ON request_metrics(recorded_at)")
        .execute(pool).await?;

    Ok(())
}

#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("memory options")
        .foreign_keys(true);
    // One connection: each in-memory connection is its own database.
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("in-memory pool");
    create_schema(&pool).await.expect("schema bootstrap");
    pool
}
