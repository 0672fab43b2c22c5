//! AI insight layer: fingerprinted per-log analysis through a
//! circuit-breaker-wrapped provider abstraction. One insight per log,
//! regenerations overwrite in place, and every failure is logged back into
//! the pipeline so the platform observes itself.

pub mod anthropic;
pub mod breaker;
pub mod client;
pub mod ollama;
pub mod openai;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::edge::crypto::Envelope;
use crate::pipeline::persistence::insert_internal_log;
use self::breaker::BreakerRegistry;
use self::client::{resolve_client, AIClient};

/// Service name under which insight failures log themselves.
pub const SELF_SERVICE: &str = "ai-insights";

/// Provider generate deadline.
const GENERATE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum InsightError {
    #[error("log entry not found")]
    LogNotFound,
    /// Circuit open: rejected without touching the upstream.
    #[error("provider temporarily unavailable")]
    UpstreamUnavailable,
    #[error("provider call timed out")]
    Timeout,
    #[error("provider error: {0}")]
    Provider(String),
    #[error("provider response was not parseable: {0}")]
    ParseFailed(String),
    #[error("credential storage is disabled (no master key)")]
    EncryptionDisabled,
    #[error("stored credential failed to decrypt")]
    CredentialDecrypt,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl InsightError {
    /// Stable error code for the HTTP envelope and the self-logged entry.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LogNotFound => "LOG_NOT_FOUND",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::Timeout => "PROVIDER_TIMEOUT",
            Self::Provider(_) => "PROVIDER_ERROR",
            Self::ParseFailed(_) => "PARSE_FAILED",
            Self::EncryptionDisabled => "ENCRYPTION_DISABLED",
            Self::CredentialDecrypt => "DECRYPT_FAILED",
            Self::Db(_) => "INTERNAL",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AIInsight {
    pub id: String,
    pub log_id: i64,
    pub analysis: String,
    pub root_cause: Option<String>,
    pub suggestions: Vec<String>,
    pub model_used: String,
    pub generated_at: DateTime<Utc>,
}

/// Parsed provider output before persistence.
#[derive(Debug)]
struct InsightPayload {
    analysis: String,
    root_cause: Option<String>,
    suggestions: Vec<String>,
}

pub struct InsightService {
    pool: SqlitePool,
    http: reqwest::Client,
    breakers: BreakerRegistry,
    envelope: Option<Envelope>,
    ollama_endpoint: String,
}

impl InsightService {
    pub fn new(
        pool: SqlitePool,
        http: reqwest::Client,
        breakers: BreakerRegistry,
        envelope: Option<Envelope>,
        ollama_endpoint: String,
    ) -> Self {
        Self {
            pool,
            http,
            breakers,
            envelope,
            ollama_endpoint,
        }
    }

    pub async fn get(&self, log_id: i64) -> Result<Option<AIInsight>, sqlx::Error> {
        get_insight(&self.pool, log_id).await
    }

    /// Generates (or regenerates) the insight for one log entry.
    pub async fn generate(
        &self,
        user_id: &str,
        log_id: i64,
        model: &str,
    ) -> Result<AIInsight, InsightError> {
        let log = self.load_log(log_id).await?;
        let client = resolve_client(
            &self.pool,
            self.envelope.as_ref(),
            &self.http,
            user_id,
            model,
            &self.ollama_endpoint,
        )
        .await?;

        self.generate_with_client(log_id, &log, client.as_ref()).await
    }

    /// The provider-facing half, split out so tests can drive it with a
    /// scripted client.
    async fn generate_with_client(
        &self,
        log_id: i64,
        log: &LogContext,
        client: &dyn AIClient,
    ) -> Result<AIInsight, InsightError> {
        let breaker = self.breakers.get(&client.destination());
        if breaker.try_acquire().is_err() {
            let err = InsightError::UpstreamUnavailable;
            self.log_failure(log_id, client.model(), &err).await;
            return Err(err);
        }

        let prompt = build_prompt(log);
        let raw = match tokio::time::timeout(GENERATE_DEADLINE, client.generate(&prompt)).await {
            Err(_) => {
                breaker.record_failure();
                let err = InsightError::Timeout;
                self.log_failure(log_id, client.model(), &err).await;
                return Err(err);
            }
            Ok(Err(e)) => {
                breaker.record_failure();
                let err = InsightError::Provider(e.to_string());
                self.log_failure(log_id, client.model(), &err).await;
                return Err(err);
            }
            Ok(Ok(raw)) => {
                breaker.record_success();
                raw
            }
        };

        let payload = match parse_response(&raw) {
            Ok(payload) => payload,
            Err(detail) => {
                let err = InsightError::ParseFailed(detail);
                self.log_failure(log_id, client.model(), &err).await;
                return Err(err);
            }
        };

        let insight = upsert_insight(&self.pool, log_id, client.model(), &payload).await?;
        tracing::info!(
            "🧠 [Insights] Generated insight for log {} with {}",
            log_id,
            client.model()
        );
        Ok(insight)
    }

    async fn load_log(&self, log_id: i64) -> Result<LogContext, InsightError> {
        let row = sqlx::query(
            "SELECT service, service_name, level, message, timestamp, metadata FROM logs WHERE id = ?",
        )
        .bind(log_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(InsightError::LogNotFound)?;

        Ok(LogContext {
            service: row
                .get::<Option<String>, _>("service_name")
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| row.get("service")),
            level: row.get("level"),
            message: row.get("message"),
            timestamp: row.get("timestamp"),
            metadata: row.get("metadata"),
        })
    }

    /// Writes the failure into the pipeline. Best effort: a second failure
    /// here only goes to stderr via tracing.
    async fn log_failure(&self, log_id: i64, model: &str, err: &InsightError) {
        let metadata = serde_json::json!({
            "log_id": log_id,
            "model": model,
            "error_type": err.code(),
            "failed_at": Utc::now().to_rfc3339(),
        });
        let message = format!("insight generation failed for log {log_id}: {err}");
        if let Err(e) =
            insert_internal_log(&self.pool, SELF_SERVICE, "ERROR", &message, metadata).await
        {
            tracing::error!("❌ [Insights] Could not self-log failure: {}", e);
        }
    }
}

pub(crate) struct LogContext {
    service: String,
    level: String,
    message: String,
    timestamp: DateTime<Utc>,
    metadata: String,
}

/// The fixed analysis template. Demands a structured JSON answer the parser
/// below can read back.
fn build_prompt(log: &LogContext) -> String {
    format!(
        "You are a production incident analyst. Analyze this log entry and respond \
         with a single JSON object, no surrounding prose, shaped exactly like:\n\
         {{\"analysis\": \"...\", \"root_cause\": \"...\", \"suggestions\": [\"...\"]}}\n\
         `root_cause` may be null when unknown; `suggestions` is ordered by impact.\n\n\
         Log entry:\n\
         level: {}\nservice: {}\ntimestamp: {}\nmessage: {}\nmetadata: {}\n",
        log.level,
        log.service,
        log.timestamp.to_rfc3339(),
        log.message,
        log.metadata,
    )
}

/// Extracts the JSON object from a completion. Providers occasionally wrap
/// the object in prose or code fences; everything outside the outermost
/// braces is ignored.
fn parse_response(raw: &str) -> Result<InsightPayload, String> {
    let start = raw.find('{').ok_or("no JSON object in response")?;
    let end = raw.rfind('}').ok_or("no closing brace in response")?;
    if end <= start {
        return Err("malformed JSON braces".to_string());
    }
    let value: serde_json::Value =
        serde_json::from_str(&raw[start..=end]).map_err(|e| e.to_string())?;

    let analysis = value
        .get("analysis")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("missing 'analysis' field")?
        .to_string();
    let root_cause = value
        .get("root_cause")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let suggestions = value
        .get("suggestions")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(InsightPayload {
        analysis,
        root_cause,
        suggestions,
    })
}

fn insight_from_row(row: sqlx::sqlite::SqliteRow) -> AIInsight {
    AIInsight {
        id: row.get("id"),
        log_id: row.get("log_id"),
        analysis: row.get("analysis"),
        root_cause: row.get("root_cause"),
        suggestions: serde_json::from_str(&row.get::<String, _>("suggestions"))
            .unwrap_or_default(),
        model_used: row.get("model_used"),
        generated_at: row.get("generated_at"),
    }
}

pub async fn get_insight(pool: &SqlitePool, log_id: i64) -> Result<Option<AIInsight>, sqlx::Error> {
    let row = sqlx::query("SELECT * FROM ai_insights WHERE log_id = ?")
        .bind(log_id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(insight_from_row))
}

/// Single-writer upsert keyed on `log_id`. Concurrent regenerations for the
/// same log serialize on the unique index; the later writer wins and the
/// earlier one sees no error.
async fn upsert_insight(
    pool: &SqlitePool,
    log_id: i64,
    model: &str,
    payload: &InsightPayload,
) -> Result<AIInsight, sqlx::Error> {
    let suggestions = serde_json::to_string(&payload.suggestions).unwrap_or_else(|_| "[]".into());
    sqlx::query(
        "INSERT INTO ai_insights (id, log_id, analysis, root_cause, suggestions, model_used, generated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(log_id) DO UPDATE SET
             analysis = excluded.analysis,
             root_cause = excluded.root_cause,
             suggestions = excluded.suggestions,
             model_used = excluded.model_used,
             generated_at = excluded.generated_at",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(log_id)
    .bind(&payload.analysis)
    .bind(&payload.root_cause)
    .bind(suggestions)
    .bind(model)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    let row = sqlx::query("SELECT * FROM ai_insights WHERE log_id = ?")
        .bind(log_id)
        .fetch_one(pool)
        .await?;
    Ok(insight_from_row(row))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    enum Script {
        Good(&'static str),
        Fail,
    }

    struct ScriptedClient {
        script: Script,
        calls: Arc<AtomicU32>,
    }

    impl ScriptedClient {
        fn new(script: Script) -> (Self, Arc<AtomicU32>) {
            let calls = Arc::new(AtomicU32::new(0));
            (
                Self {
                    script,
                    calls: calls.clone(),
                },
                calls,
            )
        }
    }

    #[async_trait]
    impl AIClient for ScriptedClient {
        fn model(&self) -> &str {
            "scripted-model"
        }

        fn destination(&self) -> String {
            "scripted:test".to_string()
        }

        async fn generate(&self, _prompt: &str) -> anyhow::Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.script {
                Script::Good(body) => Ok(body.to_string()),
                Script::Fail => Err(anyhow::anyhow!("upstream exploded")),
            }
        }

        async fn health(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn service(pool: &SqlitePool) -> InsightService {
        InsightService::new(
            pool.clone(),
            reqwest::Client::new(),
            BreakerRegistry::new(5, Duration::from_secs(60)),
            None,
            "http://localhost:11434".to_string(),
        )
    }

    async fn seed_log(pool: &SqlitePool) -> i64 {
        insert_internal_log(
            pool,
            "api",
            "ERROR",
            "db connection refused",
            serde_json::json!({"attempt": 3}),
        )
        .await
        .unwrap()
    }

    const GOOD_BODY: &str = r#"Here is my take:
{"analysis": "The database rejected the connection.", "root_cause": "pool exhausted", "suggestions": ["raise pool size", "add backoff"]}"#;

    #[test]
    fn parse_extracts_object_from_prose() {
        let payload = parse_response(GOOD_BODY).unwrap();
        assert_eq!(payload.analysis, "The database rejected the connection.");
        assert_eq!(payload.root_cause.as_deref(), Some("pool exhausted"));
        assert_eq!(payload.suggestions.len(), 2);
    }

    #[test]
    fn parse_rejects_missing_analysis() {
        assert!(parse_response(r#"{"root_cause": "x"}"#).is_err());
        assert!(parse_response("no json here at all").is_err());
        assert!(parse_response(r#"{"analysis": ""}"#).is_err());
    }

    #[tokio::test]
    async fn generate_then_get_round_trips() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        let log_id = seed_log(&pool).await;
        let log = svc.load_log(log_id).await.unwrap();
        let (client, _) = ScriptedClient::new(Script::Good(GOOD_BODY));

        let insight = svc
            .generate_with_client(log_id, &log, &client)
            .await
            .unwrap();
        assert_eq!(insight.log_id, log_id);
        assert_eq!(insight.model_used, "scripted-model");

        let cached = svc.get(log_id).await.unwrap().expect("cached insight");
        assert_eq!(cached.id, insight.id);
    }

    #[tokio::test]
    async fn regenerate_overwrites_in_place() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        let log_id = seed_log(&pool).await;
        let log = svc.load_log(log_id).await.unwrap();

        let (first, _) = ScriptedClient::new(Script::Good(GOOD_BODY));
        svc.generate_with_client(log_id, &log, &first).await.unwrap();

        let (second, _) = ScriptedClient::new(Script::Good(
            r#"{"analysis": "second pass", "suggestions": []}"#,
        ));
        let regenerated = svc
            .generate_with_client(log_id, &log, &second)
            .await
            .unwrap();
        assert_eq!(regenerated.analysis, "second pass");

        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM ai_insights WHERE log_id = ?")
                .bind(log_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1, "one insight per log, always");
    }

    #[tokio::test]
    async fn provider_failure_self_logs_into_pipeline() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        let log_id = seed_log(&pool).await;
        let log = svc.load_log(log_id).await.unwrap();
        let (client, _) = ScriptedClient::new(Script::Fail);

        let err = svc
            .generate_with_client(log_id, &log, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, InsightError::Provider(_)));

        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM logs WHERE service = 'ai-insights' AND level = 'ERROR'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(count, 1, "the platform observes its own failures");

        let (metadata,): (String,) =
            sqlx::query_as("SELECT metadata FROM logs WHERE service = 'ai-insights'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(metadata.contains("PROVIDER_ERROR"));
        assert!(metadata.contains(&log_id.to_string()));
    }

    #[tokio::test]
    async fn circuit_opens_after_five_failures() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        let log_id = seed_log(&pool).await;
        let log = svc.load_log(log_id).await.unwrap();
        let (client, calls) = ScriptedClient::new(Script::Fail);

        for _ in 0..5 {
            let err = svc
                .generate_with_client(log_id, &log, &client)
                .await
                .unwrap_err();
            assert!(matches!(err, InsightError::Provider(_)));
        }
        // Sixth attempt: rejected fast, upstream untouched.
        let err = svc
            .generate_with_client(log_id, &log, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, InsightError::UpstreamUnavailable));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn parse_failure_reports_and_self_logs() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        let log_id = seed_log(&pool).await;
        let log = svc.load_log(log_id).await.unwrap();
        let (client, _) = ScriptedClient::new(Script::Good("the model rambled with no JSON"));

        let err = svc
            .generate_with_client(log_id, &log, &client)
            .await
            .unwrap_err();
        assert!(matches!(err, InsightError::ParseFailed(_)));

        let (metadata,): (String,) =
            sqlx::query_as("SELECT metadata FROM logs WHERE service = 'ai-insights'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert!(metadata.contains("PARSE_FAILED"));
    }

    #[tokio::test]
    async fn missing_log_is_not_found() {
        let pool = test_pool().await;
        let svc = service(&pool).await;
        assert!(matches!(
            svc.generate("u-1", 424242, "any-model").await,
            Err(InsightError::LogNotFound)
        ));
    }
}
