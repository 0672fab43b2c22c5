//! The `AIClient` capability: one trait covering every provider. Selection
//! happens per request by model name against the caller's stored credentials;
//! the circuit breaker decorates the call site, not the clients.

use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use super::anthropic::AnthropicClient;
use super::ollama::OllamaClient;
use super::openai::OpenAIClient;
use super::InsightError;
use crate::edge::crypto::Envelope;

#[async_trait]
pub trait AIClient: Send + Sync {
    fn model(&self) -> &str;
    /// Breaker key: provider plus endpoint, so one bad upstream cannot trip
    /// the circuit for the others.
    fn destination(&self) -> String;
    async fn generate(&self, prompt: &str) -> anyhow::Result<String>;
    async fn health(&self) -> anyhow::Result<()>;
}

/// Resolves the client for `(user, model)`.
///
/// Order: the user's config for that exact model, then the user's default
/// config, then the credential-free local Ollama fallback. Stored API keys
/// are decrypted just-in-time and never leave this function except inside
/// the returned client.
pub async fn resolve_client(
    pool: &SqlitePool,
    envelope: Option<&Envelope>,
    http: &reqwest::Client,
    user_id: &str,
    model: &str,
    ollama_endpoint: &str,
) -> Result<Box<dyn AIClient>, InsightError> {
    let mut row = sqlx::query(
        "SELECT id, provider, api_key_ciphertext, endpoint, model FROM llm_configs
         WHERE user_id = ? AND model = ? LIMIT 1",
    )
    .bind(user_id)
    .bind(model)
    .fetch_optional(pool)
    .await?;
    if row.is_none() {
        row = sqlx::query(
            "SELECT id, provider, api_key_ciphertext, endpoint, model FROM llm_configs
             WHERE user_id = ? AND is_default = 1 LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(pool)
        .await?;
    }

    let Some(row) = row else {
        // No stored credentials: local models need none.
        return Ok(Box::new(OllamaClient::new(
            http.clone(),
            ollama_endpoint.to_string(),
            model.to_string(),
        )));
    };

    let config_id: String = row.get("id");
    let provider: String = row.get("provider");
    let endpoint: Option<String> = row.get("endpoint");
    let configured_model: String = row.get("model");
    let ciphertext: Option<String> = row.get("api_key_ciphertext");

    // Keep the caller's model when it matched; the default config otherwise.
    let model = if configured_model == model {
        model.to_string()
    } else {
        configured_model
    };

    let api_key = match &ciphertext {
        Some(blob) => {
            let envelope = envelope.ok_or(InsightError::EncryptionDisabled)?;
            Some(
                envelope
                    .decrypt(blob)
                    .map_err(|_| InsightError::CredentialDecrypt)?,
            )
        }
        None => None,
    };

    sqlx::query("UPDATE llm_configs SET request_count = request_count + 1 WHERE id = ?")
        .bind(&config_id)
        .execute(pool)
        .await?;

    match provider.as_str() {
        "ollama" => Ok(Box::new(OllamaClient::new(
            http.clone(),
            endpoint.unwrap_or_else(|| ollama_endpoint.to_string()),
            model,
        ))),
        "anthropic" => {
            let key = api_key.ok_or_else(|| {
                InsightError::Provider("anthropic config has no API key".into())
            })?;
            Ok(Box::new(AnthropicClient::new(http.clone(), key, model, endpoint)))
        }
        "openai" => {
            let key = api_key
                .ok_or_else(|| InsightError::Provider("openai config has no API key".into()))?;
            Ok(Box::new(OpenAIClient::new(http.clone(), key, model, endpoint)))
        }
        other => Err(InsightError::Provider(format!("unknown provider '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use chrono::Utc;

    async fn store_config(
        pool: &SqlitePool,
        envelope: &Envelope,
        user: &str,
        provider: &str,
        model: &str,
        is_default: bool,
    ) {
        sqlx::query(
            "INSERT INTO llm_configs (id, user_id, provider, display_name, api_key_ciphertext, model, is_default, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(user)
        .bind(provider)
        .bind(format!("{provider} ({model})"))
        .bind(envelope.encrypt("sk-test").unwrap())
        .bind(model)
        .bind(is_default as i64)
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn unknown_model_falls_back_to_ollama() {
        let pool = test_pool().await;
        let http = reqwest::Client::new();
        let client = resolve_client(&pool, None, &http, "u-1", "llama3", "http://localhost:11434")
            .await
            .unwrap();
        assert_eq!(client.model(), "llama3");
        assert!(client.destination().starts_with("ollama:"));
    }

    #[tokio::test]
    async fn exact_model_match_wins_over_default() {
        let pool = test_pool().await;
        let envelope = Envelope::new(&[1u8; 32]).unwrap();
        store_config(&pool, &envelope, "u-1", "openai", "gpt-4o", true).await;
        store_config(&pool, &envelope, "u-1", "anthropic", "claude-sonnet", false).await;

        let http = reqwest::Client::new();
        let client = resolve_client(&pool, Some(&envelope), &http, "u-1", "claude-sonnet", "http://localhost:11434")
            .await
            .unwrap();
        assert!(client.destination().starts_with("anthropic:"));
    }

    #[tokio::test]
    async fn missing_master_key_is_rejected() {
        let pool = test_pool().await;
        let envelope = Envelope::new(&[1u8; 32]).unwrap();
        store_config(&pool, &envelope, "u-1", "anthropic", "claude-sonnet", true).await;

        let http = reqwest::Client::new();
        let out = resolve_client(&pool, None, &http, "u-1", "claude-sonnet", "http://localhost:11434").await;
        assert!(matches!(out, Err(InsightError::EncryptionDisabled)));
    }

    #[tokio::test]
    async fn usage_counter_increments() {
        let pool = test_pool().await;
        let envelope = Envelope::new(&[1u8; 32]).unwrap();
        store_config(&pool, &envelope, "u-1", "anthropic", "claude-sonnet", true).await;

        let http = reqwest::Client::new();
        resolve_client(&pool, Some(&envelope), &http, "u-1", "claude-sonnet", "x")
            .await
            .unwrap();
        let (count,): (i64,) =
            sqlx::query_as("SELECT request_count FROM llm_configs WHERE user_id = 'u-1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);
    }
}
