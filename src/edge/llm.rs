//! Per-user LLM provider credentials. API keys exist in plaintext only
//! inside the envelope encrypt/decrypt calls; the row stores ciphertext.
//! At most one default config per user, enforced transactionally.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use uuid::Uuid;

use super::crypto::Envelope;

const KNOWN_PROVIDERS: &[&str] = &["ollama", "anthropic", "openai"];

#[derive(Debug, Error)]
pub enum LlmConfigError {
    #[error("unknown provider '{0}'")]
    InvalidProvider(String),
    /// An API key was supplied but no master key is configured.
    #[error("credential storage is disabled (no master key)")]
    EncryptionDisabled,
    #[error("encryption failed")]
    EncryptFailed,
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Deserialize)]
pub struct CreateLlmConfig {
    pub provider: String,
    pub display_name: String,
    pub api_key: Option<String>,
    pub endpoint: Option<String>,
    pub model: String,
    #[serde(default)]
    pub is_default: bool,
}

/// Read model. `api_key` is always masked: either "configured" or absent.
#[derive(Debug, Serialize)]
pub struct LlmConfigView {
    pub id: String,
    pub provider: String,
    pub display_name: String,
    pub api_key: Option<&'static str>,
    pub endpoint: Option<String>,
    pub model: String,
    pub is_default: bool,
    pub request_count: i64,
    pub created_at: DateTime<Utc>,
}

fn view_from_row(row: sqlx::sqlite::SqliteRow) -> LlmConfigView {
    let has_key = row.get::<Option<String>, _>("api_key_ciphertext").is_some();
    LlmConfigView {
        id: row.get("id"),
        provider: row.get("provider"),
        display_name: row.get("display_name"),
        api_key: has_key.then_some("configured"),
        endpoint: row.get("endpoint"),
        model: row.get("model"),
        is_default: row.get::<i64, _>("is_default") == 1,
        request_count: row.get("request_count"),
        created_at: row.get("created_at"),
    }
}

pub async fn list_configs(
    pool: &SqlitePool,
    user_id: &str,
) -> Result<Vec<LlmConfigView>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT * FROM llm_configs WHERE user_id = ? ORDER BY is_default DESC, created_at DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(view_from_row).collect())
}

pub async fn create_config(
    pool: &SqlitePool,
    envelope: Option<&Envelope>,
    user_id: &str,
    req: &CreateLlmConfig,
) -> Result<LlmConfigView, LlmConfigError> {
    let provider = req.provider.trim().to_lowercase();
    if !KNOWN_PROVIDERS.contains(&provider.as_str()) {
        return Err(LlmConfigError::InvalidProvider(provider));
    }

    let ciphertext = match req.api_key.as_deref().filter(|k| !k.is_empty()) {
        Some(plaintext) => {
            let envelope = envelope.ok_or(LlmConfigError::EncryptionDisabled)?;
            Some(
                envelope
                    .encrypt(plaintext)
                    .map_err(|_| LlmConfigError::EncryptFailed)?,
            )
        }
        None => None,
    };

    let id = Uuid::new_v4().to_string();
    let mut tx = pool.begin().await?;
    if req.is_default {
        sqlx::query("UPDATE llm_configs SET is_default = 0 WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
    }
    sqlx::query(
        "INSERT INTO llm_configs
             (id, user_id, provider, display_name, api_key_ciphertext, endpoint, model, is_default, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(user_id)
    .bind(&provider)
    .bind(req.display_name.trim())
    .bind(&ciphertext)
    .bind(&req.endpoint)
    .bind(req.model.trim())
    .bind(req.is_default as i64)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let row = sqlx::query("SELECT * FROM llm_configs WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?;
    Ok(view_from_row(row))
}

/// Returns false when the config does not exist or belongs to someone else.
pub async fn delete_config(
    pool: &SqlitePool,
    user_id: &str,
    config_id: &str,
) -> Result<bool, sqlx::Error> {
    let deleted = sqlx::query("DELETE FROM llm_configs WHERE id = ? AND user_id = ?")
        .bind(config_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    Ok(deleted.rows_affected() == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn envelope() -> Envelope {
        Envelope::new(&[3u8; 32]).unwrap()
    }

    fn request(provider: &str, is_default: bool) -> CreateLlmConfig {
        CreateLlmConfig {
            provider: provider.to_string(),
            display_name: format!("{provider} main"),
            api_key: Some("sk-test".to_string()),
            endpoint: None,
            model: "claude-sonnet".to_string(),
            is_default,
        }
    }

    #[tokio::test]
    async fn stored_key_is_ciphertext_and_masked() {
        let pool = test_pool().await;
        let env = envelope();
        let view = create_config(&pool, Some(&env), "u-1", &request("anthropic", true))
            .await
            .unwrap();
        assert_eq!(view.api_key, Some("configured"), "never the plaintext");

        let (raw,): (String,) =
            sqlx::query_as("SELECT api_key_ciphertext FROM llm_configs WHERE id = ?")
                .bind(&view.id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_ne!(raw, "sk-test");
        assert!(!raw.contains("sk-test"));
        assert_eq!(env.decrypt(&raw).unwrap(), "sk-test");

        // The wrong master key cannot read it back.
        let other = Envelope::new(&[9u8; 32]).unwrap();
        assert!(other.decrypt(&raw).is_err());
    }

    #[tokio::test]
    async fn one_default_per_user() {
        let pool = test_pool().await;
        let env = envelope();
        let first = create_config(&pool, Some(&env), "u-1", &request("anthropic", true))
            .await
            .unwrap();
        let second = create_config(&pool, Some(&env), "u-1", &request("openai", true))
            .await
            .unwrap();
        assert!(second.is_default);

        let configs = list_configs(&pool, "u-1").await.unwrap();
        let defaults: Vec<_> = configs.iter().filter(|c| c.is_default).collect();
        assert_eq!(defaults.len(), 1);
        assert_eq!(defaults[0].id, second.id);
        assert_ne!(first.id, second.id);
    }

    #[tokio::test]
    async fn key_requires_master_key() {
        let pool = test_pool().await;
        assert!(matches!(
            create_config(&pool, None, "u-1", &request("anthropic", false)).await,
            Err(LlmConfigError::EncryptionDisabled)
        ));

        // Keyless (local ollama) configs are fine without a master key.
        let keyless = CreateLlmConfig {
            api_key: None,
            ..request("ollama", false)
        };
        let view = create_config(&pool, None, "u-1", &keyless).await.unwrap();
        assert_eq!(view.api_key, None);
    }

    #[tokio::test]
    async fn unknown_provider_rejected() {
        let pool = test_pool().await;
        assert!(matches!(
            create_config(&pool, None, "u-1", &request("skynet", false)).await,
            Err(LlmConfigError::InvalidProvider(_))
        ));
    }

    #[tokio::test]
    async fn delete_scoped_to_owner() {
        let pool = test_pool().await;
        let env = envelope();
        let view = create_config(&pool, Some(&env), "u-1", &request("anthropic", false))
            .await
            .unwrap();
        assert!(!delete_config(&pool, "u-2", &view.id).await.unwrap());
        assert!(delete_config(&pool, "u-1", &view.id).await.unwrap());
    }
}
