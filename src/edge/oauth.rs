//! GitHub OAuth handshake: single-use CSRF state, code exchange, user upsert.
//!
//! The state token protocol is the replay defence: 32 bytes of OS randomness,
//! stored as `oauth_state:<token> = "valid"` with a 10-minute TTL and consumed
//! with one atomic read-and-delete. A state is never accepted twice.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::time::Duration;
use thiserror::Error;

use super::kv::{Kv, KvError};

/// 10 minutes from mint to callback, per the CSRF window.
pub const STATE_TTL_SECS: u64 = 600;
const STATE_PREFIX: &str = "oauth_state:";

/// GitHub's token exchange can be slow; everything past this is a 502.
const EXCHANGE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum OAuthError {
    /// Unknown, expired, or replayed state token. Terminal 401.
    #[error("oauth state invalid")]
    StateInvalid,
    #[error("oauth provider unavailable: {0}")]
    Upstream(String),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

#[derive(Debug, Deserialize)]
pub struct GitHubUser {
    pub id: i64,
    pub login: String,
    pub email: Option<String>,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AccessTokenResponse {
    access_token: Option<String>,
    error_description: Option<String>,
}

/// Mints a state token and registers it for single use.
pub async fn mint_state(kv: &dyn Kv) -> Result<String, KvError> {
    let mut raw = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut raw);
    let state = URL_SAFE_NO_PAD.encode(raw);
    kv.set_ex(&format!("{STATE_PREFIX}{state}"), "valid", STATE_TTL_SECS)
        .await?;
    Ok(state)
}

/// Consumes a state token. GET-then-DEL in one atomic step: a second call
/// with the same token (replay) sees nothing and fails.
pub async fn consume_state(kv: &dyn Kv, state: &str) -> Result<(), OAuthError> {
    match kv.get_del(&format!("{STATE_PREFIX}{state}")).await? {
        Some(marker) if marker == "valid" => Ok(()),
        _ => Err(OAuthError::StateInvalid),
    }
}

#[derive(Clone)]
pub struct GitHubOAuth {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    http: reqwest::Client,
}

impl GitHubOAuth {
    pub fn new(
        client_id: String,
        client_secret: String,
        redirect_url: String,
        http: reqwest::Client,
    ) -> Self {
        Self {
            client_id,
            client_secret,
            redirect_url,
            http,
        }
    }

    pub fn authorize_url(&self, state: &str) -> String {
        format!(
            "https://github.com/login/oauth/authorize?client_id={}&redirect_uri={}&state={}&scope=read:user%20user:email",
            self.client_id, self.redirect_url, state
        )
    }

    /// Exchanges the authorization code and fetches the user profile.
    pub async fn exchange_code(&self, code: &str) -> Result<GitHubUser, OAuthError> {
        let token_res = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .timeout(EXCHANGE_DEADLINE)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.redirect_url.as_str()),
            ])
            .send()
            .await
            .map_err(|e| OAuthError::Upstream(e.to_string()))?;

        let token: AccessTokenResponse = token_res
            .json()
            .await
            .map_err(|e| OAuthError::Upstream(e.to_string()))?;
        let access_token = token.access_token.ok_or_else(|| {
            OAuthError::Upstream(
                token
                    .error_description
                    .unwrap_or_else(|| "no access token in exchange response".to_string()),
            )
        })?;

        let user_res = self
            .http
            .get("https://api.github.com/user")
            .timeout(EXCHANGE_DEADLINE)
            .header(reqwest::header::USER_AGENT, "devsmith-rs")
            .bearer_auth(&access_token)
            .send()
            .await
            .map_err(|e| OAuthError::Upstream(e.to_string()))?;

        if !user_res.status().is_success() {
            return Err(OAuthError::Upstream(format!(
                "GitHub /user returned {}",
                user_res.status()
            )));
        }
        user_res
            .json()
            .await
            .map_err(|e| OAuthError::Upstream(e.to_string()))
    }
}

/// Creates or refreshes the local user row for a GitHub identity.
/// Returns the user id.
pub async fn upsert_user(pool: &SqlitePool, gh: &GitHubUser) -> Result<String, sqlx::Error> {
    let now = Utc::now();
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO users (id, github_id, username, email, avatar_url, created_at, last_login_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(github_id) DO UPDATE SET
            username = excluded.username,
            email = excluded.email,
            avatar_url = excluded.avatar_url,
            last_login_at = excluded.last_login_at",
    )
    .bind(&id)
    .bind(gh.id)
    .bind(&gh.login)
    .bind(&gh.email)
    .bind(&gh.avatar_url)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    // The upsert keeps the original id on conflict; read it back.
    let (user_id,): (String,) = sqlx::query_as("SELECT id FROM users WHERE github_id = ?")
        .bind(gh.id)
        .fetch_one(pool)
        .await?;
    Ok(user_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::kv::memory::MemoryKv;

    #[tokio::test]
    async fn state_is_single_use() {
        let kv = MemoryKv::new();
        let state = mint_state(&kv).await.unwrap();

        assert!(consume_state(&kv, &state).await.is_ok());
        // Replay of the same state must fail.
        assert!(matches!(
            consume_state(&kv, &state).await,
            Err(OAuthError::StateInvalid)
        ));
    }

    #[tokio::test]
    async fn expired_state_rejected() {
        let kv = MemoryKv::new();
        let state = mint_state(&kv).await.unwrap();
        kv.force_expire(&format!("oauth_state:{state}"));
        assert!(matches!(
            consume_state(&kv, &state).await,
            Err(OAuthError::StateInvalid)
        ));
    }

    #[tokio::test]
    async fn unknown_state_rejected() {
        let kv = MemoryKv::new();
        assert!(matches!(
            consume_state(&kv, "never-minted").await,
            Err(OAuthError::StateInvalid)
        ));
    }

    #[tokio::test]
    async fn user_upsert_keeps_identity() {
        let pool = crate::db::test_pool().await;
        let gh = GitHubUser {
            id: 42,
            login: "octocat".into(),
            email: Some("octo@example.com".into()),
            avatar_url: None,
        };
        let first = upsert_user(&pool, &gh).await.unwrap();

        let renamed = GitHubUser {
            id: 42,
            login: "octocat-renamed".into(),
            email: None,
            avatar_url: None,
        };
        let second = upsert_user(&pool, &renamed).await.unwrap();
        assert_eq!(first, second, "github_id keys the identity");

        let (username,): (String,) =
            sqlx::query_as("SELECT username FROM users WHERE github_id = 42")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(username, "octocat-renamed");
    }
}
