//! Server-side sessions. The opaque token is the only thing the browser
//! holds; all user data lives behind an O(1) key-value look-up with a
//! 7-day sliding TTL.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::kv::{Kv, KvError};

/// 7 days, extended on every validated use.
pub const SESSION_TTL_SECS: u64 = 7 * 24 * 60 * 60;
pub const SESSION_COOKIE: &str = "devsmith_session";

const SESSION_PREFIX: &str = "session:";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub github_username: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    kv: Arc<dyn Kv>,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv }
    }

    /// Mints a session and returns the opaque token (256 bits of randomness).
    pub async fn create(&self, user_id: &str, github_username: &str) -> Result<String, KvError> {
        let mut raw = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut raw);
        let token = URL_SAFE_NO_PAD.encode(raw);

        let session = Session {
            user_id: user_id.to_string(),
            github_username: github_username.to_string(),
            expires_at: Utc::now() + ChronoDuration::seconds(SESSION_TTL_SECS as i64),
        };
        let payload = serde_json::to_string(&session).expect("session serializes");
        self.kv
            .set_ex(&format!("{SESSION_PREFIX}{token}"), &payload, SESSION_TTL_SECS)
            .await?;
        Ok(token)
    }

    /// Looks up a session and slides its expiry forward. `None` means the
    /// token is unknown or expired — the caller treats both as logged out.
    pub async fn validate(&self, token: &str) -> Result<Option<Session>, KvError> {
        let key = format!("{SESSION_PREFIX}{token}");
        let Some(payload) = self.kv.get(&key).await? else {
            return Ok(None);
        };
        let Ok(mut session) = serde_json::from_str::<Session>(&payload) else {
            // Unparseable payload: treat as logged out and drop the key.
            self.kv.del(&key).await.ok();
            return Ok(None);
        };
        session.expires_at = Utc::now() + ChronoDuration::seconds(SESSION_TTL_SECS as i64);
        self.kv.expire(&key, SESSION_TTL_SECS).await?;
        Ok(Some(session))
    }

    pub async fn destroy(&self, token: &str) -> Result<(), KvError> {
        self.kv.del(&format!("{SESSION_PREFIX}{token}")).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::edge::kv::memory::MemoryKv;

    fn store() -> (SessionStore, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        (SessionStore::new(kv.clone()), kv)
    }

    #[tokio::test]
    async fn create_validate_destroy() {
        let (store, _) = store();
        let token = store.create("u-1", "octocat").await.unwrap();
        assert!(token.len() >= 43, "256 bits of randomness, base64url");

        let session = store.validate(&token).await.unwrap().expect("live session");
        assert_eq!(session.user_id, "u-1");
        assert_eq!(session.github_username, "octocat");

        store.destroy(&token).await.unwrap();
        assert!(store.validate(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_token_is_logged_out() {
        let (store, _) = store();
        assert!(store.validate("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_session_rejected() {
        let (store, kv) = store();
        let token = store.create("u-1", "octocat").await.unwrap();
        kv.force_expire(&format!("session:{token}"));
        assert!(store.validate(&token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tokens_are_unique() {
        let (store, _) = store();
        let a = store.create("u-1", "octocat").await.unwrap();
        let b = store.create("u-1", "octocat").await.unwrap();
        assert_ne!(a, b);
    }
}
