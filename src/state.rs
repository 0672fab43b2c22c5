use reqwest::Client;
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::edge::crypto::Envelope;
use crate::edge::jwt::JwtKeys;
use crate::edge::kv::{Kv, RedisKv};
use crate::edge::oauth::GitHubOAuth;
use crate::edge::session::SessionStore;
use crate::insight::breaker::BreakerRegistry;
use crate::insight::InsightService;
use crate::logger::{ForwarderSettings, LogForwarder};
use crate::query::cache::DashboardCache;

/// The global application state shared across all routes via Axum State.
pub struct AppState {
    /// Primary store pool (bounded; see db::init_db).
    pub pool: SqlitePool,

    /// Fast KV store handle (OAuth states live here directly).
    pub kv: Arc<dyn Kv>,

    /// Server-side sessions in the fast KV store.
    pub sessions: SessionStore,

    /// HS256 keys for service-to-service tokens.
    pub jwt: JwtKeys,

    /// Envelope encryption for stored provider credentials. Absent when no
    /// master key is configured; the credential endpoints refuse then.
    pub envelope: Option<Envelope>,

    /// GitHub OAuth settings; login is unavailable without them.
    pub oauth: Option<GitHubOAuth>,

    /// Shared HTTP client — one connection pool for OAuth, providers,
    /// webhooks and log forwarding.
    pub http_client: Client,

    /// Short-TTL dashboard cache.
    pub dashboard_cache: DashboardCache,

    /// AI insight service (breaker-wrapped provider access).
    pub insights: InsightService,

    /// Fire-and-forget forwarding of this service's own logs.
    pub forwarder: LogForwarder,

    /// This process's service identity (metrics, self-logs).
    pub service_name: String,
}

impl AppState {
    /// Reads configuration, connects the stores, and wires the shared
    /// services. Missing required secrets abort startup here — there are no
    /// insecure defaults to fall back to.
    pub async fn new(
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<(Arc<AppState>, Vec<JoinHandle<()>>)> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL environment variable is required"))?;
        let redis_url = std::env::var("REDIS_URL")
            .map_err(|_| anyhow::anyhow!("REDIS_URL environment variable is required"))?;
        let jwt_secret = std::env::var("JWT_SECRET")
            .map_err(|_| anyhow::anyhow!("JWT_SECRET environment variable is required (no default)"))?;

        let pool = crate::db::init_db(&database_url).await?;

        let redis_client = redis::Client::open(redis_url.as_str())?;
        let manager = redis::aio::ConnectionManager::new(redis_client).await?;
        let kv: Arc<dyn Kv> = Arc::new(RedisKv::new(manager));
        let sessions = SessionStore::new(kv.clone());

        let envelope = match std::env::var("DEVSMITH_MASTER_KEY") {
            Ok(encoded) => Some(Envelope::from_base64_key(&encoded).map_err(|e| {
                anyhow::anyhow!("DEVSMITH_MASTER_KEY is unusable: {e}")
            })?),
            Err(_) => {
                tracing::warn!("⚠️ DEVSMITH_MASTER_KEY not set — credential storage disabled");
                None
            }
        };

        // One client per process; reqwest pools connections internally.
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .pool_max_idle_per_host(20)
            .build()
            .expect("Failed to build HTTP client");

        let oauth = match (
            std::env::var("GITHUB_CLIENT_ID"),
            std::env::var("GITHUB_CLIENT_SECRET"),
            std::env::var("OAUTH_REDIRECT_URL"),
        ) {
            (Ok(id), Ok(secret), Ok(redirect)) => {
                Some(GitHubOAuth::new(id, secret, redirect, http_client.clone()))
            }
            _ => {
                tracing::warn!("⚠️ GitHub OAuth not configured — /auth/login unavailable");
                None
            }
        };

        let ollama_endpoint = std::env::var("OLLAMA_ENDPOINT")
            .unwrap_or_else(|_| "http://localhost:11434".to_string());
        let insights = InsightService::new(
            pool.clone(),
            http_client.clone(),
            BreakerRegistry::default(),
            envelope.clone(),
            ollama_endpoint,
        );

        let service_name =
            std::env::var("SERVICE_NAME").unwrap_or_else(|_| "logs".to_string());
        let (forwarder, forwarder_handle) = LogForwarder::start(
            ForwarderSettings::from_env(&service_name),
            http_client.clone(),
            shutdown,
        )?;

        let state = Arc::new(AppState {
            pool,
            kv,
            sessions,
            jwt: JwtKeys::new(&jwt_secret),
            envelope,
            oauth,
            http_client,
            dashboard_cache: DashboardCache::default(),
            insights,
            forwarder,
            service_name,
        });
        let handles = forwarder_handle.into_iter().collect();
        Ok((state, handles))
    }

    /// Writes an auth security violation into the pipeline without blocking
    /// the rejecting response.
    pub async fn record_security_violation(&self, path: &str) {
        let pool = self.pool.clone();
        let path = path.to_string();
        tokio::spawn(async move {
            let metadata = serde_json::json!({"path": path});
            let message = format!("unauthorized access attempt to {path}");
            if let Err(e) = crate::pipeline::persistence::insert_internal_log(
                &pool, "edge", "WARN", &message, metadata,
            )
            .await
            {
                tracing::debug!("Security violation log dropped: {}", e);
            }
        });
    }
}
