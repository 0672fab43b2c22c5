use axum::{
    routing::{delete, get, post, put},
    Router,
};
use std::{net::SocketAddr, str::FromStr, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod alert;
mod db;
mod edge;
mod insight;
mod jobs;
mod logger;
mod middleware;
mod pipeline;
mod query;
mod routes;
mod state;

use crate::alert::evaluator::AlertEngine;
use crate::alert::notify::{delivery_worker, SmtpSettings};
use crate::jobs::retention::RetentionSettings;
use crate::state::AppState;

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Initialize Tracing (Structured Logging)
    // Environment filter allows for granular control over log levels via RUST_LOG env var.
    // RUST_LOG wins; LOG_LEVEL is the per-service knob the deployment sets.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                match std::env::var("LOG_LEVEL") {
                    Ok(level) => tracing_subscriber::EnvFilter::new(level),
                    Err(_) => "devsmith_rs=debug,tower_http=debug".into(),
                }
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Load Environment Variables
    if dotenvy::dotenv().is_err() {
        tracing::warn!("No .env file found. Relying on system environment variables.");
    }

    // 3. Configure CORS
    // Reads from ALLOWED_ORIGINS env (comma-separated). Falls back to allow-all for local dev.
    let cors = match std::env::var("ALLOWED_ORIGINS") {
        Ok(origins) if !origins.trim().is_empty() => {
            let allowed: Vec<_> = origins
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();

            if allowed.is_empty() {
                tracing::warn!("CORS: ALLOWED_ORIGINS was set but no valid origins could be parsed — defaulting to permissive");
                CorsLayer::new()
                    .allow_origin(Any)
                    .allow_methods(Any)
                    .allow_headers(Any)
            } else {
                tracing::info!("CORS: Restricting to {} origin(s)", allowed.len());
                CorsLayer::new()
                    .allow_origin(allowed)
                    .allow_methods(Any)
                    .allow_headers(Any)
            }
        }
        _ => {
            tracing::warn!("CORS: No valid ALLOWED_ORIGINS set — defaulting to permissive (allow all) for dev mode");
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    };

    // 4. Root cancellation signal, wired to SIGINT/SIGTERM.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("🛑 Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    // 5. Initialize Global AppState (fatal on missing secrets).
    let (app_state, mut worker_handles) = AppState::new(shutdown_rx.clone()).await?;
    app_state.forwarder.log("INFO", "devsmith log platform starting");

    // 6. Alert engine + delivery worker.
    let (delivery_tx, delivery_rx) = mpsc::channel(256);
    worker_handles.push(tokio::spawn(delivery_worker(
        delivery_rx,
        SmtpSettings::from_env(),
        app_state.http_client.clone(),
        shutdown_rx.clone(),
    )));
    let engine = AlertEngine::new(
        app_state.pool.clone(),
        Duration::from_secs(env_or("ALERT_INTERVAL_SECS", 60)),
        env_or("ALERT_WINDOW_SECS", 60),
        env_or("RESPONSE_TIME_THRESHOLD_MS", 1000.0),
        delivery_tx,
    );
    worker_handles.push(tokio::spawn(engine.run(shutdown_rx.clone())));

    // 7. Background jobs: retention sweep and health refresh.
    let retention_settings = RetentionSettings {
        retention_days: env_or("ANALYSIS_RETENTION_DAYS", 14),
        log_retention_days: std::env::var("LOG_RETENTION_DAYS")
            .ok()
            .and_then(|raw| raw.parse().ok()),
        ..Default::default()
    };
    let retention_interval =
        Duration::from_secs(env_or("ANALYSIS_RETENTION_INTERVAL_HOURS", 24u64) * 3600);
    let retention_pool = app_state.pool.clone();
    worker_handles.push(jobs::spawn_job(
        "insight-retention",
        retention_interval,
        shutdown_rx.clone(),
        move || {
            let pool = retention_pool.clone();
            let settings = retention_settings.clone();
            async move { jobs::retention::sweep(&pool, &settings).await.map(|_| ()) }
        },
    ));
    let health_pool = app_state.pool.clone();
    worker_handles.push(jobs::spawn_job(
        "health-refresh",
        Duration::from_secs(60),
        shutdown_rx.clone(),
        move || {
            let pool = health_pool.clone();
            async move { jobs::health::refresh_service_health(&pool).await.map(|_| ()) }
        },
    ));

    // 8. Build Axum Router
    // Auth middleware applies to every read/admin surface; /ingest is gated
    // by network position and project state instead.
    let protected_routes = Router::new()
        .route("/logs", get(routes::logs::list_logs))
        .route("/stats", get(routes::logs::stats))
        .route("/tags", get(routes::logs::tags))
        .route("/logs/:id/tags", post(routes::logs::add_log_tag))
        .route("/logs/:id/tags/:tag", delete(routes::logs::remove_log_tag))
        .route(
            "/logs/:id/insights",
            get(routes::insights::get_insight).post(routes::insights::generate_insight),
        )
        .route("/dashboard", get(routes::dashboard::dashboard))
        .route("/dashboard/service", get(routes::dashboard::service_dashboard))
        .route("/dashboard/top-errors", get(routes::dashboard::top_errors))
        .route("/cache/invalidate", post(routes::dashboard::invalidate_cache))
        .route("/alerts", get(routes::alerts::open_alerts))
        .route("/alerts/configs", get(routes::alerts::configs))
        .route("/alerts/configs/:service", put(routes::alerts::put_config))
        .route(
            "/projects",
            get(routes::projects::list).post(routes::projects::create),
        )
        .route(
            "/projects/:id/regenerate-key",
            post(routes::projects::regenerate),
        )
        .route("/projects/:id", delete(routes::projects::remove))
        .route(
            "/llm/configs",
            get(routes::llm::list).post(routes::llm::create),
        )
        .route("/llm/configs/:id", delete(routes::llm::remove))
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::auth::require_auth,
        ));

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/ingest", post(routes::ingest::ingest))
        .route("/auth/login", get(routes::auth::login))
        .route("/auth/callback", get(routes::auth::callback))
        .route("/auth/logout", post(routes::auth::logout))
        .merge(protected_routes)
        .with_state(app_state.clone())
        .layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            middleware::metrics::record_request,
        ))
        // CORS must be the *outermost* layer so it runs first, before Auth
        .layer(cors);

    // 9. Start the Server
    let port = std::env::var("PORT").unwrap_or_else(|_| "8080".to_string());
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    tracing::info!("🚀 DevSmith log platform listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let mut server_shutdown = shutdown_rx.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = server_shutdown.changed().await;
    })
    .await?;

    // 10. Drain background workers, 30s budget, then force exit.
    tracing::info!("⏳ Draining background workers…");
    let drain = futures::future::join_all(worker_handles);
    if tokio::time::timeout(Duration::from_secs(30), drain).await.is_err() {
        tracing::warn!("⚠️ Drain exceeded 30s budget; exiting anyway");
    }
    tracing::info!("👋 DevSmith log platform stopped cleanly");

    Ok(())
}
