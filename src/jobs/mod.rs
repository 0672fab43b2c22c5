//! Background job supervision. Each job is a `(name, interval, body)`
//! triple spawned on its own long-lived worker; all of them share the root
//! shutdown signal and exit within one tick of it flipping.

pub mod health;
pub mod retention;

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub fn spawn_job<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    body: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tracing::info!("🧹 [Jobs] '{}' scheduled every {:?}", name, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = body().await {
                        tracing::error!("❌ [Jobs] '{}' tick failed: {}", name, e);
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("⏹️ [Jobs] '{}' stopping", name);
                        break;
                    }
                }
            }
        }
    })
}
