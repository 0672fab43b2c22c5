//! Fire-and-forget log forwarding into the ingestion pipeline.
//!
//! Producers never block: entries go over a bounded channel to a batching
//! worker that POSTs to `LOGS_URL`. A failed send re-buffers the batch once;
//! a second failure drops it with a stderr fallback. The forwarder refuses
//! to forward for the `logs` service itself, which breaks the self-ingestion
//! loop at the producer.

use chrono::Utc;
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Flush when this many entries are buffered…
const MAX_BATCH: usize = 100;
/// …or when the oldest buffered entry is this old.
const MAX_LATENCY: Duration = Duration::from_secs(5);
/// Forwarding is an auxiliary call; it gets the short deadline.
const SEND_DEADLINE: Duration = Duration::from_secs(2);
const QUEUE_DEPTH: usize = 1024;

#[derive(Debug, Clone, Serialize)]
pub struct ForwardEntry {
    pub timestamp: String,
    pub level: String,
    pub message: String,
    pub service_name: String,
}

#[derive(Debug, Clone)]
pub struct ForwarderSettings {
    pub logs_url: Option<String>,
    pub service: String,
    pub strict: bool,
}

impl ForwarderSettings {
    pub fn from_env(service: &str) -> Self {
        Self {
            logs_url: std::env::var("LOGS_URL").ok().filter(|s| !s.trim().is_empty()),
            service: service.to_string(),
            strict: std::env::var("LOGS_STRICT")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(true),
        }
    }
}

/// The source service the pipeline itself logs as. Forwarding it would feed
/// the pipeline its own output.
fn is_loop_source(service: &str) -> bool {
    service == "logs"
}

#[derive(Clone)]
pub struct LogForwarder {
    tx: Option<mpsc::Sender<ForwardEntry>>,
    service: String,
}

impl LogForwarder {
    /// Disabled forwarder: `log` becomes a no-op. Used when no `LOGS_URL`
    /// is configured (and `LOGS_STRICT=false` tolerates that).
    pub fn disabled(service: &str) -> Self {
        Self {
            tx: None,
            service: service.to_string(),
        }
    }

    /// Builds the forwarder and its batching worker. Fails only when the
    /// URL is invalid and strict mode demands one.
    pub fn start(
        settings: ForwarderSettings,
        http: reqwest::Client,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<(Self, Option<JoinHandle<()>>)> {
        let url = match settings.logs_url.as_deref() {
            Some(raw) => match reqwest::Url::parse(raw) {
                Ok(url) => url,
                Err(e) if settings.strict => {
                    anyhow::bail!("LOGS_URL '{raw}' is invalid: {e}");
                }
                Err(e) => {
                    tracing::warn!("⚠️ [Forwarder] LOGS_URL invalid ({}); forwarding disabled", e);
                    return Ok((Self::disabled(&settings.service), None));
                }
            },
            None => {
                tracing::warn!("⚠️ [Forwarder] No LOGS_URL set; forwarding disabled");
                return Ok((Self::disabled(&settings.service), None));
            }
        };

        if is_loop_source(&settings.service) {
            tracing::info!("🔁 [Forwarder] Source '{}' never forwards (loop break)", settings.service);
            return Ok((Self::disabled(&settings.service), None));
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let service = settings.service.clone();
        let handle = tokio::spawn(batch_worker(rx, url, service.clone(), http, shutdown));
        Ok((
            Self {
                tx: Some(tx),
                service,
            },
            Some(handle),
        ))
    }

    /// Enqueues one entry. Never blocks; a full queue drops the entry with
    /// a local fallback line.
    pub fn log(&self, level: &str, message: &str) {
        let Some(tx) = &self.tx else { return };
        let entry = ForwardEntry {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            message: message.to_string(),
            service_name: self.service.clone(),
        };
        if tx.try_send(entry).is_err() {
            eprintln!("[forwarder] queue full, dropped {level} log from {}", self.service);
        }
    }
}

fn build_payload(service: &str, entries: &[ForwardEntry]) -> serde_json::Value {
    serde_json::json!({
        "project_slug": service,
        "logs": entries,
    })
}

async fn batch_worker(
    mut rx: mpsc::Receiver<ForwardEntry>,
    url: reqwest::Url,
    service: String,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buffer: Vec<ForwardEntry> = Vec::with_capacity(MAX_BATCH);
    let mut retried = false;
    // Anchored to the oldest buffered entry so a steady trickle cannot
    // defer the flush forever.
    let mut flush_at: Option<tokio::time::Instant> = None;

    loop {
        tokio::select! {
            entry = rx.recv() => {
                match entry {
                    Some(entry) => {
                        if buffer.is_empty() {
                            flush_at = Some(tokio::time::Instant::now() + MAX_LATENCY);
                        }
                        buffer.push(entry);
                        if buffer.len() >= MAX_BATCH {
                            flush(&http, &url, &service, &mut buffer, &mut retried).await;
                            flush_at = (!buffer.is_empty())
                                .then(|| tokio::time::Instant::now() + MAX_LATENCY);
                        }
                    }
                    None => break,
                }
            }
            _ = async { tokio::time::sleep_until(flush_at.unwrap()).await }, if flush_at.is_some() => {
                flush(&http, &url, &service, &mut buffer, &mut retried).await;
                flush_at = (!buffer.is_empty())
                    .then(|| tokio::time::Instant::now() + MAX_LATENCY);
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Graceful close: drain whatever is queued, then one final flush.
    while let Ok(entry) = rx.try_recv() {
        buffer.push(entry);
    }
    if !buffer.is_empty() {
        flush(&http, &url, &service, &mut buffer, &mut retried).await;
        if !buffer.is_empty() {
            eprintln!("[forwarder] dropping {} logs at shutdown", buffer.len());
        }
    }
}

/// One delivery attempt. On failure the batch stays buffered once; a second
/// consecutive failure drops it so the producer side can never back up.
async fn flush(
    http: &reqwest::Client,
    url: &reqwest::Url,
    service: &str,
    buffer: &mut Vec<ForwardEntry>,
    retried: &mut bool,
) {
    if buffer.is_empty() {
        return;
    }
    let payload = build_payload(service, buffer);
    let result = http
        .post(url.clone())
        .timeout(SEND_DEADLINE)
        .json(&payload)
        .send()
        .await;

    match result {
        Ok(res) if res.status().is_success() => {
            buffer.clear();
            *retried = false;
        }
        Ok(res) => handle_failure(buffer, retried, format!("ingest returned {}", res.status())),
        Err(e) => handle_failure(buffer, retried, e.to_string()),
    }
}

fn handle_failure(buffer: &mut Vec<ForwardEntry>, retried: &mut bool, reason: String) {
    if *retried {
        eprintln!("[forwarder] dropping {} logs after retry: {reason}", buffer.len());
        buffer.clear();
        *retried = false;
    } else {
        // Keep the batch for one more flush cycle.
        *retried = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loop_source_is_never_forwarded() {
        assert!(is_loop_source("logs"));
        assert!(!is_loop_source("portal"));
    }

    #[test]
    fn disabled_forwarder_is_a_noop() {
        let forwarder = LogForwarder::disabled("portal");
        forwarder.log("INFO", "goes nowhere");
    }

    #[test]
    fn payload_matches_ingest_wire_format() {
        let entries = vec![ForwardEntry {
            timestamp: "2025-01-02T03:04:05Z".into(),
            level: "INFO".into(),
            message: "started".into(),
            service_name: "portal".into(),
        }];
        let payload = build_payload("portal", &entries);
        assert_eq!(payload["project_slug"], "portal");
        assert_eq!(payload["logs"][0]["level"], "INFO");
        assert_eq!(payload["logs"][0]["service_name"], "portal");
    }

    #[test]
    fn second_failure_drops_the_batch() {
        let mut buffer = vec![ForwardEntry {
            timestamp: "t".into(),
            level: "INFO".into(),
            message: "m".into(),
            service_name: "portal".into(),
        }];
        let mut retried = false;

        handle_failure(&mut buffer, &mut retried, "down".into());
        assert_eq!(buffer.len(), 1, "first failure re-buffers");
        assert!(retried);

        handle_failure(&mut buffer, &mut retried, "still down".into());
        assert!(buffer.is_empty(), "second failure drops");
        assert!(!retried);
    }

    #[tokio::test]
    async fn strict_mode_rejects_invalid_url() {
        let (_tx, shutdown) = watch::channel(false);
        let settings = ForwarderSettings {
            logs_url: Some("not a url".into()),
            service: "portal".into(),
            strict: true,
        };
        assert!(LogForwarder::start(settings, reqwest::Client::new(), shutdown).is_err());

        let (_tx, shutdown) = watch::channel(false);
        let settings = ForwarderSettings {
            logs_url: None,
            service: "portal".into(),
            strict: true,
        };
        let (_, handle) =
            LogForwarder::start(settings, reqwest::Client::new(), shutdown).unwrap();
        assert!(handle.is_none(), "missing URL disables rather than fails");
    }

    #[tokio::test]
    async fn lax_mode_disables_on_bad_url() {
        let (_tx, shutdown) = watch::channel(false);
        let settings = ForwarderSettings {
            logs_url: Some("not a url".into()),
            service: "portal".into(),
            strict: false,
        };
        let (forwarder, handle) =
            LogForwarder::start(settings, reqwest::Client::new(), shutdown).unwrap();
        assert!(handle.is_none());
        forwarder.log("INFO", "dropped silently");
    }
}
