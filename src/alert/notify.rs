//! Alert delivery: email (SMTP) and webhook notifiers behind one capability
//! trait, each attempt wrapped by the retry combinator. The evaluator only
//! enqueues; the delivery worker here owns all the slow I/O.

use async_trait::async_trait;
use lettre::{
    message::Mailbox,
    transport::smtp::AsyncSmtpTransportBuilder,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::retry::{with_retry, RetryError, RetryPolicy};
use super::AlertEvent;

/// One SMTP transaction may take this long before it counts as failed.
const SMTP_DEADLINE: Duration = Duration::from_secs(30);
/// Webhook POSTs are auxiliary calls; they get the short deadline.
const WEBHOOK_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("invalid notifier config: {0}")]
    InvalidConfig(String),
    #[error("delivery failed: {0}")]
    Send(String),
}

/// A fired alert plus its delivery targets, queued for the worker.
#[derive(Debug, Clone)]
pub struct DeliveryJob {
    pub alert: AlertEvent,
    pub email: Option<String>,
    pub webhook_url: Option<String>,
}

/// The JSON body webhooks receive.
#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    alert_type: &'a str,
    severity: &'a str,
    service: &'a str,
    message: &'a str,
    metric_value: f64,
    threshold: f64,
    occurrence_count: i64,
    triggered_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    fn kind(&self) -> &'static str;
    async fn deliver(&self, alert: &AlertEvent, recipient: &str) -> Result<(), NotifyError>;
}

/// SMTP relay settings, read once at startup. Absent host disables email.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl SmtpSettings {
    pub fn from_env() -> Option<Self> {
        let host = std::env::var("SMTP_HOST").ok()?;
        let port = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(587);
        let from = std::env::var("SMTP_FROM").ok()?;
        Some(Self {
            host,
            port,
            from,
            username: std::env::var("SMTP_USERNAME").ok(),
            password: std::env::var("SMTP_PASSWORD").ok(),
        })
    }
}

pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl EmailNotifier {
    pub fn new(settings: &SmtpSettings) -> Result<Self, NotifyError> {
        if settings.host.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("smtp host is empty".into()));
        }
        if settings.port == 0 {
            return Err(NotifyError::InvalidConfig("smtp port is zero".into()));
        }
        let from: Mailbox = settings
            .from
            .parse()
            .map_err(|_| NotifyError::InvalidConfig("smtp from address unparseable".into()))?;

        let mut builder: AsyncSmtpTransportBuilder =
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&settings.host)
                .port(settings.port)
                .timeout(Some(SMTP_DEADLINE));
        if let (Some(user), Some(pass)) = (&settings.username, &settings.password) {
            builder = builder.credentials(lettre::transport::smtp::authentication::Credentials::new(
                user.clone(),
                pass.clone(),
            ));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn kind(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, alert: &AlertEvent, recipient: &str) -> Result<(), NotifyError> {
        if recipient.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("empty email recipient".into()));
        }
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| NotifyError::InvalidConfig(format!("unparseable recipient '{recipient}'")))?;

        let subject = format!(
            "[{}] {} on {}",
            alert.severity.to_uppercase(),
            alert.alert_type,
            alert.service
        );
        let body = format!(
            "{}\n\nmetric: {:.2}\nthreshold: {:.2}\noccurrences: {}\ntriggered at: {}\n",
            alert.message,
            alert.metric_value,
            alert.threshold,
            alert.occurrence_count,
            alert.triggered_at.to_rfc3339()
        );
        let email = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject)
            .body(body)
            .map_err(|e| NotifyError::Send(e.to_string()))?;

        self.transport
            .send(email)
            .await
            .map(|_| ())
            .map_err(|e| NotifyError::Send(e.to_string()))
    }
}

pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn kind(&self) -> &'static str {
        "webhook"
    }

    async fn deliver(&self, alert: &AlertEvent, url: &str) -> Result<(), NotifyError> {
        if url.trim().is_empty() {
            return Err(NotifyError::InvalidConfig("empty webhook url".into()));
        }
        let payload = WebhookPayload {
            alert_type: &alert.alert_type,
            severity: &alert.severity,
            service: &alert.service,
            message: &alert.message,
            metric_value: alert.metric_value,
            threshold: alert.threshold,
            occurrence_count: alert.occurrence_count,
            triggered_at: alert.triggered_at,
        };
        let res = self
            .client
            .post(url)
            .timeout(WEBHOOK_DEADLINE)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::Send(e.to_string()))?;

        if !res.status().is_success() {
            return Err(NotifyError::Send(format!(
                "webhook returned {}",
                res.status()
            )));
        }
        Ok(())
    }
}

/// Drains the delivery queue. Every target gets its own retry envelope;
/// exhausted deliveries are logged and dropped — the next evaluator tick
/// re-fires if the condition still holds, so nothing is re-queued here.
pub async fn delivery_worker(
    mut rx: mpsc::Receiver<DeliveryJob>,
    smtp: Option<SmtpSettings>,
    http: reqwest::Client,
    shutdown: watch::Receiver<bool>,
) {
    let email = smtp.as_ref().and_then(|settings| match EmailNotifier::new(settings) {
        Ok(n) => Some(n),
        Err(e) => {
            tracing::warn!("⚠️ [Notify] Email disabled: {}", e);
            None
        }
    });
    let webhook = WebhookNotifier::new(http);
    let policy = RetryPolicy::default();
    let mut shutdown_rx = shutdown.clone();

    loop {
        let job = tokio::select! {
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        if let (Some(notifier), Some(recipient)) = (email.as_ref(), job.email.as_deref()) {
            dispatch(notifier, &job.alert, recipient, &policy, &shutdown).await;
        }
        if let Some(url) = job.webhook_url.as_deref() {
            dispatch(&webhook, &job.alert, url, &policy, &shutdown).await;
        }
    }
    tracing::info!("📪 [Notify] Delivery worker drained and stopped");
}

async fn dispatch(
    notifier: &dyn Notifier,
    alert: &AlertEvent,
    recipient: &str,
    policy: &RetryPolicy,
    cancel: &watch::Receiver<bool>,
) {
    match with_retry(policy, cancel, || notifier.deliver(alert, recipient)).await {
        Ok(()) => {
            tracing::info!(
                "📣 [Notify] Delivered {} alert for '{}' via {}",
                alert.alert_type,
                alert.service,
                notifier.kind()
            );
        }
        Err(RetryError::Cancelled) => {
            tracing::warn!("⚠️ [Notify] Delivery cancelled during shutdown");
        }
        Err(RetryError::Exhausted(e)) => {
            tracing::error!(
                "❌ [Notify] Dropping {} delivery for '{}' after retries: {}",
                notifier.kind(),
                alert.service,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_alert() -> AlertEvent {
        AlertEvent {
            id: "a-1".into(),
            alert_type: "error_rate_high".into(),
            severity: "warning".into(),
            service: "api".into(),
            message: "error rate above threshold".into(),
            metric_value: 7.5,
            threshold: 5.0,
            occurrence_count: 1,
            triggered_at: Utc::now(),
        }
    }

    #[test]
    fn email_rejects_empty_host() {
        let settings = SmtpSettings {
            host: "".into(),
            port: 587,
            from: "alerts@example.com".into(),
            username: None,
            password: None,
        };
        assert!(matches!(
            EmailNotifier::new(&settings),
            Err(NotifyError::InvalidConfig(_))
        ));
    }

    #[test]
    fn email_rejects_zero_port_and_bad_from() {
        let mut settings = SmtpSettings {
            host: "smtp.example.com".into(),
            port: 0,
            from: "alerts@example.com".into(),
            username: None,
            password: None,
        };
        assert!(EmailNotifier::new(&settings).is_err());

        settings.port = 587;
        settings.from = "not an address".into();
        assert!(EmailNotifier::new(&settings).is_err());
    }

    #[tokio::test]
    async fn email_rejects_empty_recipient() {
        let settings = SmtpSettings {
            host: "smtp.example.com".into(),
            port: 587,
            from: "alerts@example.com".into(),
            username: None,
            password: None,
        };
        let notifier = EmailNotifier::new(&settings).unwrap();
        assert!(matches!(
            notifier.deliver(&test_alert(), "").await,
            Err(NotifyError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn webhook_rejects_empty_url() {
        let notifier = WebhookNotifier::new(reqwest::Client::new());
        assert!(matches!(
            notifier.deliver(&test_alert(), "  ").await,
            Err(NotifyError::InvalidConfig(_))
        ));
    }
}
