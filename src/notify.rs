//! Notification sink for run summaries and failures.
//!
//! Delivery is fire-and-forget: a notifier never returns an error, and an
//! unconfigured sink is a silent no-op.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Severity marker prefixed to each notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
    Info,
}

impl Severity {
    pub fn emoji(self) -> &'static str {
        match self {
            Self::Success => "✅",
            Self::Error => "❌",
            Self::Info => "ℹ️",
        }
    }
}

/// One-line notification text as delivered to the sink.
pub fn format_message(severity: Severity, message: &str) -> String {
    format!("{} [CleanMail] {message}", severity.emoji())
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, severity: Severity, message: &str);
}

/// Drops every notification.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        debug!(?severity, message, "Notification sink not configured");
    }
}

/// Deadline for one webhook delivery.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts `{"text": ...}` to a chat webhook (Google Chat incoming webhook format).
///
/// Delivery runs on its own task, so `notify` returns before the webhook
/// answers.
pub struct WebhookNotifier {
    url: SecretString,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: SecretString) -> Self {
        Self::with_timeout(url, WEBHOOK_TIMEOUT)
    }

    pub fn with_timeout(url: SecretString, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { url, client }
    }

    /// Start delivering one message and hand back the delivery task.
    pub fn dispatch(&self, severity: Severity, message: &str) -> JoinHandle<()> {
        let body = serde_json::json!({ "text": format_message(severity, message) });
        let request = self.client.post(self.url.expose_secret()).json(&body);

        tokio::spawn(async move {
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(?severity, "Notification delivered");
                }
                Ok(resp) => {
                    warn!(status = resp.status().as_u16(), "Notification webhook rejected message");
                }
                Err(e) => {
                    warn!(error = %e, "Notification webhook unreachable");
                }
            }
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        drop(self.dispatch(severity, message));
    }
}

/// Keeps notifications in memory; used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryNotifier {
    sent: Arc<Mutex<Vec<(Severity, String)>>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything received so far, oldest first.
    pub fn sent(&self) -> Vec<(Severity, String)> {
        match self.sent.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait]
impl Notifier for MemoryNotifier {
    async fn notify(&self, severity: Severity, message: &str) {
        let mut guard = match self.sent.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.push((severity, message.to_string()));
    }
}

/// Webhook notifier when a URL is configured, otherwise a no-op.
pub fn notifier_from_config(webhook_url: Option<SecretString>) -> Arc<dyn Notifier> {
    match webhook_url {
        Some(url) if !url.expose_secret().trim().is_empty() => Arc::new(WebhookNotifier::new(url)),
        _ => Arc::new(NoopNotifier),
    }
}
