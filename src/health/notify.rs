use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::HealthConfig;
use crate::http_client;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Sends operator notifications. Delivery failures never propagate.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, content: &str);
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, title: &str, content: &str) {
        tracing::info!(title = %title, "{}", content);
    }
}

/// POSTs `{"title", "content"}` to a webhook.
pub struct WebhookNotifier {
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, content: &str) {
        let client = match http_client::client_for_url_with_timeout(&self.url, WEBHOOK_TIMEOUT) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!("Failed to build webhook client: {}", e);
                return;
            }
        };
        let body = serde_json::json!({ "title": title, "content": content });
        match client.post(&self.url).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                tracing::debug!(title = %title, "notification delivered");
            }
            Ok(resp) => {
                tracing::warn!(status = %resp.status(), "notification webhook rejected the message");
            }
            Err(e) => {
                tracing::error!("Failed to send notification: {}", e);
            }
        }
    }
}

pub fn notifier_from_config(config: &HealthConfig) -> Arc<dyn Notifier> {
    match config.notify_webhook_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Arc::new(WebhookNotifier::new(url)),
        _ => Arc::new(LogNotifier),
    }
}
