use std::time::Duration;

use log::{debug, warn};
use reqwest::Client;

/// Fire-and-forget webhook notifier for operational alerts. All failures
/// are demoted to warnings; alerting must never affect the pipeline.
pub struct AlertSender {
    client: Client,
    webhook_url: Option<String>,
}

impl AlertSender {
    pub fn new(webhook_url: Option<String>) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            client,
            webhook_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    pub async fn send(&self, message: &str) {
        let Some(url) = &self.webhook_url else {
            debug!("Alert webhook not configured, dropping: {}", message);
            return;
        };
        let payload = serde_json::json!({ "content": message });
        match self.client.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => warn!("Alert webhook returned HTTP {}", response.status()),
            Err(e) => warn!("Failed to deliver alert: {}", e),
        }
    }
}
