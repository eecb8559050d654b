//! Notification dispatch seam.
//!
//! Outbound delivery (email/SMS rendering and transport) is owned by the
//! notification service; this module only hands messages over HTTP. Every
//! caller in this crate treats delivery as best-effort: failures are logged,
//! never surfaced to the authenticating user.

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct NotificationRequest {
    pub recipient: String,
    pub template: String,
    pub params: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, request: NotificationRequest) -> Result<(), anyhow::Error>;
}

/// HTTP client for the notification service.
#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNotifier {
    pub fn new(base_url: &str, timeout_seconds: u64) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build notification client: {}", e))?;

        tracing::info!(base_url = %base_url, "Notification client configured");

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, request: NotificationRequest) -> Result<(), anyhow::Error> {
        let url = format!("{}/notifications", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Notification request failed: {}", e))?;

        if !response.status().is_success() {
            return Err(anyhow::anyhow!(
                "Notification service returned {}",
                response.status()
            ));
        }

        Ok(())
    }
}

/// Records notifications instead of sending them; used by tests.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: std::sync::Mutex<Vec<NotificationRequest>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, request: NotificationRequest) -> Result<(), anyhow::Error> {
        self.sent
            .lock()
            .map_err(|e| anyhow::anyhow!("Recording notifier mutex poisoned: {}", e))?
            .push(request);
        Ok(())
    }
}
