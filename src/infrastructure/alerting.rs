use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use strum_macros::Display;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    /// Worker that raised the alert, e.g. `outbox-processor`.
    pub source: String,
    pub title: String,
    pub details: serde_json::Value,
    pub raised_at: DateTime<Utc>,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        source: impl Into<String>,
        title: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            severity,
            source: source.into(),
            title: title.into(),
            details,
            raised_at: Utc::now(),
        }
    }

    /// Plain-text rendering for chat channels.
    pub fn render_text(&self) -> String {
        let details = serde_json::to_string_pretty(&self.details).unwrap_or_default();
        format!(
            "[{}] {} ({})\n{}",
            self.severity.to_string().to_uppercase(),
            self.title,
            self.source,
            details
        )
    }
}

/// Destination for operator alerts raised by the background workers.
#[async_trait]
pub trait AlertPort: Send + Sync {
    async fn send(&self, alert: Alert) -> Result<()>;
}

/// Sends `alert`, logging instead of failing. Workers must keep running when
/// the alert channel itself is down.
pub async fn raise(port: &dyn AlertPort, alert: Alert) {
    let title = alert.title.clone();
    if let Err(e) = port.send(alert).await {
        error!(title = %title, error = %e, "Failed to deliver alert");
    }
}

/// Writes alerts to the log only. Used when no webhook is configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingAlertPort;

#[async_trait]
impl AlertPort for LoggingAlertPort {
    async fn send(&self, alert: Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Critical => error!(
                source = %alert.source,
                details = %alert.details,
                "ALERT: {}",
                alert.title
            ),
            AlertSeverity::Warning => warn!(
                source = %alert.source,
                details = %alert.details,
                "ALERT: {}",
                alert.title
            ),
            AlertSeverity::Info => info!(
                source = %alert.source,
                details = %alert.details,
                "ALERT: {}",
                alert.title
            ),
        }
        Ok(())
    }
}

/// Posts alerts to an incoming-webhook URL of a chat channel.
pub struct WebhookAlertPort {
    http_client: reqwest::Client,
    webhook_url: String,
}

impl WebhookAlertPort {
    pub fn new(webhook_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to create alert webhook HTTP client")?;
        Ok(Self {
            http_client,
            webhook_url: webhook_url.into(),
        })
    }
}

#[async_trait]
impl AlertPort for WebhookAlertPort {
    async fn send(&self, alert: Alert) -> Result<()> {
        let body = serde_json::json!({
            "text": alert.render_text(),
            "alert": alert,
        });
        let response = self
            .http_client
            .post(&self.webhook_url)
            .json(&body)
            .send()
            .await
            .context("Alert webhook request failed")?;
        if !response.status().is_success() {
            anyhow::bail!("Alert webhook returned {}", response.status());
        }
        Ok(())
    }
}

/// Delivers to every port; succeeds if at least one delivery succeeded.
pub struct FanoutAlertPort {
    ports: Vec<Arc<dyn AlertPort>>,
}

impl FanoutAlertPort {
    pub fn new(ports: Vec<Arc<dyn AlertPort>>) -> Self {
        Self { ports }
    }
}

#[async_trait]
impl AlertPort for FanoutAlertPort {
    async fn send(&self, alert: Alert) -> Result<()> {
        let mut delivered = 0;
        let mut last_error = None;
        for port in &self.ports {
            match port.send(alert.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!(error = %e, "Alert delivery to one channel failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if delivered == 0 => Err(e),
            _ => Ok(()),
        }
    }
}
