//! Forwards inbound chat messages to an HTTP webhook.

use std::{sync::Arc, time::Duration};

use {
    anyhow::{Context, Result, anyhow},
    reqwest::Client,
    serde::Serialize,
    tokio::task::JoinHandle,
    tracing::{debug, warn},
};

use {linkgate_channels::InboundMessage, linkgate_config::WebhookConfig};

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    message: &'a InboundMessage,
}

#[derive(Debug, Clone)]
pub struct WebhookForwarder {
    client: Client,
    url: String,
}

impl WebhookForwarder {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    /// `None` when no webhook URL is configured.
    pub fn from_config(config: &WebhookConfig) -> Result<Option<Self>> {
        match config.url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Ok(Some(Self::new(
                url,
                Duration::from_secs(config.timeout_secs.max(1)),
            )?)),
            _ => Ok(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// POST one message and wait for the receiver's answer.
    pub async fn deliver(&self, message: &InboundMessage) -> Result<()> {
        let payload = WebhookPayload {
            kind: "message",
            message,
        };
        let response = self
            .client
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .context("webhook request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("webhook responded {status}: {body}"));
        }
        debug!(id = %message.id, "message forwarded to webhook");
        Ok(())
    }

    /// Deliver in the background. Failures are logged and otherwise dropped.
    pub fn forward(self: &Arc<Self>, message: InboundMessage) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = this.deliver(&message).await {
                warn!(url = %this.url, id = %message.id, error = %e, "webhook delivery failed");
            }
        })
    }
}
