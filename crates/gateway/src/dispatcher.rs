//! Outbound delivery with a bounded retry budget.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tracing::{debug, info, warn},
};

use {
    linkgate_channels::{ChannelDriver, MediaAttachment, normalize_address},
    linkgate_config::DispatchConfig,
};

use crate::{
    error::{GatewayError, Result},
    manager::SessionManager,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub max_attempts: u32,
    /// Fixed wait between attempts.
    pub retry_delay: Duration,
}

impl From<&DispatchConfig> for DispatchPolicy {
    fn from(cfg: &DispatchConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            retry_delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self::from(&DispatchConfig::default())
    }
}

#[derive(Debug, Clone)]
pub enum OutboundPayload {
    Text(String),
    Media(MediaAttachment),
}

/// One send request and its retry bookkeeping. Lives for a single call.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub recipient: String,
    pub payload: OutboundPayload,
    pub attempt: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub message_id: String,
    pub recipient: String,
    pub attempts: u32,
}

impl SessionManager {
    pub async fn send_text(&self, recipient: &str, text: &str) -> Result<DeliveryReceipt> {
        if text.trim().is_empty() {
            return Err(GatewayError::InvalidRequest("message text is required".into()));
        }
        self.dispatch(recipient, OutboundPayload::Text(text.to_string()))
            .await
    }

    /// Send a media file. The file is removed afterwards, whatever happened.
    pub async fn send_media(
        &self,
        recipient: &str,
        media: MediaAttachment,
    ) -> Result<DeliveryReceipt> {
        let path = media.path.clone();
        let result = self.dispatch(recipient, OutboundPayload::Media(media)).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => debug!(path = %path.display(), "removed uploaded media"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!(path = %path.display(), error = %e, "failed to remove uploaded media"),
        }
        result
    }

    async fn dispatch(&self, recipient: &str, payload: OutboundPayload) -> Result<DeliveryReceipt> {
        let (_, driver) = self.ready_driver().await?;
        let recipient = normalize_address(recipient, driver.address_suffix())?;

        let _gate = self.send_gate.lock().await;

        let mut message = OutboundMessage {
            recipient,
            payload,
            attempt: 0,
            max_attempts: self.options.dispatch.max_attempts,
        };

        loop {
            // the session may have dropped while we waited to retry
            let (generation, driver) = self.ready_driver().await.inspect_err(|e| {
                if message.attempt > 0 {
                    warn!(
                        to = %message.recipient,
                        attempts = message.attempt,
                        error = %e,
                        "session lost between send attempts"
                    );
                }
            })?;
            message.attempt += 1;
            self.touch().await;

            let result = match &message.payload {
                OutboundPayload::Text(text) => driver.send_text(&message.recipient, text).await,
                OutboundPayload::Media(media) => {
                    driver.send_media(&message.recipient, media).await
                },
            };

            let error = match result {
                Ok(message_id) => {
                    info!(
                        to = %message.recipient,
                        attempts = message.attempt,
                        %message_id,
                        "message delivered"
                    );
                    return Ok(DeliveryReceipt {
                        message_id,
                        recipient: message.recipient,
                        attempts: message.attempt,
                    });
                },
                Err(e) => e,
            };

            if error.is_session_unusable() && !self.still_connected(&driver).await {
                warn!(
                    to = %message.recipient,
                    attempt = message.attempt,
                    error = %error,
                    "session unusable during send"
                );
                self.fail_and_reconnect(Some(generation), &error.to_string())
                    .await;
                return Err(GatewayError::SessionUnusable {
                    error,
                    attempts: message.attempt,
                });
            }

            if message.attempt >= message.max_attempts {
                warn!(
                    to = %message.recipient,
                    attempts = message.attempt,
                    error = %error,
                    "delivery failed"
                );
                return Err(GatewayError::TransientDelivery {
                    error,
                    attempts: message.attempt,
                });
            }

            warn!(
                to = %message.recipient,
                attempt = message.attempt,
                error = %error,
                "send failed, retrying"
            );
            tokio::time::sleep(self.options.dispatch.retry_delay).await;
        }
    }

    async fn still_connected(&self, driver: &Arc<dyn ChannelDriver>) -> bool {
        match driver.probe().await {
            Ok(state) => {
                debug!(?state, "liveness probe after send failure");
                state.is_connected()
            },
            Err(e) => {
                debug!(error = %e, "liveness probe failed");
                false
            },
        }
    }
}
