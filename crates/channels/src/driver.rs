use std::{path::PathBuf, sync::Arc};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::mpsc,
};

use crate::{address::DEFAULT_ADDRESS_SUFFIX, error::DriverError};

/// Sender half handed to a driver instance on start.
pub type EventSink = mpsc::UnboundedSender<DriverEvent>;

/// Everything a driver instance reports back to the session owner.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The network wants the account paired; `code` is the raw QR payload.
    PairingRequired { code: String },
    /// Credentials accepted (fresh scan or cached session).
    Authenticated,
    /// Fully operational. `identity` is the paired account, when known.
    Ready { identity: Option<String> },
    AuthFailed { reason: String },
    Disconnected { reason: String },
    Message(InboundMessage),
}

/// Connection state reported by a liveness probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LinkState {
    Connected,
    Opening,
    Conflict,
    Unpaired,
    Unlaunched,
    Disconnected,
}

impl LinkState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

/// A message received from the chat network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    pub id: String,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub body: String,
    /// Unix seconds, as stamped by the network.
    pub timestamp: i64,
    #[serde(default)]
    pub has_media: bool,
}

/// Media reference for outbound sends. The file is owned by the caller.
#[derive(Debug, Clone)]
pub struct MediaAttachment {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub caption: String,
}

/// Result of a contact lookup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactInfo {
    pub address: String,
    /// The contact is saved in the paired account's address book.
    pub is_known_contact: bool,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_name: Option<String>,
    #[serde(default)]
    pub is_group: bool,
}

/// One live channel session against the chat network.
///
/// Instances are single-use: after `shutdown` the owner creates a fresh one
/// through the [`DriverFactory`].
#[async_trait]
pub trait ChannelDriver: Send + Sync {
    /// Driver identifier (e.g. "loopback").
    fn id(&self) -> &str;

    /// Suffix appended to bare phone numbers to form a chat address.
    fn address_suffix(&self) -> &str {
        DEFAULT_ADDRESS_SUFFIX
    }

    /// Open the session. Lifecycle events are delivered through `events`
    /// for as long as the instance lives; this call may return before pairing
    /// completes.
    async fn start(&self, events: EventSink) -> Result<(), DriverError>;

    /// Tear the instance down. Cached credentials survive.
    async fn shutdown(&self) -> Result<(), DriverError>;

    /// Unlink the account and drop cached credentials.
    async fn logout(&self) -> Result<(), DriverError>;

    /// Lightweight liveness check.
    async fn probe(&self) -> Result<LinkState, DriverError>;

    /// Send a text message; returns the provider message id.
    async fn send_text(&self, to: &str, text: &str) -> Result<String, DriverError>;

    /// Send a media file with caption; returns the provider message id.
    async fn send_media(&self, to: &str, media: &MediaAttachment) -> Result<String, DriverError>;

    async fn contact(&self, address: &str) -> Result<ContactInfo, DriverError>;
}

/// Creates fresh driver instances for each session cycle.
pub trait DriverFactory: Send + Sync {
    fn id(&self) -> &str;

    fn create(&self) -> Arc<dyn ChannelDriver>;
}
