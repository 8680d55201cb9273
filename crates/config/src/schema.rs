//! Config schema: server surface, session lifecycle tuning, webhook target.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkgateConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub reconnect: ReconnectConfig,
    pub dispatch: DispatchConfig,
    pub health: HealthConfig,
    pub webhook: WebhookConfig,
    pub broadcast: BroadcastConfig,
    pub uploads: UploadsConfig,
}

/// HTTP/WebSocket listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Bearer token required on every route except `/health` and `/ping`.
    /// `LINKGATE_TOKEN` takes precedence when set.
    pub api_token: Option<String>,
    /// Largest accepted multipart upload, in bytes.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            api_token: None,
            max_upload_bytes: 16 * 1024 * 1024,
        }
    }
}

/// Which driver backs the session and how inbound traffic is filtered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Driver id. Only `"loopback"` ships in this workspace.
    pub driver: String,
    /// Start the session as soon as the server is listening.
    pub auto_start: bool,
    /// Inbound messages older than this are dropped.
    pub max_message_age_secs: u64,
    /// Loopback driver: delay between issuing the pairing code and pairing.
    pub loopback_pair_delay_ms: u64,
    /// Loopback driver: echo every outbound text back as an inbound message.
    pub loopback_echo: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            driver: "loopback".into(),
            auto_start: true,
            max_message_age_secs: 300,
            loopback_pair_delay_ms: 3_000,
            loopback_echo: false,
        }
    }
}

impl SessionConfig {
    pub fn max_message_age(&self) -> Duration {
        Duration::from_secs(self.max_message_age_secs)
    }

    pub fn loopback_pair_delay(&self) -> Duration {
        Duration::from_millis(self.loopback_pair_delay_ms)
    }
}

/// Exponential backoff for session recovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    /// Counter resets to zero once reached; retrying never stops.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            backoff_factor: 1.5,
            max_delay_ms: 300_000,
            max_attempts: 10,
        }
    }
}

/// Outbound retry envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub max_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay_ms: 3_000,
        }
    }
}

/// Periodic liveness checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub interval_secs: u64,
    /// No driver and idle this long: initialize.
    pub init_idle_secs: u64,
    /// Ready and idle this long: probe.
    pub probe_idle_secs: u64,
    /// Not ready and idle this long: force reconnection.
    pub stuck_idle_secs: u64,
    /// Keepalive probe cadence while ready. `0` disables it.
    pub keepalive_secs: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            init_idle_secs: 300,
            probe_idle_secs: 600,
            stuck_idle_secs: 1_800,
            keepalive_secs: 0,
        }
    }
}

/// Where inbound messages are POSTed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// `WEBHOOK_URL` takes precedence when set.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

/// Observer fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// Frames queued per observer before it is considered stalled and evicted.
    pub observer_buffer: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            observer_buffer: 256,
        }
    }
}

/// Temporary media uploads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadsConfig {
    pub dir: PathBuf,
    pub sweep_interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("uploads"),
            sweep_interval_secs: 86_400,
            max_age_secs: 86_400,
        }
    }
}

impl UploadsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

impl LinkgateConfig {
    /// Apply `WEBHOOK_URL` / `LINKGATE_TOKEN` style overrides.
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("WEBHOOK_URL").filter(|u| !u.is_empty()) {
            self.webhook.url = Some(url);
        }
        if let Some(token) = lookup("LINKGATE_TOKEN").filter(|t| !t.is_empty()) {
            self.server.api_token = Some(token);
        }
    }
}
