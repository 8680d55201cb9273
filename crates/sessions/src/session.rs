use std::time::Duration;

use {
    chrono::{DateTime, Utc},
    serde::{Deserialize, Serialize},
    tokio::time::Instant,
    tracing::debug,
};

use crate::status::{SessionStatus, TransitionError};

/// The single outstanding reconnection timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingReconnect {
    pub attempt: u32,
    pub delay_ms: u64,
    pub due_at: DateTime<Utc>,
}

/// Outcome of feeding a reported status into [`Session::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The status changed (or was refreshed) and observers should hear about it.
    Changed { from: SessionStatus },
    /// Repeated report of the current status; nothing to publish.
    Ignored,
}

/// The process-wide session record.
///
/// Owned by the session manager behind its lock, so every method here is
/// synchronous and assumes a single writer.
#[derive(Debug, Clone)]
pub struct Session {
    status: SessionStatus,
    identity: Option<String>,
    reconnect_attempts: u32,
    pending_reconnect: Option<PendingReconnect>,
    last_activity: Instant,
    last_activity_at: DateTime<Utc>,
    status_since: DateTime<Utc>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            status: SessionStatus::Uninitialized,
            identity: None,
            reconnect_attempts: 0,
            pending_reconnect: None,
            last_activity: Instant::now(),
            last_activity_at: now,
            status_since: now,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_ready(&self) -> bool {
        self.status == SessionStatus::Ready
    }

    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts
    }

    pub fn pending_reconnect(&self) -> Option<PendingReconnect> {
        self.pending_reconnect
    }

    pub fn last_activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }

    /// Time since the last recorded activity.
    pub fn idle(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Record traffic or a successful probe.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    /// Move to `to` if the lifecycle graph allows it.
    ///
    /// `identity` is kept only when entering `ready`. Entering `ready` also
    /// resets the reconnect counter.
    pub fn apply(
        &mut self,
        to: SessionStatus,
        identity: Option<String>,
    ) -> Result<Applied, TransitionError> {
        let from = self.status;
        if from == to && !from.can_transition_to(to) {
            debug!(status = %to, "ignoring repeated status report");
            return Ok(Applied::Ignored);
        }
        if !from.can_transition_to(to) {
            return Err(TransitionError { from, to });
        }

        self.status = to;
        self.status_since = Utc::now();
        self.touch();
        if to == SessionStatus::Ready {
            self.identity = identity;
            self.reconnect_attempts = 0;
        } else {
            self.identity = None;
        }
        Ok(Applied::Changed { from })
    }

    /// Count one more reconnection attempt and return it.
    ///
    /// Reaching `max_attempts` wraps the counter so the next attempt starts
    /// again from the base delay.
    pub fn next_reconnect_attempt(&mut self, max_attempts: u32) -> u32 {
        if self.reconnect_attempts >= max_attempts.max(1) {
            debug!(
                attempts = self.reconnect_attempts,
                "reconnect attempts exhausted, starting over"
            );
            self.reconnect_attempts = 0;
        }
        self.reconnect_attempts += 1;
        self.reconnect_attempts
    }

    pub fn reset_reconnect_attempts(&mut self) {
        self.reconnect_attempts = 0;
    }

    pub fn set_pending_reconnect(&mut self, pending: Option<PendingReconnect>) {
        self.pending_reconnect = pending;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            connected: self.is_ready(),
            identity: self.identity.clone(),
            reconnect_attempts: self.reconnect_attempts,
            last_activity_at: self.last_activity_at,
            status_since: self.status_since,
            pending_reconnect: self.pending_reconnect,
        }
    }
}

/// Point-in-time view served by `/status` and pushed to observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub connected: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    pub reconnect_attempts: u32,
    pub last_activity_at: DateTime<Utc>,
    pub status_since: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_reconnect: Option<PendingReconnect>,
}
