use std::fmt;

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

/// Lifecycle status of the channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Uninitialized,
    Initializing,
    QrPending,
    Authenticated,
    Ready,
    AuthFailed,
    Disconnected,
    Error,
    /// Manual stop. Absorbing until an explicit start.
    Stopped,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Initializing => "initializing",
            Self::QrPending => "qr_pending",
            Self::Authenticated => "authenticated",
            Self::Ready => "ready",
            Self::AuthFailed => "auth_failed",
            Self::Disconnected => "disconnected",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }

    /// End of a cycle that should hand over to the reconnection scheduler.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::AuthFailed | Self::Disconnected | Self::Error)
    }

    /// A cycle is under way; `start` is a no-op in these states.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Initializing | Self::QrPending | Self::Authenticated | Self::Ready
        )
    }

    /// The paired account no longer needs a pairing code.
    pub fn is_paired(self) -> bool {
        matches!(self, Self::Authenticated | Self::Ready)
    }

    /// Whether `self → to` is an edge of the lifecycle graph.
    ///
    /// Same-state edges are only meaningful for `qr_pending` (a refreshed
    /// challenge) and `error` (repeated startup failure).
    pub fn can_transition_to(self, to: Self) -> bool {
        use SessionStatus::*;

        match (self, to) {
            (Stopped, Stopped) => false,
            (_, Stopped) => true,
            (Uninitialized | Stopped | Disconnected | AuthFailed | Error, Initializing) => true,
            (
                Initializing,
                QrPending | Authenticated | Error | Disconnected | AuthFailed,
            ) => true,
            (QrPending, QrPending | Authenticated | Disconnected | AuthFailed) => true,
            (Authenticated, Ready | Disconnected | AuthFailed) => true,
            (Ready, Disconnected | AuthFailed) => true,
            (Error, Error) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transition that is not an edge of the lifecycle graph.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid session transition {from} -> {to}")]
pub struct TransitionError {
    pub from: SessionStatus,
    pub to: SessionStatus,
}
