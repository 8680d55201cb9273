use thiserror::Error;

/// Error text fragments that automation drivers use when the underlying
/// connection or browser context is gone.
const UNUSABLE_MARKERS: &[&str] = &[
    "session closed",
    "browser has been closed",
    "target closed",
    "not connected",
    "protocol error",
];

/// Errors surfaced by a [`ChannelDriver`](crate::ChannelDriver).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("driver operation timed out: {0}")]
    Timeout(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("not connected")]
    NotConnected,

    #[error("driver initialization failed: {0}")]
    Initialization(String),

    #[error("contact not found: {0}")]
    ContactNotFound(String),

    #[error("{0}")]
    Other(String),
}

impl DriverError {
    /// Whether the error means the session itself is dead, as opposed to a
    /// single failed operation.
    pub fn is_session_unusable(&self) -> bool {
        match self {
            Self::SessionClosed(_) | Self::Protocol(_) | Self::NotConnected => true,
            Self::Other(msg) => {
                let msg = msg.to_lowercase();
                UNUSABLE_MARKERS.iter().any(|m| msg.contains(m))
            },
            Self::Timeout(_) | Self::Initialization(_) | Self::ContactNotFound(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_variants_classify() {
        assert!(DriverError::SessionClosed("page crashed".into()).is_session_unusable());
        assert!(DriverError::Protocol("Target.detach".into()).is_session_unusable());
        assert!(DriverError::NotConnected.is_session_unusable());
        assert!(!DriverError::Timeout("sendMessage".into()).is_session_unusable());
        assert!(!DriverError::ContactNotFound("1@c.us".into()).is_session_unusable());
    }

    #[test]
    fn free_text_errors_classify_by_marker() {
        assert!(
            DriverError::Other("Protocol error (Runtime.callFunctionOn): Session closed.".into())
                .is_session_unusable()
        );
        assert!(
            DriverError::Other("Navigation failed because browser has been closed".into())
                .is_session_unusable()
        );
        assert!(!DriverError::Other("rate limited".into()).is_session_unusable());
    }
}
