use {
    axum::{
        http::StatusCode,
        response::{IntoResponse, Json, Response},
    },
    thiserror::Error,
};

use {
    linkgate_channels::{AddressError, DriverError},
    linkgate_sessions::{PairingError, SessionStatus},
};

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("session not ready (status: {status})")]
    SessionNotReady { status: SessionStatus },

    #[error("delivery failed after {attempts} attempt(s): {error}")]
    TransientDelivery { error: DriverError, attempts: u32 },

    #[error("session unusable after {attempts} attempt(s): {error}")]
    SessionUnusable { error: DriverError, attempts: u32 },

    #[error("no session; start and pair the account first")]
    PairingRequired,

    #[error("driver failed to start: {0}")]
    DriverInitialization(DriverError),

    #[error("no pairing code available (status: {0})")]
    NoChallengeAvailable(SessionStatus),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("contact lookup failed: {0}")]
    ContactLookup(DriverError),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotReady { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::PairingRequired => StatusCode::CONFLICT,
            Self::NoChallengeAvailable(_) => StatusCode::NOT_FOUND,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::TransientDelivery { .. }
            | Self::SessionUnusable { .. }
            | Self::DriverInitialization(_)
            | Self::ContactLookup(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<AddressError> for GatewayError {
    fn from(err: AddressError) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

impl From<PairingError> for GatewayError {
    fn from(err: PairingError) -> Self {
        match err {
            PairingError::NoChallengeAvailable(status) => Self::NoChallengeAvailable(status),
            PairingError::Render(msg) => Self::Internal(msg),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));
        (self.status_code(), body).into_response()
    }
}

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;
