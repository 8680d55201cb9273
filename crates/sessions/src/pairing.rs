//! Pairing challenges: the one-time code a user scans to link the account.

use {
    base64::{Engine, engine::general_purpose::STANDARD},
    chrono::{DateTime, Utc},
    qrcode::{
        QrCode,
        render::{svg, unicode},
    },
    serde::{Deserialize, Serialize},
    thiserror::Error,
    tracing::debug,
};

use crate::status::SessionStatus;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("no pairing code available (status: {0})")]
    NoChallengeAvailable(SessionStatus),

    #[error("pairing code cannot be rendered: {0}")]
    Render(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingChallenge {
    pub id: String,
    /// Raw payload as issued by the network.
    pub code: String,
    /// `data:image/svg+xml;base64,...`
    pub image: String,
    pub issued_at: DateTime<Utc>,
    #[serde(default)]
    pub consumed: bool,
    #[serde(default)]
    pub synthetic: bool,
}

impl PairingChallenge {
    fn issue(code: String, synthetic: bool) -> Result<Self, PairingError> {
        let image = render_svg_data_url(&code)?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            image,
            issued_at: Utc::now(),
            consumed: false,
            synthetic,
        })
    }

    /// Raw SVG markup for serving as `image/svg+xml`.
    pub fn svg(&self) -> Result<String, PairingError> {
        render_svg(&self.code)
    }
}

/// Holds the latest challenge. Only the newest one is ever valid.
#[derive(Debug, Default)]
pub struct PairingManager {
    current: Option<PairingChallenge>,
}

impl PairingManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a challenge reported by the driver, superseding any earlier one.
    pub fn submit(&mut self, code: impl Into<String>) -> Result<&PairingChallenge, PairingError> {
        self.replace(PairingChallenge::issue(code.into(), false)?)
    }

    /// Diagnostic stand-in for when the driver cannot produce a code.
    pub fn placeholder(
        &mut self,
        text: impl Into<String>,
    ) -> Result<&PairingChallenge, PairingError> {
        self.replace(PairingChallenge::issue(text.into(), true)?)
    }

    fn replace(&mut self, challenge: PairingChallenge) -> Result<&PairingChallenge, PairingError> {
        if let Some(prev) = self.current.as_mut() {
            prev.consumed = true;
            debug!(id = %prev.id, "pairing code superseded");
        }
        Ok(&*self.current.insert(challenge))
    }

    /// Mark the live challenge used (the account authenticated).
    pub fn consume(&mut self) {
        if let Some(challenge) = self.current.as_mut() {
            challenge.consumed = true;
        }
    }

    pub fn clear(&mut self) {
        self.current = None;
    }

    /// The live challenge, if one is waiting to be scanned.
    pub fn pending(&self) -> Option<&PairingChallenge> {
        self.current.as_ref().filter(|c| !c.consumed)
    }

    /// The live challenge, or why there is none.
    pub fn current(&self, status: SessionStatus) -> Result<&PairingChallenge, PairingError> {
        if status.is_paired() {
            return Err(PairingError::NoChallengeAvailable(status));
        }
        self.pending()
            .ok_or(PairingError::NoChallengeAvailable(status))
    }
}

fn qr(code: &str) -> Result<QrCode, PairingError> {
    QrCode::new(code.as_bytes()).map_err(|e| PairingError::Render(e.to_string()))
}

pub fn render_svg(code: &str) -> Result<String, PairingError> {
    Ok(qr(code)?
        .render::<svg::Color>()
        .min_dimensions(256, 256)
        .build())
}

pub fn render_svg_data_url(code: &str) -> Result<String, PairingError> {
    let svg = render_svg(code)?;
    Ok(format!("data:image/svg+xml;base64,{}", STANDARD.encode(svg)))
}

/// Half-block rendering for terminals; light modules are drawn dark so the
/// code scans on a dark background.
pub fn render_terminal(code: &str) -> Result<String, PairingError> {
    Ok(qr(code)?
        .render::<unicode::Dense1x2>()
        .dark_color(unicode::Dense1x2::Light)
        .light_color(unicode::Dense1x2::Dark)
        .quiet_zone(true)
        .build())
}
