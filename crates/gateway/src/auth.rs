use std::sync::Arc;

use {
    axum::{
        extract::{Request, State},
        http::{HeaderMap, header},
        middleware::Next,
        response::{IntoResponse, Json, Response},
    },
    secrecy::{ExposeSecret, Secret},
    tracing::debug,
};

use crate::state::GatewayState;

// ── Types ────────────────────────────────────────────────────────────────────

/// Resolved API auth configuration. No token means the API is open.
#[derive(Clone)]
pub struct ResolvedAuth {
    token: Option<Secret<String>>,
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedAuth")
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ResolvedAuth {
    pub fn is_enabled(&self) -> bool {
        self.token.is_some()
    }
}

/// Result of an authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    pub ok: bool,
    pub reason: Option<&'static str>,
}

/// Routes reachable without a token.
const PUBLIC_PATHS: &[&str] = &["/health", "/ping"];

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Constant-time string comparison (prevents timing attacks).
fn safe_equal(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let diff = a
        .as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    diff == 0
}

/// Token from `Authorization: Bearer ...` or a `token` query parameter.
fn provided_token<'a>(headers: &'a HeaderMap, query: Option<&'a str>) -> Option<&'a str> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    bearer.or_else(|| {
        query?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
    })
}

// ── Auth logic ───────────────────────────────────────────────────────────────

/// Resolve auth from the configured token. Blank tokens disable auth.
pub fn resolve_auth(token: Option<String>) -> ResolvedAuth {
    ResolvedAuth {
        token: token
            .filter(|t| !t.trim().is_empty())
            .map(Secret::new),
    }
}

pub fn authorize(auth: &ResolvedAuth, provided: Option<&str>) -> AuthResult {
    let Some(expected) = auth.token.as_ref() else {
        return AuthResult {
            ok: true,
            reason: None,
        };
    };
    let Some(given) = provided else {
        return AuthResult {
            ok: false,
            reason: Some("token_missing"),
        };
    };
    if !safe_equal(given, expected.expose_secret()) {
        return AuthResult {
            ok: false,
            reason: Some("token_mismatch"),
        };
    }
    AuthResult {
        ok: true,
        reason: None,
    }
}

/// Axum middleware guarding every route except [`PUBLIC_PATHS`].
pub async fn require_token(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    if !state.auth.is_enabled() || PUBLIC_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }
    let result = authorize(
        &state.auth,
        provided_token(req.headers(), req.uri().query()),
    );
    if !result.ok {
        debug!(path = %req.uri().path(), reason = ?result.reason, "rejected request");
        return (
            axum::http::StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "success": false, "error": "unauthorized" })),
        )
            .into_response();
    }
    next.run(req).await
}
