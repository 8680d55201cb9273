use std::{net::SocketAddr, sync::Arc, time::Duration};

use {
    axum::{
        Router,
        extract::{
            ConnectInfo, DefaultBodyLimit, Multipart, Path as UrlPath, Query, State,
            WebSocketUpgrade,
            multipart::{MultipartError, MultipartRejection},
            rejection::JsonRejection,
        },
        http::header,
        middleware,
        response::{IntoResponse, Json},
        routing::{get, post},
    },
    chrono::Utc,
    serde::{Deserialize, Serialize},
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        cors::{Any, CorsLayer},
        limit::RequestBodyLimitLayer,
        trace::TraceLayer,
    },
    tracing::{info, warn},
};

use {
    linkgate_channels::{ContactInfo, DriverFactory, LoopbackFactory, MediaAttachment},
    linkgate_config::LinkgateConfig,
    linkgate_sessions::{PairingChallenge, SessionStatus},
};

use crate::{
    auth,
    dispatcher::DeliveryReceipt,
    error::{GatewayError, Result},
    health::{HealthPolicy, spawn_health_monitor},
    manager::{HealthReport, KeywordMatch, ManagerOptions, SessionManager},
    state::GatewayState,
    uploads::{spawn_upload_janitor, store_upload},
    webhook::WebhookForwarder,
    ws::handle_connection,
};

type AppState = Arc<GatewayState>;

// ── Server startup ───────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
pub fn build_gateway_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);
    // multipart framing on top of the file itself
    let body_limit = state.max_upload_bytes.saturating_add(64 * 1024);

    Router::new()
        .route("/status", get(status_handler))
        .route("/start", get(start_handler).post(start_handler))
        .route("/logout", post(logout_handler))
        .route("/restart", post(restart_handler))
        .route("/qr", get(qr_handler))
        .route("/qr-image", get(qr_image_handler))
        .route("/generate-test-qr", get(test_qr_handler))
        .route("/send", post(send_handler))
        .route("/send-image", post(send_image_handler))
        .route("/contact-info/{address}", get(contact_info_handler))
        .route("/check-keyword/{address}", get(check_keyword_handler))
        .route("/health", get(health_handler))
        .route("/ping", get(ping_handler))
        .route("/ws", get(ws_upgrade_handler))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::require_token,
        ))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new())
        .with_state(state)
}

/// Pick the channel driver named by `session.driver`.
pub fn driver_factory(config: &LinkgateConfig) -> anyhow::Result<Arc<dyn DriverFactory>> {
    match config.session.driver.as_str() {
        "loopback" => Ok(Arc::new(
            LoopbackFactory::new(config.session.loopback_pair_delay())
                .with_echo(config.session.loopback_echo),
        )),
        other => anyhow::bail!("unknown channel driver '{other}' (available: loopback)"),
    }
}

/// Start the gateway HTTP + WebSocket server and its background monitors.
/// Returns after a shutdown signal, once the session has been stopped.
pub async fn start_gateway(
    config: LinkgateConfig,
    factory: Arc<dyn DriverFactory>,
) -> anyhow::Result<()> {
    let resolved_auth = auth::resolve_auth(config.server.api_token.clone());
    let webhook = WebhookForwarder::from_config(&config.webhook)?;
    let webhook_url = webhook.as_ref().map(|w| w.url().to_string());

    let manager = SessionManager::new(factory, ManagerOptions::from_config(&config), webhook);
    let state = GatewayState::new(Arc::clone(&manager), resolved_auth, &config);
    let app = build_gateway_app(Arc::clone(&state));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    // Startup banner.
    let lines = [
        format!("linkgate v{}", state.version),
        format!("listening on {}", listener.local_addr()?),
        format!("driver: {}", manager.driver_id()),
        format!(
            "auth: {}",
            if state.auth.is_enabled() {
                "token"
            } else {
                "open"
            }
        ),
        format!("webhook: {}", webhook_url.as_deref().unwrap_or("disabled")),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let cancel = CancellationToken::new();
    let monitor = spawn_health_monitor(
        Arc::clone(&manager),
        HealthPolicy::from(&config.health),
        cancel.child_token(),
    );
    let janitor = spawn_upload_janitor(
        config.uploads.dir.clone(),
        config.uploads.sweep_interval(),
        config.uploads.max_age(),
        cancel.child_token(),
    );

    if config.session.auto_start {
        manager.start().await;
    }

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down");
    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = monitor.await;
        let _ = janitor.await;
    })
    .await;
    manager.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

// ── Session control ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct StatusReply {
    success: bool,
    status: SessionStatus,
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.snapshot().await)
}

async fn start_handler(State(state): State<AppState>) -> Json<StatusReply> {
    let snapshot = state.manager.start().await;
    Json(StatusReply {
        success: true,
        status: snapshot.status,
    })
}

async fn logout_handler(State(state): State<AppState>) -> Json<StatusReply> {
    let snapshot = state.manager.logout().await;
    Json(StatusReply {
        success: true,
        status: snapshot.status,
    })
}

async fn restart_handler(State(state): State<AppState>) -> Json<StatusReply> {
    let snapshot = state.manager.restart().await;
    Json(StatusReply {
        success: true,
        status: snapshot.status,
    })
}

// ── Pairing ─────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChallengeReply {
    success: bool,
    #[serde(flatten)]
    challenge: PairingChallenge,
}

async fn qr_handler(State(state): State<AppState>) -> Result<Json<ChallengeReply>> {
    let challenge = state.manager.current_challenge().await?;
    Ok(Json(ChallengeReply {
        success: true,
        challenge,
    }))
}

async fn qr_image_handler(State(state): State<AppState>) -> Result<impl IntoResponse> {
    let svg = state.manager.current_challenge().await?.svg()?;
    Ok(([(header::CONTENT_TYPE, "image/svg+xml")], svg))
}

async fn test_qr_handler(State(state): State<AppState>) -> Result<Json<ChallengeReply>> {
    let challenge = state.manager.generate_test_challenge().await?;
    Ok(Json(ChallengeReply {
        success: true,
        challenge,
    }))
}

// ── Outbound ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SendRequest {
    #[serde(alias = "jid")]
    recipient: String,
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendReply {
    success: bool,
    #[serde(flatten)]
    receipt: DeliveryReceipt,
}

async fn send_handler(
    State(state): State<AppState>,
    body: std::result::Result<Json<SendRequest>, JsonRejection>,
) -> Result<Json<SendReply>> {
    let Json(req) = body.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let receipt = state.manager.send_text(&req.recipient, &req.text).await?;
    Ok(Json(SendReply {
        success: true,
        receipt,
    }))
}

async fn send_image_handler(
    State(state): State<AppState>,
    multipart: std::result::Result<Multipart, MultipartRejection>,
) -> Result<Json<SendReply>> {
    let mut multipart = multipart.map_err(|e| GatewayError::InvalidRequest(e.body_text()))?;
    let mut recipient = None;
    let mut caption = String::new();
    let mut upload = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| GatewayError::InvalidRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "recipient" | "jid" => {
                recipient = Some(field.text().await.map_err(bad_multipart)?);
            },
            "caption" => caption = field.text().await.map_err(bad_multipart)?,
            "file" => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let mime_type = field.content_type().map(str::to_string);
                let bytes = field.bytes().await.map_err(bad_multipart)?;
                if bytes.len() > state.max_upload_bytes {
                    return Err(GatewayError::InvalidRequest(format!(
                        "file exceeds {} bytes",
                        state.max_upload_bytes
                    )));
                }
                upload = Some((file_name, mime_type, bytes));
            },
            _ => {},
        }
    }

    let Some((file_name, mime_type, bytes)) = upload else {
        return Err(GatewayError::InvalidRequest("file is required".into()));
    };
    let Some(recipient) = recipient.filter(|r| !r.trim().is_empty()) else {
        return Err(GatewayError::InvalidRequest("recipient is required".into()));
    };

    let path = store_upload(&state.uploads.dir, &file_name, &bytes).await?;
    let media = MediaAttachment {
        path,
        file_name,
        mime_type,
        caption,
    };
    let receipt = state.manager.send_media(&recipient, media).await?;
    Ok(Json(SendReply {
        success: true,
        receipt,
    }))
}

fn bad_multipart(e: MultipartError) -> GatewayError {
    GatewayError::InvalidRequest(e.body_text())
}

// ── Contacts ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ContactReply {
    success: bool,
    #[serde(flatten)]
    contact: ContactInfo,
}

async fn contact_info_handler(
    State(state): State<AppState>,
    UrlPath(address): UrlPath<String>,
) -> Result<Json<ContactReply>> {
    let contact = state.manager.contact_info(&address).await?;
    Ok(Json(ContactReply {
        success: true,
        contact,
    }))
}

#[derive(Debug, Deserialize)]
struct KeywordQuery {
    #[serde(default)]
    keyword: String,
}

#[derive(Debug, Serialize)]
struct KeywordReply {
    success: bool,
    #[serde(flatten)]
    result: KeywordMatch,
}

async fn check_keyword_handler(
    State(state): State<AppState>,
    UrlPath(address): UrlPath<String>,
    Query(query): Query<KeywordQuery>,
) -> Result<Json<KeywordReply>> {
    let result = state.manager.check_keyword(&address, &query.keyword).await?;
    Ok(Json(KeywordReply {
        success: true,
        result,
    }))
}

// ── Liveness ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthReply {
    version: String,
    #[serde(flatten)]
    report: HealthReport,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthReply> {
    Json(HealthReply {
        version: state.version.clone(),
        report: state.manager.health_report().await,
    })
}

async fn ping_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.touch().await;
    Json(serde_json::json!({
        "success": true,
        "timestamp": Utc::now(),
    }))
}

async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_driver_is_rejected() {
        let mut config = LinkgateConfig::default();
        config.session.driver = "carrier-pigeon".into();
        let err = driver_factory(&config).err().unwrap();
        assert!(err.to_string().contains("carrier-pigeon"));

        config.session.driver = "loopback".into();
        assert_eq!(driver_factory(&config).unwrap().id(), "loopback");
    }
}
