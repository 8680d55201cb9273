use std::{net::SocketAddr, sync::Arc};

use {
    axum::extract::ws::{Message, WebSocket},
    futures::{SinkExt, StreamExt},
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
};

use crate::{broadcast::Subscription, manager::SessionManager, state::GatewayState};

/// Frames a client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ClientFrame {
    SendMessage {
        #[serde(default)]
        id: Option<String>,
        #[serde(alias = "recipient", alias = "jid")]
        to: String,
        text: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum ReplyFrame {
    #[serde(rename_all = "camelCase")]
    SendMessageResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
    },
}

impl ReplyFrame {
    fn encode(&self) -> Option<String> {
        serde_json::to_string(self)
            .inspect_err(|e| warn!(error = %e, "failed to encode reply frame"))
            .ok()
    }
}

/// Serve one observer connection until either side goes away.
pub async fn handle_connection(socket: WebSocket, state: Arc<GatewayState>, remote: SocketAddr) {
    let manager = Arc::clone(&state.manager);
    let Subscription { id: conn_id, mut frames } = manager.subscribe().await;
    info!(conn_id = %conn_id, remote = %remote, "ws: observer connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Write loop: drain the observer queue. Ends when the hub drops us.
    let mut write_loop = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            if ws_tx.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    loop {
        tokio::select! {
            _ = &mut write_loop => {
                debug!(conn_id = %conn_id, "ws: observer queue closed");
                break;
            },
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => handle_frame(&manager, &conn_id, text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {},
                Some(Err(e)) => {
                    debug!(conn_id = %conn_id, error = %e, "ws: read error");
                    break;
                },
            },
        }
    }

    write_loop.abort();
    manager.unsubscribe(&conn_id).await;
    info!(conn_id = %conn_id, "ws: observer disconnected");
}

async fn handle_frame(manager: &Arc<SessionManager>, conn_id: &str, text: &str) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(conn_id, error = %e, "ws: unrecognized frame");
            reply(manager, conn_id, ReplyFrame::Error {
                error: format!("invalid frame: {e}"),
            })
            .await;
            return;
        },
    };

    match frame {
        ClientFrame::SendMessage { id, to, text } => {
            // sends may sit in the retry loop; keep reading meanwhile
            let manager = Arc::clone(manager);
            let conn_id = conn_id.to_string();
            tokio::spawn(async move {
                let result = manager.send_text(&to, &text).await;
                let frame = match result {
                    Ok(receipt) => ReplyFrame::SendMessageResult {
                        id,
                        success: true,
                        message_id: Some(receipt.message_id),
                        error: None,
                    },
                    Err(e) => ReplyFrame::SendMessageResult {
                        id,
                        success: false,
                        message_id: None,
                        error: Some(e.to_string()),
                    },
                };
                reply(&manager, &conn_id, frame).await;
            });
        },
    }
}

async fn reply(manager: &SessionManager, conn_id: &str, frame: ReplyFrame) {
    if let Some(encoded) = frame.encode() {
        manager.hub().send_to(conn_id, encoded).await;
    }
}
