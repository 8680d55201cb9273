use std::{collections::HashMap, time::Instant};

use {
    serde::Serialize,
    tokio::sync::{RwLock, mpsc, mpsc::error::TrySendError},
    tracing::{debug, warn},
};

use {
    linkgate_channels::InboundMessage,
    linkgate_sessions::{PairingChallenge, SessionSnapshot},
};

/// Event frames pushed to observers as `{"type": ..., ...}`.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayEvent {
    Status(SessionSnapshot),
    Qr(PairingChallenge),
    Message { message: InboundMessage },
}

impl GatewayEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Qr(_) => "qr",
            Self::Message { .. } => "message",
        }
    }
}

// ── Observer ────────────────────────────────────────────────────────────────

/// One connected subscriber and its bounded frame queue.
#[derive(Debug)]
pub struct Observer {
    pub id: String,
    sender: mpsc::Sender<String>,
    pub connected_at: Instant,
}

/// Receiving side handed to whoever drains an observer (the WS write loop).
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub frames: mpsc::Receiver<String>,
}

// ── Hub ─────────────────────────────────────────────────────────────────────

/// Fan-out of session events. A slow or gone observer is dropped, never
/// waited on.
pub struct BroadcastHub {
    observers: RwLock<HashMap<String, Observer>>,
    buffer: usize,
}

impl BroadcastHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            observers: RwLock::new(HashMap::new()),
            buffer: buffer.max(4),
        }
    }

    /// Register an observer whose queue starts with `replay`.
    pub async fn subscribe(&self, replay: &[GatewayEvent]) -> Subscription {
        let id = uuid::Uuid::new_v4().to_string();
        let (sender, frames) = mpsc::channel(self.buffer.max(replay.len() + 1));
        for event in replay {
            if let Some(frame) = encode(event) {
                let _ = sender.try_send(frame);
            }
        }
        self.observers.write().await.insert(id.clone(), Observer {
            id: id.clone(),
            sender,
            connected_at: Instant::now(),
        });
        debug!(observer = %id, "observer subscribed");
        Subscription { id, frames }
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.observers.write().await.remove(id).is_some();
        if removed {
            debug!(observer = %id, "observer unsubscribed");
        }
        removed
    }

    /// Queue a frame for one observer only.
    pub async fn send_to(&self, id: &str, frame: String) -> bool {
        let sent = match self.observers.read().await.get(id) {
            Some(observer) => observer.sender.try_send(frame).is_ok(),
            None => return false,
        };
        if !sent {
            self.evict(&[(id.to_string(), "queue full or closed")]).await;
        }
        sent
    }

    /// Deliver `event` to every observer. Returns how many accepted it.
    pub async fn publish(&self, event: &GatewayEvent) -> usize {
        let Some(frame) = encode(event) else {
            return 0;
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        {
            let observers = self.observers.read().await;
            for (id, observer) in observers.iter() {
                match observer.sender.try_send(frame.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => dead.push((id.clone(), "queue full")),
                    Err(TrySendError::Closed(_)) => dead.push((id.clone(), "closed")),
                }
            }
        }
        if !dead.is_empty() {
            self.evict(&dead).await;
        }
        debug!(event = event.kind(), delivered, "broadcast");
        delivered
    }

    async fn evict(&self, dead: &[(String, &str)]) {
        let mut observers = self.observers.write().await;
        for (id, reason) in dead {
            if observers.remove(id).is_some() {
                warn!(observer = %id, reason, "evicting observer");
            }
        }
    }

    pub async fn observer_count(&self) -> usize {
        self.observers.read().await.len()
    }
}

fn encode(event: &GatewayEvent) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!(event = event.kind(), error = %e, "failed to serialize event");
            None
        },
    }
}

#[cfg(test)]
mod tests {
    use {super::*, linkgate_sessions::Session};

    fn status_event() -> GatewayEvent {
        GatewayEvent::Status(Session::new().snapshot())
    }

    fn message_event(body: &str) -> GatewayEvent {
        GatewayEvent::Message {
            message: InboundMessage {
                id: "m1".into(),
                from: "5511@c.us".into(),
                to: None,
                body: body.into(),
                timestamp: 0,
                has_media: false,
            },
        }
    }

    #[tokio::test]
    async fn replay_is_queued_before_live_events() {
        let hub = BroadcastHub::new(8);
        let mut sub = hub.subscribe(&[status_event()]).await;
        hub.publish(&message_event("hi")).await;

        let first: serde_json::Value =
            serde_json::from_str(&sub.frames.recv().await.unwrap()).unwrap();
        assert_eq!(first["type"], "status");
        assert_eq!(first["status"], "uninitialized");

        let second: serde_json::Value =
            serde_json::from_str(&sub.frames.recv().await.unwrap()).unwrap();
        assert_eq!(second["type"], "message");
        assert_eq!(second["message"]["body"], "hi");
    }

    #[tokio::test]
    async fn full_queue_evicts_only_that_observer() {
        let hub = BroadcastHub::new(4);
        let mut healthy = hub.subscribe(&[]).await;
        let _stuck = hub.subscribe(&[]).await;

        for i in 0..4 {
            assert_eq!(hub.publish(&message_event(&i.to_string())).await, 2);
            healthy.frames.recv().await.unwrap();
        }
        assert_eq!(hub.publish(&message_event("overflow")).await, 1);
        assert_eq!(hub.observer_count().await, 1);
        assert!(healthy.frames.recv().await.is_some());
    }

    #[tokio::test]
    async fn closed_observer_is_dropped() {
        let hub = BroadcastHub::new(4);
        let sub = hub.subscribe(&[]).await;
        drop(sub);
        assert_eq!(hub.publish(&status_event()).await, 0);
        assert_eq!(hub.observer_count().await, 0);
    }

    #[tokio::test]
    async fn send_to_targets_one_observer() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.subscribe(&[]).await;
        let mut b = hub.subscribe(&[]).await;
        assert!(hub.send_to(&a.id, "only-a".into()).await);
        assert_eq!(a.frames.recv().await.unwrap(), "only-a");
        assert!(b.frames.try_recv().is_err());
        assert!(!hub.send_to("nobody", "x".into()).await);
        assert!(hub.unsubscribe(&b.id).await);
    }
}
