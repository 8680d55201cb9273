//! Loopback driver: pairs itself and talks to nobody.
//!
//! Useful for running the gateway without a chat network (local admin UI
//! work, integration tests). A fresh instance issues a pairing code and
//! "scans" it after `pair_delay`; later instances from the same factory reuse
//! the cached credentials until `logout`. With `echo` enabled every outbound
//! text comes back as an inbound message from the recipient.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use {
    async_trait::async_trait,
    tokio::{sync::Mutex, task::JoinHandle},
    tracing::{debug, info},
};

use crate::{
    driver::{
        ChannelDriver, ContactInfo, DriverEvent, DriverFactory, EventSink, InboundMessage,
        LinkState, MediaAttachment,
    },
    error::DriverError,
};

/// Account identity reported once paired.
pub const LOOPBACK_IDENTITY: &str = "10000000000";

/// Creates [`LoopbackDriver`] instances sharing one credential cache.
pub struct LoopbackFactory {
    pair_delay: Duration,
    echo: bool,
    credentials: Arc<AtomicBool>,
}

impl LoopbackFactory {
    pub fn new(pair_delay: Duration) -> Self {
        Self {
            pair_delay,
            echo: false,
            credentials: Arc::new(AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }
}

impl DriverFactory for LoopbackFactory {
    fn id(&self) -> &str {
        "loopback"
    }

    fn create(&self) -> Arc<dyn ChannelDriver> {
        Arc::new(LoopbackDriver {
            pair_delay: self.pair_delay,
            echo: self.echo,
            credentials: Arc::clone(&self.credentials),
            state: Mutex::new(LoopbackState::default()),
        })
    }
}

#[derive(Default)]
struct LoopbackState {
    events: Option<EventSink>,
    ready: Arc<AtomicBool>,
    pairing: Option<JoinHandle<()>>,
    contacts: HashSet<String>,
    closed: bool,
}

pub struct LoopbackDriver {
    pair_delay: Duration,
    echo: bool,
    credentials: Arc<AtomicBool>,
    state: Mutex<LoopbackState>,
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

impl LoopbackDriver {
    async fn require_ready(&self) -> Result<EventSink, DriverError> {
        let state = self.state.lock().await;
        if state.closed {
            return Err(DriverError::SessionClosed("loopback instance shut down".into()));
        }
        match &state.events {
            Some(events) if state.ready.load(Ordering::SeqCst) => Ok(events.clone()),
            _ => Err(DriverError::NotConnected),
        }
    }
}

#[async_trait]
impl ChannelDriver for LoopbackDriver {
    fn id(&self) -> &str {
        "loopback"
    }

    async fn start(&self, events: EventSink) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(DriverError::Initialization("instance already shut down".into()));
        }
        if state.events.is_some() {
            return Ok(());
        }
        state.events = Some(events.clone());

        if self.credentials.load(Ordering::SeqCst) {
            info!("loopback: reusing cached credentials");
            state.ready.store(true, Ordering::SeqCst);
            let _ = events.send(DriverEvent::Authenticated);
            let _ = events.send(DriverEvent::Ready {
                identity: Some(LOOPBACK_IDENTITY.into()),
            });
            return Ok(());
        }

        let code = format!("linkgate-loopback:{}", uuid::Uuid::new_v4());
        debug!(%code, "loopback: issuing pairing code");
        let _ = events.send(DriverEvent::PairingRequired { code });

        let delay = self.pair_delay;
        let ready = Arc::clone(&state.ready);
        let credentials = Arc::clone(&self.credentials);
        state.pairing = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            credentials.store(true, Ordering::SeqCst);
            ready.store(true, Ordering::SeqCst);
            let _ = events.send(DriverEvent::Authenticated);
            let _ = events.send(DriverEvent::Ready {
                identity: Some(LOOPBACK_IDENTITY.into()),
            });
        }));
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        let mut state = self.state.lock().await;
        if let Some(task) = state.pairing.take() {
            task.abort();
        }
        state.ready.store(false, Ordering::SeqCst);
        state.events = None;
        state.closed = true;
        Ok(())
    }

    async fn logout(&self) -> Result<(), DriverError> {
        self.credentials.store(false, Ordering::SeqCst);
        info!("loopback: credentials cleared");
        Ok(())
    }

    async fn probe(&self) -> Result<LinkState, DriverError> {
        let state = self.state.lock().await;
        Ok(match (&state.events, state.ready.load(Ordering::SeqCst)) {
            (Some(_), true) => LinkState::Connected,
            (Some(_), false) if self.credentials.load(Ordering::SeqCst) => LinkState::Opening,
            (Some(_), false) => LinkState::Unpaired,
            (None, _) => LinkState::Disconnected,
        })
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<String, DriverError> {
        let events = self.require_ready().await?;
        let id = format!("loopback-{}", uuid::Uuid::new_v4());
        self.state.lock().await.contacts.insert(to.to_string());

        if self.echo {
            let _ = events.send(DriverEvent::Message(InboundMessage {
                id: format!("{id}-echo"),
                from: to.to_string(),
                to: Some(LOOPBACK_IDENTITY.into()),
                body: text.to_string(),
                timestamp: unix_now(),
                has_media: false,
            }));
        }
        Ok(id)
    }

    async fn send_media(&self, to: &str, media: &MediaAttachment) -> Result<String, DriverError> {
        self.require_ready().await?;
        tokio::fs::metadata(&media.path).await.map_err(|e| {
            DriverError::Other(format!("media file {} unreadable: {e}", media.path.display()))
        })?;
        self.state.lock().await.contacts.insert(to.to_string());
        Ok(format!("loopback-{}", uuid::Uuid::new_v4()))
    }

    async fn contact(&self, address: &str) -> Result<ContactInfo, DriverError> {
        let state = self.state.lock().await;
        if state.events.is_none() {
            return Err(DriverError::NotConnected);
        }
        let known = state.contacts.contains(address);
        let number = address.split('@').next().unwrap_or(address);
        Ok(ContactInfo {
            address: address.to_string(),
            is_known_contact: known,
            display_name: if known {
                format!("Contact {number}")
            } else {
                String::new()
            },
            push_name: None,
            is_group: address.ends_with("@g.us"),
        })
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::sync::mpsc};

    async fn next(rx: &mut mpsc::UnboundedReceiver<DriverEvent>) -> DriverEvent {
        tokio::time::timeout(Duration::from_secs(30), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn pairs_after_delay_then_reuses_credentials() {
        let factory = LoopbackFactory::new(Duration::from_secs(2));

        let first = factory.create();
        let (tx, mut rx) = mpsc::unbounded_channel();
        first.start(tx).await.unwrap();
        assert!(matches!(next(&mut rx).await, DriverEvent::PairingRequired { .. }));
        assert_eq!(first.probe().await.unwrap(), LinkState::Unpaired);
        assert_eq!(next(&mut rx).await, DriverEvent::Authenticated);
        assert!(matches!(next(&mut rx).await, DriverEvent::Ready { .. }));
        assert_eq!(first.probe().await.unwrap(), LinkState::Connected);
        first.shutdown().await.unwrap();

        let second = factory.create();
        let (tx, mut rx) = mpsc::unbounded_channel();
        second.start(tx).await.unwrap();
        assert_eq!(next(&mut rx).await, DriverEvent::Authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn logout_forces_fresh_pairing() {
        let factory = LoopbackFactory::new(Duration::from_millis(10));
        let driver = factory.create();
        let (tx, mut rx) = mpsc::unbounded_channel();
        driver.start(tx).await.unwrap();
        next(&mut rx).await;
        next(&mut rx).await;
        next(&mut rx).await;
        driver.logout().await.unwrap();
        driver.shutdown().await.unwrap();

        let again = factory.create();
        let (tx, mut rx) = mpsc::unbounded_channel();
        again.start(tx).await.unwrap();
        assert!(matches!(next(&mut rx).await, DriverEvent::PairingRequired { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn send_requires_ready_and_echoes() {
        let factory = LoopbackFactory::new(Duration::from_millis(10)).with_echo(true);
        let driver = factory.create();
        assert_eq!(
            driver.send_text("1@c.us", "hi").await,
            Err(DriverError::NotConnected)
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        driver.start(tx).await.unwrap();
        for _ in 0..3 {
            next(&mut rx).await;
        }
        let id = driver.send_text("5511@c.us", "hello").await.unwrap();
        assert!(id.starts_with("loopback-"));
        match next(&mut rx).await {
            DriverEvent::Message(msg) => {
                assert_eq!(msg.from, "5511@c.us");
                assert_eq!(msg.body, "hello");
            },
            other => panic!("unexpected event {other:?}"),
        }

        let contact = driver.contact("5511@c.us").await.unwrap();
        assert!(contact.is_known_contact);
        assert_eq!(contact.display_name, "Contact 5511");
        assert!(!driver.contact("42@c.us").await.unwrap().is_known_contact);
    }

    #[tokio::test(start_paused = true)]
    async fn shut_down_instance_reports_closed_session() {
        let factory = LoopbackFactory::new(Duration::from_millis(10));
        let driver = factory.create();
        let (tx, _rx) = mpsc::unbounded_channel();
        driver.start(tx).await.unwrap();
        driver.shutdown().await.unwrap();
        let err = driver.send_text("1@c.us", "x").await.unwrap_err();
        assert!(err.is_session_unusable());
        assert_eq!(driver.probe().await.unwrap(), LinkState::Disconnected);
    }
}
