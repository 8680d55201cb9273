//! The session owner.
//!
//! One [`SessionManager`] per process holds the session record, the pairing
//! challenge and the live driver instance behind a single async lock. Driver
//! events are pumped into it from a per-instance task; every state change is
//! published to observers from inside the lock so they see changes in order.

use std::{
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

use {
    chrono::{DateTime, TimeDelta, Utc},
    futures::future::BoxFuture,
    serde::Serialize,
    tokio::{
        sync::{Mutex, mpsc},
        task::AbortHandle,
    },
    tracing::{debug, error, info, warn},
};

use {
    linkgate_channels::{
        ChannelDriver, ContactInfo, DriverError, DriverEvent, DriverFactory, EventSink,
        InboundMessage, LinkState, normalize_address,
    },
    linkgate_config::LinkgateConfig,
    linkgate_sessions::{
        Applied, PairingChallenge, PairingManager, PendingReconnect, Session, SessionSnapshot,
        SessionStatus, TransitionError,
    },
};

use crate::{
    broadcast::{BroadcastHub, GatewayEvent, Subscription},
    dispatcher::DispatchPolicy,
    error::{GatewayError, Result},
    scheduler::{ReconnectPolicy, ReconnectScheduler},
    webhook::WebhookForwarder,
};

/// Tunables the manager needs from the config file.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub reconnect: ReconnectPolicy,
    pub dispatch: DispatchPolicy,
    /// Inbound messages older than this are dropped.
    pub max_message_age: Duration,
    pub observer_buffer: usize,
}

impl ManagerOptions {
    pub fn from_config(config: &LinkgateConfig) -> Self {
        Self {
            reconnect: ReconnectPolicy::from(&config.reconnect),
            dispatch: DispatchPolicy::from(&config.dispatch),
            max_message_age: config.session.max_message_age(),
            observer_buffer: config.broadcast.observer_buffer,
        }
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from_config(&LinkgateConfig::default())
    }
}

struct DriverSlot {
    generation: u64,
    driver: Arc<dyn ChannelDriver>,
    pump: AbortHandle,
}

struct Core {
    session: Session,
    pairing: PairingManager,
    driver: Option<DriverSlot>,
    /// Bumped for every driver instance; events carry the generation they
    /// were produced under.
    generation: u64,
    /// Token of the reconnection the pending timer will perform.
    reconnect_token: Option<u64>,
    next_token: u64,
}

impl Core {
    fn live_generation(&self) -> Option<u64> {
        self.driver.as_ref().map(|slot| slot.generation)
    }
}

/// Result of a keyword check against a contact's display name.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeywordMatch {
    pub address: String,
    pub keyword: String,
    pub found: bool,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub rss_bytes: u64,
    pub virtual_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: &'static str,
    pub uptime_secs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryUsage>,
    pub session_status: SessionStatus,
    pub session_ready: bool,
    pub reconnect_attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_reconnect: Option<PendingReconnect>,
    pub observers: usize,
    pub timestamp: DateTime<Utc>,
}

pub struct SessionManager {
    core: Mutex<Core>,
    factory: Arc<dyn DriverFactory>,
    hub: BroadcastHub,
    webhook: Option<Arc<WebhookForwarder>>,
    scheduler: Arc<ReconnectScheduler>,
    pub(crate) options: ManagerOptions,
    pub(crate) send_gate: Mutex<()>,
    started_at: Instant,
    this: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        factory: Arc<dyn DriverFactory>,
        options: ManagerOptions,
        webhook: Option<WebhookForwarder>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            core: Mutex::new(Core {
                session: Session::new(),
                pairing: PairingManager::new(),
                driver: None,
                generation: 0,
                reconnect_token: None,
                next_token: 0,
            }),
            factory,
            hub: BroadcastHub::new(options.observer_buffer),
            webhook: webhook.map(Arc::new),
            scheduler: ReconnectScheduler::new(),
            options,
            send_gate: Mutex::new(()),
            started_at: Instant::now(),
            this: this.clone(),
        })
    }

    pub fn driver_id(&self) -> &str {
        self.factory.id()
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }

    // ── Queries ─────────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.core.lock().await.session.snapshot()
    }

    pub async fn status(&self) -> SessionStatus {
        self.core.lock().await.session.status()
    }

    pub async fn current_challenge(&self) -> Result<PairingChallenge> {
        let core = self.core.lock().await;
        let status = core.session.status();
        Ok(core.pairing.current(status)?.clone())
    }

    /// Record activity without any traffic (`/ping`).
    pub async fn touch(&self) {
        self.core.lock().await.session.touch();
    }

    /// Register an observer; its queue starts with the current status and
    /// the live challenge, if any.
    pub async fn subscribe(&self) -> Subscription {
        let core = self.core.lock().await;
        let mut replay = vec![GatewayEvent::Status(core.session.snapshot())];
        if !core.session.status().is_paired()
            && let Some(challenge) = core.pairing.pending()
        {
            replay.push(GatewayEvent::Qr(challenge.clone()));
        }
        self.hub.subscribe(&replay).await
    }

    pub async fn unsubscribe(&self, id: &str) -> bool {
        self.hub.unsubscribe(id).await
    }

    /// Live driver for traffic, or why there is none.
    pub(crate) async fn ready_driver(&self) -> Result<(u64, Arc<dyn ChannelDriver>)> {
        let core = self.core.lock().await;
        let status = core.session.status();
        match (&core.driver, status) {
            (Some(slot), SessionStatus::Ready) => Ok((slot.generation, Arc::clone(&slot.driver))),
            (None, SessionStatus::Ready)
            | (_, SessionStatus::Uninitialized | SessionStatus::Stopped) => {
                Err(GatewayError::PairingRequired)
            },
            _ => Err(GatewayError::SessionNotReady { status }),
        }
    }

    pub(crate) async fn liveness_view(&self) -> (SessionStatus, bool, bool, Duration) {
        let core = self.core.lock().await;
        (
            core.session.status(),
            core.driver.is_some(),
            core.reconnect_token.is_some(),
            core.session.idle(),
        )
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Begin a session cycle unless one is already under way.
    pub async fn start(&self) -> SessionSnapshot {
        let mut core = self.core.lock().await;
        let status = core.session.status();
        if status.is_active() {
            info!(%status, "start requested while session active; ignoring");
            return core.session.snapshot();
        }
        self.begin_cycle(&mut core).await;
        core.session.snapshot()
    }

    /// Tear down and start over, forgetting previous reconnect attempts.
    pub async fn restart(&self) -> SessionSnapshot {
        let mut core = self.core.lock().await;
        let status = core.session.status();
        info!(%status, "restarting session");
        if core.driver.is_some() || status.is_active() {
            let _ = self.transition(&mut core, SessionStatus::Stopped, None).await;
        }
        core.session.reset_reconnect_attempts();
        self.begin_cycle(&mut core).await;
        core.session.snapshot()
    }

    /// Manual stop. No automatic recovery until the next explicit start.
    pub async fn stop(&self) -> SessionSnapshot {
        let (driver, snapshot) = self.halt().await;
        if let Some(driver) = driver
            && let Err(e) = driver.shutdown().await
        {
            warn!(error = %e, "driver shutdown failed");
        }
        snapshot
    }

    /// Stop and drop the paired credentials.
    pub async fn logout(&self) -> SessionSnapshot {
        let (driver, snapshot) = self.halt().await;
        if let Some(driver) = driver {
            if let Err(e) = driver.logout().await {
                warn!(error = %e, "driver logout failed");
            }
            if let Err(e) = driver.shutdown().await {
                warn!(error = %e, "driver shutdown failed");
            }
        }
        info!("session logged out");
        snapshot
    }

    async fn halt(&self) -> (Option<Arc<dyn ChannelDriver>>, SessionSnapshot) {
        let mut core = self.core.lock().await;
        self.cancel_reconnect(&mut core).await;
        let _ = self.transition(&mut core, SessionStatus::Stopped, None).await;
        core.pairing.clear();
        let driver = Self::detach_driver(&mut core);
        (driver, core.session.snapshot())
    }

    /// Publish a placeholder challenge while the account still needs pairing.
    pub async fn generate_test_challenge(&self) -> Result<PairingChallenge> {
        let mut core = self.core.lock().await;
        let status = core.session.status();
        if status.is_paired() {
            return Err(GatewayError::NoChallengeAvailable(status));
        }
        let code = format!("linkgate-test:{}", Utc::now().timestamp_millis());
        let challenge = core.pairing.placeholder(code)?.clone();
        self.hub.publish(&GatewayEvent::Qr(challenge.clone())).await;
        Ok(challenge)
    }

    pub async fn contact_info(&self, address: &str) -> Result<ContactInfo> {
        let (status, driver) = {
            let core = self.core.lock().await;
            let Some(slot) = core.driver.as_ref() else {
                return Err(GatewayError::PairingRequired);
            };
            (core.session.status(), Arc::clone(&slot.driver))
        };
        let address = normalize_address(address, driver.address_suffix())?;
        match driver.contact(&address).await {
            Ok(info) => Ok(info),
            Err(_) if status != SessionStatus::Ready => {
                Err(GatewayError::SessionNotReady { status })
            },
            Err(e) => Err(GatewayError::ContactLookup(e)),
        }
    }

    /// Whether the contact's display name (or push name) contains `keyword`,
    /// ignoring case.
    pub async fn check_keyword(&self, address: &str, keyword: &str) -> Result<KeywordMatch> {
        let keyword = keyword.trim();
        if keyword.is_empty() {
            return Err(GatewayError::InvalidRequest("keyword is required".into()));
        }
        let info = self.contact_info(address).await?;
        let needle = keyword.to_lowercase();
        let found = [Some(info.display_name.as_str()), info.push_name.as_deref()]
            .into_iter()
            .flatten()
            .any(|name| name.to_lowercase().contains(&needle));
        Ok(KeywordMatch {
            address: info.address,
            keyword: keyword.to_string(),
            found,
            display_name: info.display_name,
        })
    }

    pub async fn health_report(&self) -> HealthReport {
        let snapshot = self.snapshot().await;
        HealthReport {
            status: "ok",
            uptime_secs: self.started_at.elapsed().as_secs(),
            memory: process_memory(),
            session_status: snapshot.status,
            session_ready: snapshot.connected,
            reconnect_attempts: snapshot.reconnect_attempts,
            pending_reconnect: snapshot.pending_reconnect,
            observers: self.hub.observer_count().await,
            timestamp: Utc::now(),
        }
    }

    /// Probe the live driver. `None` when there is no instance.
    pub(crate) async fn probe(&self) -> Option<(u64, Result<LinkState, DriverError>)> {
        let (generation, driver) = {
            let core = self.core.lock().await;
            let slot = core.driver.as_ref()?;
            (slot.generation, Arc::clone(&slot.driver))
        };
        let result = driver.probe().await;
        if matches!(result, Ok(state) if state.is_connected()) {
            self.touch().await;
        }
        Some((generation, result))
    }

    /// Leave the current cycle and schedule a reconnection.
    ///
    /// `generation` pins the driver instance the failure was observed on; a
    /// newer instance is left alone.
    pub(crate) async fn fail_and_reconnect(&self, generation: Option<u64>, reason: &str) -> bool {
        let mut core = self.core.lock().await;
        if generation.is_some() && core.live_generation() != generation {
            debug!(reason, "failure reported for a replaced driver; ignoring");
            return false;
        }
        let status = core.session.status();
        if status == SessionStatus::Stopped {
            return false;
        }
        if core.reconnect_token.is_some() {
            debug!(%status, reason, "reconnection already pending");
            return false;
        }
        warn!(%status, reason, "session failed; scheduling reconnection");
        if !status.is_failure() {
            let _ = self
                .transition(&mut core, SessionStatus::Disconnected, None)
                .await;
        }
        self.schedule_reconnect(&mut core).await;
        true
    }

    // ── Lifecycle internals ─────────────────────────────────────────────────

    async fn transition(
        &self,
        core: &mut Core,
        to: SessionStatus,
        identity: Option<String>,
    ) -> Result<Applied, TransitionError> {
        match core.session.apply(to, identity) {
            Ok(Applied::Changed { from }) => {
                info!(%from, %to, "session status changed");
                match to {
                    SessionStatus::Authenticated => core.pairing.consume(),
                    SessionStatus::Ready => core.pairing.clear(),
                    _ => {},
                }
                self.hub
                    .publish(&GatewayEvent::Status(core.session.snapshot()))
                    .await;
                Ok(Applied::Changed { from })
            },
            Ok(Applied::Ignored) => Ok(Applied::Ignored),
            Err(e) => {
                warn!(error = %e, "rejected session transition");
                Err(e)
            },
        }
    }

    /// Fresh `initializing` cycle on a new driver instance.
    async fn begin_cycle(&self, core: &mut Core) {
        self.cancel_reconnect(core).await;
        if let Some(old) = Self::detach_driver(core) {
            tokio::spawn(async move {
                if let Err(e) = old.shutdown().await {
                    warn!(error = %e, "teardown of previous driver failed");
                }
            });
        }
        if self
            .transition(core, SessionStatus::Initializing, None)
            .await
            .is_err()
        {
            return;
        }

        core.generation += 1;
        let generation = core.generation;
        let driver = self.factory.create();
        let (tx, rx) = mpsc::unbounded_channel();
        let pump = tokio::spawn(pump_events(self.this.clone(), generation, rx));
        core.driver = Some(DriverSlot {
            generation,
            driver: Arc::clone(&driver),
            pump: pump.abort_handle(),
        });
        info!(driver = self.factory.id(), generation, "starting driver");

        tokio::spawn(start_driver(self.this.clone(), driver, generation, tx));
    }

    async fn on_start_failed(&self, generation: u64, err: DriverError) {
        let mut core = self.core.lock().await;
        if core.live_generation() != Some(generation) {
            return;
        }
        let err = GatewayError::DriverInitialization(err);
        error!(error = %err, generation, "session initialization failed");
        let _ = self.transition(&mut core, SessionStatus::Error, None).await;

        let code = format!("linkgate-unavailable:{}", uuid::Uuid::new_v4());
        match core.pairing.placeholder(code) {
            Ok(challenge) => {
                let challenge = challenge.clone();
                self.hub.publish(&GatewayEvent::Qr(challenge)).await;
            },
            Err(e) => warn!(error = %e, "failed to issue placeholder challenge"),
        }

        if let Some(failed) = Self::detach_driver(&mut core) {
            tokio::spawn(async move {
                let _ = failed.shutdown().await;
            });
        }
        self.schedule_reconnect(&mut core).await;
    }

    async fn handle_event(&self, generation: u64, event: DriverEvent) {
        let mut core = self.core.lock().await;
        if core.live_generation() != Some(generation) {
            debug!(generation, "dropping event from replaced driver");
            return;
        }

        match event {
            DriverEvent::PairingRequired { code } => {
                if self
                    .transition(&mut core, SessionStatus::QrPending, None)
                    .await
                    .is_err()
                {
                    return;
                }
                match core.pairing.submit(code) {
                    Ok(challenge) => {
                        let challenge = challenge.clone();
                        info!(id = %challenge.id, "pairing code issued");
                        self.hub.publish(&GatewayEvent::Qr(challenge)).await;
                    },
                    Err(e) => warn!(error = %e, "failed to render pairing code"),
                }
            },
            DriverEvent::Authenticated => {
                let _ = self
                    .transition(&mut core, SessionStatus::Authenticated, None)
                    .await;
            },
            DriverEvent::Ready { identity } => {
                let status = core.session.status();
                if matches!(status, SessionStatus::Initializing | SessionStatus::QrPending) {
                    debug!(%status, "driver skipped authenticated; filling it in");
                    let _ = self
                        .transition(&mut core, SessionStatus::Authenticated, None)
                        .await;
                }
                let _ = self
                    .transition(&mut core, SessionStatus::Ready, identity)
                    .await;
            },
            DriverEvent::AuthFailed { reason } => {
                warn!(%reason, "authentication failed");
                if self
                    .transition(&mut core, SessionStatus::AuthFailed, None)
                    .await
                    .is_ok()
                {
                    self.schedule_reconnect(&mut core).await;
                }
            },
            DriverEvent::Disconnected { reason } => {
                warn!(%reason, "driver disconnected");
                if self
                    .transition(&mut core, SessionStatus::Disconnected, None)
                    .await
                    .is_ok()
                {
                    self.schedule_reconnect(&mut core).await;
                }
            },
            DriverEvent::Message(message) => self.handle_inbound(&mut core, message).await,
        }
    }

    async fn handle_inbound(&self, core: &mut Core, message: InboundMessage) {
        let age = Utc::now().timestamp() - message.timestamp;
        if message.timestamp > 0 && age > self.options.max_message_age.as_secs() as i64 {
            debug!(id = %message.id, age_secs = age, "dropping stale inbound message");
            return;
        }
        core.session.touch();
        debug!(id = %message.id, from = %message.from, "inbound message");
        if let Some(webhook) = &self.webhook {
            webhook.forward(message.clone());
        }
        self.hub.publish(&GatewayEvent::Message { message }).await;
    }

    async fn schedule_reconnect(&self, core: &mut Core) {
        let policy = self.options.reconnect;
        let attempt = core.session.next_reconnect_attempt(policy.max_attempts);
        let delay = policy.delay_for(attempt);

        core.next_token += 1;
        let token = core.next_token;
        core.reconnect_token = Some(token);
        core.session.set_pending_reconnect(Some(PendingReconnect {
            attempt,
            delay_ms: delay.as_millis() as u64,
            due_at: Utc::now() + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero()),
        }));

        let this = self.this.clone();
        self.scheduler
            .schedule(delay, move || reconnect_when_due(this, token))
            .await;

        info!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "reconnection scheduled"
        );
        self.hub
            .publish(&GatewayEvent::Status(core.session.snapshot()))
            .await;
    }

    async fn reconnect_due(&self, token: u64) {
        let mut core = self.core.lock().await;
        if core.reconnect_token != Some(token) {
            debug!(token, "stale reconnect timer; ignoring");
            return;
        }
        core.reconnect_token = None;
        core.session.set_pending_reconnect(None);
        info!(
            attempt = core.session.reconnect_attempts(),
            "reconnecting session"
        );
        self.begin_cycle(&mut core).await;
    }

    async fn cancel_reconnect(&self, core: &mut Core) {
        core.reconnect_token = None;
        core.session.set_pending_reconnect(None);
        self.scheduler.cancel().await;
    }

    fn detach_driver(core: &mut Core) -> Option<Arc<dyn ChannelDriver>> {
        core.driver.take().map(|slot| {
            slot.pump.abort();
            slot.driver
        })
    }
}

// Boxed: starting a driver and firing a reconnect can each lead back to the
// other, which an unboxed async fn cannot express.
fn start_driver(
    manager: Weak<SessionManager>,
    driver: Arc<dyn ChannelDriver>,
    generation: u64,
    events: EventSink,
) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(e) = driver.start(events).await
            && let Some(manager) = manager.upgrade()
        {
            manager.on_start_failed(generation, e).await;
        }
    })
}

fn reconnect_when_due(manager: Weak<SessionManager>, token: u64) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Some(manager) = manager.upgrade() {
            manager.reconnect_due(token).await;
        }
    })
}

async fn pump_events(
    manager: Weak<SessionManager>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(manager) = manager.upgrade() else {
            break;
        };
        manager.handle_event(generation, event).await;
    }
    debug!(generation, "driver event stream closed");
}

fn process_memory() -> Option<MemoryUsage> {
    use sysinfo::{ProcessesToUpdate, System};

    let pid = sysinfo::get_current_pid().ok()?;
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), false);
    system.process(pid).map(|p| MemoryUsage {
        rss_bytes: p.memory(),
        virtual_bytes: p.virtual_memory(),
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        linkgate_channels::testing::{Script, ScriptedFactory},
    };

    fn manager(script: &Arc<Script>) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(ScriptedFactory::new(Arc::clone(script))),
            ManagerOptions::default(),
            None,
        )
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    async fn next_frame(sub: &mut Subscription) -> serde_json::Value {
        let frame = tokio::time::timeout(Duration::from_secs(600), sub.frames.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&frame).unwrap()
    }

    fn ready_events() -> Vec<DriverEvent> {
        vec![DriverEvent::Authenticated, DriverEvent::Ready {
            identity: Some("5511000000000@c.us".into()),
        }]
    }

    #[tokio::test(start_paused = true)]
    async fn pairing_scenario_ends_ready_with_challenge_cleared() {
        let script = Script::new();
        script.on_start(vec![
            DriverEvent::PairingRequired { code: "XYZ".into() },
            DriverEvent::Authenticated,
            DriverEvent::Ready {
                identity: Some("5511000000000@c.us".into()),
            },
        ]);
        let manager = manager(&script);
        manager.start().await;
        settle().await;

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Ready);
        assert!(snapshot.connected);
        assert_eq!(snapshot.identity.as_deref(), Some("5511000000000@c.us"));
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(matches!(
            manager.current_challenge().await,
            Err(GatewayError::NoChallengeAvailable(SessionStatus::Ready))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent_while_initializing() {
        let script = Script::new();
        let manager = manager(&script);

        let first = manager.start().await;
        let second = manager.start().await;
        settle().await;

        assert_eq!(first.status, SessionStatus::Initializing);
        assert_eq!(second.status, SessionStatus::Initializing);
        assert_eq!(Script::count(&script.created), 1);
        assert_eq!(Script::count(&script.started), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn late_subscriber_gets_status_and_live_challenge() {
        let script = Script::new();
        script.on_start(vec![DriverEvent::PairingRequired {
            code: "late".into(),
        }]);
        let manager = manager(&script);
        manager.start().await;
        settle().await;

        let mut sub = manager.subscribe().await;
        let status = next_frame(&mut sub).await;
        assert_eq!(status["type"], "status");
        assert_eq!(status["status"], "qr_pending");
        let qr = next_frame(&mut sub).await;
        assert_eq!(qr["type"], "qr");
        assert_eq!(qr["code"], "late");
        assert!(qr["image"].as_str().unwrap().starts_with("data:image/svg+xml;base64,"));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_disconnects_back_off() {
        let script = Script::new();
        let manager = manager(&script);
        let mut sub = manager.subscribe().await;
        manager.start().await;
        settle().await;

        let mut delays = Vec::new();
        for round in 1..=3u32 {
            assert!(script.emit(DriverEvent::Disconnected {
                reason: "stream closed".into(),
            }));
            let pending = loop {
                let frame = next_frame(&mut sub).await;
                if let Some(pending) = frame.get("pendingReconnect") {
                    break pending.clone();
                }
            };
            assert_eq!(pending["attempt"], round);
            delays.push(pending["delayMs"].as_u64().unwrap());

            if round < 3 {
                tokio::time::sleep(Duration::from_millis(delays[round as usize - 1] + 10)).await;
                assert_eq!(manager.status().await, SessionStatus::Initializing);
            }
        }

        assert_eq!(delays, vec![5_000, 7_500, 11_250]);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 3);
        assert_eq!(Script::count(&script.created), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ready_resets_attempts_after_recovery() {
        let script = Script::new();
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        script.emit(DriverEvent::Disconnected {
            reason: "x".into(),
        });
        settle().await;
        assert_eq!(manager.snapshot().await.reconnect_attempts, 1);

        script.on_start(ready_events());
        tokio::time::sleep(Duration::from_secs(6)).await;
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Ready);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(snapshot.pending_reconnect.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_driver_report_is_rejected() {
        let script = Script::new();
        script.on_start(ready_events());
        let manager = manager(&script);
        manager.start().await;
        settle().await;

        script.emit(DriverEvent::PairingRequired { code: "late".into() });
        settle().await;
        assert_eq!(manager.status().await, SessionStatus::Ready);
        assert!(manager.current_challenge().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_pending_reconnect() {
        let script = Script::new();
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        script.emit(DriverEvent::AuthFailed {
            reason: "bad creds".into(),
        });
        settle().await;
        assert!(manager.snapshot().await.pending_reconnect.is_some());

        let snapshot = manager.stop().await;
        assert_eq!(snapshot.status, SessionStatus::Stopped);
        assert!(snapshot.pending_reconnect.is_none());
        assert_eq!(Script::count(&script.shutdowns), 1);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(manager.status().await, SessionStatus::Stopped);
        assert_eq!(Script::count(&script.created), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn events_from_replaced_driver_are_ignored() {
        let script = Script::new();
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        let generation = manager.core.lock().await.live_generation().unwrap();

        manager.restart().await;
        settle().await;
        manager
            .handle_event(generation, DriverEvent::Disconnected {
                reason: "old".into(),
            })
            .await;
        assert_eq!(manager.status().await, SessionStatus::Initializing);
        assert_eq!(Script::count(&script.created), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_failure_goes_to_error_with_placeholder() {
        let script = Script::new();
        script.fail_next_start(DriverError::Initialization("no browser".into()));
        let manager = manager(&script);
        manager.start().await;
        settle().await;

        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, SessionStatus::Error);
        assert_eq!(snapshot.pending_reconnect.map(|p| p.attempt), Some(1));
        let challenge = manager.current_challenge().await.unwrap();
        assert!(challenge.synthetic);

        script.on_start(ready_events());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(manager.status().await, SessionStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_resets_attempts() {
        let script = Script::new();
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        script.emit(DriverEvent::Disconnected {
            reason: "x".into(),
        });
        settle().await;
        assert_eq!(manager.snapshot().await.reconnect_attempts, 1);

        let snapshot = manager.restart().await;
        assert_eq!(snapshot.status, SessionStatus::Initializing);
        assert_eq!(snapshot.reconnect_attempts, 0);
        assert!(snapshot.pending_reconnect.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_from_idle_goes_straight_to_initializing() {
        let script = Script::new();
        let manager = manager(&script);
        let mut sub = manager.subscribe().await;
        assert_eq!(next_frame(&mut sub).await["status"], "uninitialized");

        manager.restart().await;
        let frame = next_frame(&mut sub).await;
        assert_eq!(frame["type"], "status");
        assert_eq!(frame["status"], "initializing");
    }

    #[tokio::test(start_paused = true)]
    async fn failure_while_reconnect_pending_keeps_the_timer() {
        let script = Script::new();
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        script.emit(DriverEvent::Disconnected {
            reason: "x".into(),
        });
        settle().await;
        let pending = manager.snapshot().await.pending_reconnect.unwrap();

        assert!(!manager.fail_and_reconnect(None, "stuck").await);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.reconnect_attempts, 1);
        assert_eq!(snapshot.pending_reconnect, Some(pending));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_inbound_messages_are_dropped() {
        let script = Script::new();
        script.on_start(ready_events());
        let manager = manager(&script);
        manager.start().await;
        settle().await;
        let mut sub = manager.subscribe().await;
        next_frame(&mut sub).await;

        let now = Utc::now().timestamp();
        for (id, ts) in [("old", now - 3_600), ("fresh", now)] {
            script.emit(DriverEvent::Message(InboundMessage {
                id: id.into(),
                from: "5511@c.us".into(),
                to: None,
                body: "hi".into(),
                timestamp: ts,
                has_media: false,
            }));
        }
        let frame = next_frame(&mut sub).await;
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["message"]["id"], "fresh");
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_check_is_case_insensitive() {
        let script = Script::new();
        script.on_start(ready_events());
        script.set_contact(Ok(ContactInfo {
            address: "5511@c.us".into(),
            is_known_contact: true,
            display_name: "Maria VIP Cliente".into(),
            push_name: None,
            is_group: false,
        }));
        let manager = manager(&script);
        assert!(matches!(
            manager.check_keyword("5511", "vip").await,
            Err(GatewayError::PairingRequired)
        ));
        manager.start().await;
        settle().await;

        assert!(manager.check_keyword("5511", "vip").await.unwrap().found);
        assert!(!manager.check_keyword("5511", "gold").await.unwrap().found);
        assert!(matches!(
            manager.check_keyword("5511", " ").await,
            Err(GatewayError::InvalidRequest(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_challenge_only_while_unpaired() {
        let script = Script::new();
        let manager = manager(&script);
        let challenge = manager.generate_test_challenge().await.unwrap();
        assert!(challenge.synthetic);
        assert_eq!(manager.current_challenge().await.unwrap().id, challenge.id);

        script.on_start(ready_events());
        manager.start().await;
        settle().await;
        assert!(manager.generate_test_challenge().await.is_err());
    }
}
