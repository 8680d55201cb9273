//! Periodic liveness checks and idle recovery.

use std::{sync::Arc, time::Duration};

use {
    tokio::task::JoinHandle,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use {linkgate_config::HealthConfig, linkgate_sessions::SessionStatus};

use crate::manager::SessionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthPolicy {
    pub interval: Duration,
    pub init_idle: Duration,
    pub probe_idle: Duration,
    pub stuck_idle: Duration,
    pub keepalive: Option<Duration>,
}

impl From<&HealthConfig> for HealthPolicy {
    fn from(cfg: &HealthConfig) -> Self {
        Self {
            interval: Duration::from_secs(cfg.interval_secs.max(1)),
            init_idle: Duration::from_secs(cfg.init_idle_secs),
            probe_idle: Duration::from_secs(cfg.probe_idle_secs),
            stuck_idle: Duration::from_secs(cfg.stuck_idle_secs),
            keepalive: (cfg.keepalive_secs > 0).then(|| Duration::from_secs(cfg.keepalive_secs)),
        }
    }
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthAction {
    None,
    Initialize,
    Probe,
    ForceReconnect,
}

/// What the periodic check should do given the session's current shape.
pub fn evaluate(
    policy: &HealthPolicy,
    status: SessionStatus,
    has_driver: bool,
    reconnect_pending: bool,
    idle: Duration,
) -> HealthAction {
    if status == SessionStatus::Stopped || reconnect_pending {
        return HealthAction::None;
    }
    if !has_driver {
        return if idle > policy.init_idle {
            HealthAction::Initialize
        } else {
            HealthAction::None
        };
    }
    match status {
        SessionStatus::Ready if idle > policy.probe_idle => HealthAction::Probe,
        SessionStatus::Ready => HealthAction::None,
        _ if idle > policy.stuck_idle => HealthAction::ForceReconnect,
        _ => HealthAction::None,
    }
}

impl SessionManager {
    /// One health pass. Returns the action taken.
    pub async fn health_check(&self, policy: &HealthPolicy) -> HealthAction {
        let (status, has_driver, pending, idle) = self.liveness_view().await;
        let action = evaluate(policy, status, has_driver, pending, idle);
        match action {
            HealthAction::None => {},
            HealthAction::Initialize => {
                info!(idle_secs = idle.as_secs(), "no session for a while; initializing");
                self.start().await;
            },
            HealthAction::Probe => {
                // one idle period, one probe
                self.touch().await;
                self.probe_or_recover("idle probe").await;
            },
            HealthAction::ForceReconnect => {
                warn!(%status, idle_secs = idle.as_secs(), "session stuck; forcing reconnection");
                self.fail_and_reconnect(None, "stuck without reaching ready")
                    .await;
            },
        }
        action
    }

    /// Keepalive probe while ready.
    pub async fn keepalive(&self) {
        if self.status().await == SessionStatus::Ready {
            self.probe_or_recover("keepalive").await;
        }
    }

    async fn probe_or_recover(&self, context: &str) {
        let Some((generation, result)) = self.probe().await else {
            return;
        };
        match result {
            Ok(state) if state.is_connected() => debug!(context, "liveness probe ok"),
            Ok(state) => {
                warn!(context, ?state, "liveness probe reports session down");
                self.fail_and_reconnect(Some(generation), &format!("{context}: {state:?}"))
                    .await;
            },
            Err(e) => {
                warn!(context, error = %e, "liveness probe failed");
                self.fail_and_reconnect(Some(generation), &format!("{context}: {e}"))
                    .await;
            },
        }
    }
}

/// Run health checks (and keepalives, when enabled) until `cancel` fires.
pub fn spawn_health_monitor(
    manager: Arc<SessionManager>,
    policy: HealthPolicy,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut checks = tokio::time::interval_at(
            tokio::time::Instant::now() + policy.interval,
            policy.interval,
        );
        let keepalive_every = policy.keepalive.unwrap_or(Duration::from_secs(3_600));
        let mut keepalives = tokio::time::interval_at(
            tokio::time::Instant::now() + keepalive_every,
            keepalive_every,
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = checks.tick() => {
                    manager.health_check(&policy).await;
                },
                _ = keepalives.tick(), if policy.keepalive.is_some() => {
                    manager.keepalive().await;
                },
            }
        }
        debug!("health monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::manager::ManagerOptions,
        linkgate_channels::{
            DriverEvent, LinkState,
            testing::{Script, ScriptedFactory},
        },
        linkgate_sessions::SessionStatus::*,
    };

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn decision_table() {
        let p = HealthPolicy::default();
        assert_eq!(evaluate(&p, Uninitialized, false, false, 6 * MIN), HealthAction::Initialize);
        assert_eq!(evaluate(&p, Uninitialized, false, false, 4 * MIN), HealthAction::None);
        assert_eq!(evaluate(&p, Stopped, false, false, 60 * MIN), HealthAction::None);
        assert_eq!(evaluate(&p, Ready, true, false, 11 * MIN), HealthAction::Probe);
        assert_eq!(evaluate(&p, Ready, true, false, 9 * MIN), HealthAction::None);
        assert_eq!(evaluate(&p, Ready, true, false, 45 * MIN), HealthAction::Probe);
        assert_eq!(evaluate(&p, QrPending, true, false, 31 * MIN), HealthAction::ForceReconnect);
        assert_eq!(evaluate(&p, QrPending, true, false, 29 * MIN), HealthAction::None);
        assert_eq!(evaluate(&p, Disconnected, true, true, 31 * MIN), HealthAction::None);
    }

    fn manager(script: &Arc<Script>) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(ScriptedFactory::new(Arc::clone(script))),
            ManagerOptions::default(),
            None,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn idle_probe_failure_triggers_reconnect() {
        let script = Script::new();
        script.on_start(vec![DriverEvent::Authenticated, DriverEvent::Ready {
            identity: None,
        }]);
        let manager = manager(&script);
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        let policy = HealthPolicy::default();
        tokio::time::advance(11 * MIN).await;
        script.set_probe(Ok(LinkState::Connected));
        assert_eq!(manager.health_check(&policy).await, HealthAction::Probe);
        assert_eq!(manager.status().await, Ready);

        // the probe touched the clock, so the next pass is quiet
        assert_eq!(manager.health_check(&policy).await, HealthAction::None);

        tokio::time::advance(11 * MIN).await;
        script.set_probe(Ok(LinkState::Unpaired));
        assert_eq!(manager.health_check(&policy).await, HealthAction::Probe);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, Disconnected);
        assert_eq!(snapshot.reconnect_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_initializes_idle_process() {
        let script = Script::new();
        let manager = manager(&script);
        let cancel = CancellationToken::new();
        let monitor = spawn_health_monitor(
            Arc::clone(&manager),
            HealthPolicy::default(),
            cancel.clone(),
        );

        tokio::time::sleep(6 * MIN + Duration::from_secs(1)).await;
        assert_eq!(manager.status().await, Initializing);
        assert_eq!(Script::count(&script.created), 1);

        cancel.cancel();
        monitor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_pairing_is_forced_to_reconnect() {
        let script = Script::new();
        script.on_start(vec![DriverEvent::PairingRequired { code: "c".into() }]);
        let manager = manager(&script);
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        tokio::time::advance(31 * MIN).await;
        let action = manager.health_check(&HealthPolicy::default()).await;
        assert_eq!(action, HealthAction::ForceReconnect);
        let snapshot = manager.snapshot().await;
        assert_eq!(snapshot.status, Disconnected);
        assert!(snapshot.pending_reconnect.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn keepalive_touches_on_success() {
        let script = Script::new();
        script.on_start(vec![DriverEvent::Authenticated, DriverEvent::Ready {
            identity: None,
        }]);
        let manager = manager(&script);
        manager.start().await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        tokio::time::advance(Duration::from_secs(90)).await;
        manager.keepalive().await;
        assert_eq!(Script::count(&script.probes), 1);
        let (status, _, _, idle) = manager.liveness_view().await;
        assert_eq!(status, Ready);
        assert_eq!(idle, Duration::ZERO);
    }
}
