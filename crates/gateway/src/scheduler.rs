//! Reconnection timing: exponential backoff and the single pending timer.

use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use {
    tokio::{sync::Mutex, task::AbortHandle},
    tracing::debug,
};

use linkgate_config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// The attempt counter wraps back to 1 after this many.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(cfg: &ReconnectConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            backoff_factor: cfg.backoff_factor,
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            max_attempts: cfg.max_attempts.max(1),
        }
    }
}

impl ReconnectPolicy {
    /// `min(base * factor^(attempt - 1), max)`, with `attempt` starting at 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.backoff_factor.max(1.0).powi(exponent);
        let max_ms = self.max_delay.as_millis() as f64;
        let ms = (self.base_delay.as_millis() as f64 * factor).min(max_ms);
        Duration::from_millis(ms as u64)
    }
}

struct PendingTimer {
    id: u64,
    handle: AbortHandle,
}

/// Owns at most one pending reconnection timer.
///
/// Scheduling replaces (and aborts) whatever was pending. A timer removes
/// itself from the slot before running its callback, so the callback can
/// schedule the next timer without cancelling itself.
#[derive(Default)]
pub struct ReconnectScheduler {
    slot: Mutex<Option<PendingTimer>>,
    next_id: AtomicU64,
}

impl ReconnectScheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Run `fire` after `delay`, replacing any pending timer. Returns the
    /// timer id.
    pub async fn schedule<F, Fut>(self: &Arc<Self>, delay: Duration, fire: F) -> u64
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let mut slot = self.slot.lock().await;

        let this = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slot = this.slot.lock().await;
                match slot.as_ref() {
                    Some(pending) if pending.id == id => *slot = None,
                    _ => return,
                }
            }
            debug!(timer = id, "reconnect timer fired");
            fire().await;
        });

        if let Some(prev) = slot.replace(PendingTimer {
            id,
            handle: task.abort_handle(),
        }) {
            prev.handle.abort();
            debug!(timer = prev.id, "replaced pending reconnect timer");
        }
        id
    }

    /// Abort the pending timer. Returns whether one was pending.
    pub async fn cancel(&self) -> bool {
        match self.slot.lock().await.take() {
            Some(pending) => {
                pending.handle.abort();
                debug!(timer = pending.id, "reconnect timer cancelled");
                true
            },
            None => false,
        }
    }

    pub async fn is_pending(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, std::sync::atomic::AtomicUsize};

    #[test]
    fn backoff_grows_then_caps() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_millis(5_000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(7_500));
        assert_eq!(policy.delay_for(3), Duration::from_millis(11_250));
        assert_eq!(policy.delay_for(10), Duration::from_millis(192_216));
        assert_eq!(policy.delay_for(11), Duration::from_millis(288_325));
        assert_eq!(policy.delay_for(12), Duration::from_secs(300));
        assert_eq!(policy.delay_for(u32::MAX), Duration::from_secs(300));

        let mut prev = Duration::ZERO;
        for attempt in 1..=20 {
            let delay = policy.delay_for(attempt);
            assert!(delay >= prev);
            prev = delay;
        }
    }

    #[test]
    fn attempt_zero_uses_base_delay() {
        assert_eq!(
            ReconnectPolicy::default().delay_for(0),
            Duration::from_millis(5_000)
        );
    }

    fn counter_task(
        hits: &Arc<AtomicUsize>,
    ) -> impl FnOnce() -> futures::future::Ready<()> + use<> {
        let hits = Arc::clone(hits);
        move || {
            hits.fetch_add(1, Ordering::SeqCst);
            futures::future::ready(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn new_timer_replaces_pending_one() {
        let scheduler = ReconnectScheduler::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        scheduler
            .schedule(Duration::from_secs(5), counter_task(&first))
            .await;
        scheduler
            .schedule(Duration::from_secs(10), counter_task(&second))
            .await;

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert!(!scheduler.is_pending().await);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_timer_never_fires() {
        let scheduler = ReconnectScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));
        scheduler
            .schedule(Duration::from_secs(1), counter_task(&hits))
            .await;
        assert!(scheduler.cancel().await);
        assert!(!scheduler.cancel().await);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fired_timer_can_schedule_its_successor() {
        let scheduler = ReconnectScheduler::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let inner = Arc::clone(&scheduler);
        let inner_hits = Arc::clone(&hits);
        scheduler
            .schedule(Duration::from_secs(1), move || async move {
                inner_hits.fetch_add(1, Ordering::SeqCst);
                inner
                    .schedule(Duration::from_secs(1), counter_task(&inner_hits))
                    .await;
            })
            .await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
