//! Scripted driver for exercising the session owner without a network.
//!
//! Every instance created by a [`ScriptedFactory`] shares one [`Script`]:
//! tests queue send outcomes, set probe results, and inject events into the
//! most recently started instance.

use std::{
    collections::VecDeque,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    driver::{
        ChannelDriver, ContactInfo, DriverEvent, DriverFactory, EventSink, LinkState,
        MediaAttachment,
    },
    error::DriverError,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared, mutable behaviour for scripted driver instances.
pub struct Script {
    on_start: Mutex<Vec<DriverEvent>>,
    start_errors: Mutex<VecDeque<DriverError>>,
    send_results: Mutex<VecDeque<Result<String, DriverError>>>,
    probe_result: Mutex<Result<LinkState, DriverError>>,
    contact: Mutex<Result<ContactInfo, DriverError>>,
    sink: Mutex<Option<EventSink>>,
    sent: Mutex<Vec<(String, String)>>,
    pub created: AtomicUsize,
    pub started: AtomicUsize,
    pub shutdowns: AtomicUsize,
    pub logouts: AtomicUsize,
    pub send_attempts: AtomicUsize,
    pub probes: AtomicUsize,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            on_start: Mutex::new(Vec::new()),
            start_errors: Mutex::new(VecDeque::new()),
            send_results: Mutex::new(VecDeque::new()),
            probe_result: Mutex::new(Ok(LinkState::Connected)),
            contact: Mutex::new(Err(DriverError::ContactNotFound("scripted".into()))),
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
            started: AtomicUsize::new(0),
            shutdowns: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            send_attempts: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }
}

impl Script {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Events every instance emits right after `start`.
    pub fn on_start(&self, events: Vec<DriverEvent>) {
        *lock(&self.on_start) = events;
    }

    /// Make the next `start` call fail.
    pub fn fail_next_start(&self, err: DriverError) {
        lock(&self.start_errors).push_back(err);
    }

    /// Queue the outcome of the next send attempt. An empty queue succeeds.
    pub fn push_send_result(&self, result: Result<String, DriverError>) {
        lock(&self.send_results).push_back(result);
    }

    pub fn set_probe(&self, result: Result<LinkState, DriverError>) {
        *lock(&self.probe_result) = result;
    }

    pub fn set_contact(&self, result: Result<ContactInfo, DriverError>) {
        *lock(&self.contact) = result;
    }

    /// Deliver an event through the latest started instance.
    pub fn emit(&self, event: DriverEvent) -> bool {
        lock(&self.sink)
            .as_ref()
            .is_some_and(|sink| sink.send(event).is_ok())
    }

    /// `(to, text)` pairs of successful text sends.
    pub fn sent(&self) -> Vec<(String, String)> {
        lock(&self.sent).clone()
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ScriptedFactory {
    script: Arc<Script>,
}

impl ScriptedFactory {
    pub fn new(script: Arc<Script>) -> Self {
        Self { script }
    }
}

impl DriverFactory for ScriptedFactory {
    fn id(&self) -> &str {
        "scripted"
    }

    fn create(&self) -> Arc<dyn ChannelDriver> {
        self.script.created.fetch_add(1, Ordering::SeqCst);
        Arc::new(ScriptedDriver {
            script: Arc::clone(&self.script),
        })
    }
}

pub struct ScriptedDriver {
    script: Arc<Script>,
}

impl ScriptedDriver {
    fn next_send(&self) -> Result<String, DriverError> {
        let n = self.script.send_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.script.send_results)
            .pop_front()
            .unwrap_or_else(|| Ok(format!("scripted-{n}")))
    }
}

#[async_trait]
impl ChannelDriver for ScriptedDriver {
    fn id(&self) -> &str {
        "scripted"
    }

    async fn start(&self, events: EventSink) -> Result<(), DriverError> {
        self.script.started.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = lock(&self.script.start_errors).pop_front() {
            return Err(err);
        }
        for event in lock(&self.script.on_start).iter() {
            let _ = events.send(event.clone());
        }
        *lock(&self.script.sink) = Some(events);
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), DriverError> {
        self.script.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logout(&self) -> Result<(), DriverError> {
        self.script.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn probe(&self) -> Result<LinkState, DriverError> {
        self.script.probes.fetch_add(1, Ordering::SeqCst);
        lock(&self.script.probe_result).clone()
    }

    async fn send_text(&self, to: &str, text: &str) -> Result<String, DriverError> {
        let id = self.next_send()?;
        lock(&self.script.sent).push((to.to_string(), text.to_string()));
        Ok(id)
    }

    async fn send_media(&self, _to: &str, _media: &MediaAttachment) -> Result<String, DriverError> {
        self.next_send()
    }

    async fn contact(&self, _address: &str) -> Result<ContactInfo, DriverError> {
        lock(&self.script.contact).clone()
    }
}
