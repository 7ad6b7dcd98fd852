//! Testing utilities for outbox consumers and dispatchers.
//!
//! Instrumented handlers that record how the dispatcher drives them, plus a
//! polling helper for asserting on asynchronous delivery.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! outbox = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use outbox::testing::{wait_for, RecordingHandler};
//!
//! let recorder = RecordingHandler::new("order.placed");
//! let registry = HandlerRegistry::new().with_handler(recorder.clone());
//! let dispatcher = OutboxDispatcher::new(store, registry, config)?;
//! dispatcher.start();
//!
//! writer.enqueue(Envelope::new("order.placed", "order", "o-1", json!({}))).await?;
//!
//! assert!(wait_for(|| recorder.count() == 1, Duration::from_secs(2)).await);
//! ```
//!
//! Every handler is a cheap `Clone` over shared state: register one clone and
//! keep another for assertions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tokio::time::Instant;

use crate::envelope::Envelope;
use crate::handler::OutboxHandler;

/// Poll `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition was met.
pub async fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Ordered log of labelled handler calls shared across handlers.
///
/// Lets a test assert on call order across a whole handler group.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, label: impl Into<String>) {
        self.calls.lock().unwrap().push(label.into());
    }

    /// All labels in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Default)]
struct Label {
    log: Option<CallLog>,
    name: String,
}

impl Label {
    fn record(&self) {
        if let Some(log) = &self.log {
            log.push(self.name.clone());
        }
    }
}

/// Handler that succeeds and records every envelope it receives.
#[derive(Debug, Clone)]
pub struct RecordingHandler {
    event_type: String,
    deliveries: Arc<Mutex<Vec<Envelope>>>,
    label: Label,
}

impl RecordingHandler {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            deliveries: Arc::default(),
            label: Label::default(),
        }
    }

    /// Also append `name` to `log` on every call.
    pub fn with_log(mut self, log: &CallLog, name: impl Into<String>) -> Self {
        self.label = Label {
            log: Some(log.clone()),
            name: name.into(),
        };
        self
    }

    /// Envelopes received, in delivery order.
    pub fn deliveries(&self) -> Vec<Envelope> {
        self.deliveries.lock().unwrap().clone()
    }

    /// Aggregate ids received, in delivery order.
    pub fn aggregate_ids(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|envelope| envelope.aggregate_id().to_string())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }
}

#[async_trait]
impl OutboxHandler for RecordingHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        self.label.record();
        self.deliveries.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Handler that fails its first `failures` calls and succeeds afterwards.
#[derive(Debug, Clone)]
pub struct FlakyHandler {
    event_type: String,
    failures: usize,
    calls: Arc<AtomicUsize>,
    label: Label,
}

impl FlakyHandler {
    pub fn new(event_type: impl Into<String>, failures: usize) -> Self {
        Self {
            event_type: event_type.into(),
            failures,
            calls: Arc::default(),
            label: Label::default(),
        }
    }

    /// Also append `name` to `log` on every call.
    pub fn with_log(mut self, log: &CallLog, name: impl Into<String>) -> Self {
        self.label = Label {
            log: Some(log.clone()),
            name: name.into(),
        };
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for FlakyHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        self.label.record();
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            bail!("flaky failure {} of {}", call, self.failures);
        }
        Ok(())
    }
}

/// Handler that always fails.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    event_type: String,
    message: String,
    calls: Arc<AtomicUsize>,
}

impl FailingHandler {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            message: "handler always fails".to_string(),
            calls: Arc::default(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for FailingHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        bail!("{}", self.message)
    }
}

/// Handler that sleeps on every call and counts overlapping invocations.
///
/// `overlaps()` stays 0 as long as no call starts while another is running.
#[derive(Debug, Clone)]
pub struct SlowHandler {
    event_type: String,
    delay: Duration,
    calls: Arc<AtomicUsize>,
    active: Arc<AtomicUsize>,
    overlaps: Arc<AtomicUsize>,
}

impl SlowHandler {
    pub fn new(event_type: impl Into<String>, delay: Duration) -> Self {
        Self {
            event_type: event_type.into(),
            delay,
            calls: Arc::default(),
            active: Arc::default(),
            overlaps: Arc::default(),
        }
    }

    /// Calls started so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that started while another call was still running.
    pub fn overlaps(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OutboxHandler for SlowHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, _envelope: &Envelope) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
