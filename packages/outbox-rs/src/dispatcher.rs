//! Background delivery of queued envelopes.
//!
//! The `OutboxDispatcher` drives a periodic tick that:
//! - Loads due entries from the [`OutboxStore`] in priority/time order
//! - Runs the handlers registered for each entry's event type
//! - Removes delivered entries, reschedules failed ones with backoff,
//!   and archives entries that ran out of attempts
//!
//! # Architecture
//!
//! ```text
//! OutboxDispatcher
//!     │
//!     ├─► interval tick (non-reentrant)
//!     ├─► due_entries(now)            (OutboxStore)
//!     ├─► for each entry, in order:
//!     │       └─► handlers_for(type)  (HandlerRegistry)
//!     │               └─► handle(&envelope), sequentially
//!     └─► mark_attempt(id, outcome)   (OutboxStore)
//! ```
//!
//! Entries are processed strictly one after another, and a tick never starts
//! while another is still draining. This holds across `stop()`/`start()`
//! cycles and manual [`OutboxDispatcher::tick`] calls.
//!
//! There is no per-handler timeout. A handler that never returns stalls the
//! whole queue. A handler that panics counts as a failed attempt; the loop
//! keeps running.
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
//! let writer = OutboxWriter::new(store.clone());
//!
//! let dispatcher = OutboxDispatcher::new(store, registry, DispatcherConfig::from_env()?)?;
//! dispatcher.start();
//!
//! writer.enqueue(envelope).await?;
//!
//! // On shutdown
//! dispatcher.shutdown().await;
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::FutureExt;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DispatcherConfig;
use crate::envelope::{offset, Envelope};
use crate::error::OutboxResult;
use crate::handler::{HandlerRegistry, OutboxHandler};
use crate::store::{AttemptOutcome, OutboxSnapshot, OutboxStore, QueueEntry};

/// Lifecycle state of the background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatcherState {
    Stopped,
    Running,
}

/// Counts for one completed tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    /// Entries that were due when the tick began.
    pub due: usize,
    /// Entries removed after a successful attempt (or with no handlers).
    pub delivered: usize,
    /// Entries that failed and were rescheduled.
    pub rescheduled: usize,
    /// Entries that failed their last attempt and moved to the failed archive.
    pub archived: usize,
}

/// Result of calling [`OutboxDispatcher::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Delivery is disabled; nothing was touched.
    Disabled,
    /// Another tick was still in progress; this one did nothing.
    Skipped,
    /// The tick ran to completion.
    Completed(TickReport),
}

impl TickOutcome {
    pub fn report(&self) -> Option<TickReport> {
        match self {
            TickOutcome::Completed(report) => Some(*report),
            _ => None,
        }
    }
}

/// Disposition of a single entry after its attempt was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Delivered,
    Rescheduled,
    Archived,
}

/// Marks a tick as in progress. Cleared on drop, including on panic.
struct TickGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> TickGuard<'a> {
    /// Returns `None` if a tick is already in progress.
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    store: Arc<dyn OutboxStore>,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
    enabled: AtomicBool,
    tick_in_progress: AtomicBool,
    running: Mutex<Option<LoopHandle>>,
}

/// Periodically delivers due entries to their handlers.
///
/// Cheap to clone; all clones control the same loop.
#[derive(Clone)]
pub struct OutboxDispatcher {
    inner: Arc<Inner>,
}

impl OutboxDispatcher {
    /// Create a stopped dispatcher. Fails if `config` is invalid.
    pub fn new(
        store: Arc<dyn OutboxStore>,
        registry: HandlerRegistry,
        config: DispatcherConfig,
    ) -> OutboxResult<Self> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                registry: Arc::new(registry),
                enabled: AtomicBool::new(config.enabled),
                config,
                tick_in_progress: AtomicBool::new(false),
                running: Mutex::new(None),
            }),
        })
    }

    /// Start the background loop.
    ///
    /// Idempotent: calling it while running does nothing. Must be called from
    /// within a tokio runtime.
    pub fn start(&self) {
        let mut running = self.lock_running();

        if let Some(handle) = running.as_ref() {
            if !handle.task.is_finished() {
                debug!("outbox dispatcher already running");
                return;
            }
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), cancel.clone()));
        *running = Some(LoopHandle { cancel, task });

        info!(
            interval = ?self.inner.config.dispatch_interval,
            max_attempts = self.inner.config.max_attempts,
            enabled = self.is_enabled(),
            handlers = self.inner.registry.len(),
            "outbox dispatcher started"
        );
    }

    /// Stop scheduling ticks.
    ///
    /// Idempotent. A tick already in progress finishes normally; use
    /// [`shutdown`](Self::shutdown) to wait for it.
    pub fn stop(&self) {
        if let Some(handle) = self.lock_running().take() {
            handle.cancel.cancel();
            info!("outbox dispatcher stopping");
        }
    }

    /// Stop, then wait until the loop and any in-flight tick have finished.
    pub async fn shutdown(&self) {
        let handle = self.lock_running().take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                error!(error = %e, "outbox dispatcher loop ended abnormally");
            }
        }

        // A manual tick or a loop abandoned by an earlier stop() may still be draining
        while self.inner.tick_in_progress.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub fn state(&self) -> DispatcherState {
        match self.lock_running().as_ref() {
            Some(handle) if !handle.task.is_finished() => DispatcherState::Running,
            _ => DispatcherState::Stopped,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == DispatcherState::Running
    }

    /// Turn delivery on or off at runtime. While off, ticks leave every entry untouched.
    pub fn set_enabled(&self, enabled: bool) {
        let previous = self.inner.enabled.swap(enabled, Ordering::AcqRel);
        if previous != enabled {
            info!(enabled, "outbox delivery toggled");
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    /// Run one delivery pass now.
    ///
    /// Uses the same non-reentrancy guard as the background loop, so it
    /// returns [`TickOutcome::Skipped`] if a tick is already running.
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }

    /// Queued and failed counts.
    pub async fn snapshot(&self) -> Result<OutboxSnapshot> {
        self.inner.store.snapshot().await
    }

    /// Entries that exhausted their attempts.
    pub async fn failed_entries(&self) -> Result<Vec<QueueEntry>> {
        self.inner.store.failed_entries().await
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.inner.registry
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<LoopHandle>> {
        // The guarded value is a plain handle, still consistent after a panic elsewhere
        self.inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for OutboxDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxDispatcher")
            .field("state", &self.state())
            .field("enabled", &self.is_enabled())
            .field("config", &self.inner.config)
            .field("registry", &self.inner.registry)
            .finish()
    }
}

async fn run_loop(inner: Arc<Inner>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(inner.config.dispatch_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        // Not raced against cancellation: an in-flight tick always completes
        inner.tick().await;
    }

    info!("outbox dispatcher stopped");
}

impl Inner {
    async fn tick(&self) -> TickOutcome {
        if !self.enabled.load(Ordering::Acquire) {
            return TickOutcome::Disabled;
        }

        let Some(_guard) = TickGuard::acquire(&self.tick_in_progress) else {
            debug!("previous outbox tick still in progress, skipping");
            return TickOutcome::Skipped;
        };

        let due = match self.store.due_entries(Utc::now()).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "failed to load due outbox entries");
                return TickOutcome::Completed(TickReport::default());
            }
        };

        let mut report = TickReport {
            due: due.len(),
            ..TickReport::default()
        };
        if due.is_empty() {
            return TickOutcome::Completed(report);
        }

        debug!(count = due.len(), "processing due outbox entries");

        for entry in due {
            match self.process_entry(entry).await {
                Some(Disposition::Delivered) => report.delivered += 1,
                Some(Disposition::Rescheduled) => report.rescheduled += 1,
                Some(Disposition::Archived) => report.archived += 1,
                None => {}
            }
        }

        debug!(
            due = report.due,
            delivered = report.delivered,
            rescheduled = report.rescheduled,
            archived = report.archived,
            "outbox tick completed"
        );

        TickOutcome::Completed(report)
    }

    /// Attempt one entry and record the outcome. `None` if the store update failed.
    async fn process_entry(&self, entry: QueueEntry) -> Option<Disposition> {
        let id = entry.id();
        let event_type = entry.envelope.event_type();
        let handlers = self.registry.handlers_for(event_type);

        if handlers.is_empty() {
            debug!(entry_id = %id, event_type = %event_type, "no handlers registered, dropping entry");
        }

        let (outcome, disposition) = match run_handlers(handlers, &entry.envelope).await {
            Ok(()) => (AttemptOutcome::Delivered, Disposition::Delivered),
            Err(failure) => {
                let attempts = entry.attempts.saturating_add(1);
                let error = format!("{:#}", failure.error);

                if attempts >= self.config.max_attempts {
                    error!(
                        entry_id = %id,
                        event_type = %event_type,
                        handler_index = failure.index,
                        attempts,
                        error = %error,
                        "outbox entry exhausted retries, moving to failed"
                    );
                    (AttemptOutcome::Exhausted { error }, Disposition::Archived)
                } else {
                    let delay = self.config.backoff.delay_for(attempts);
                    let next_attempt_at = offset(Utc::now(), delay);
                    warn!(
                        entry_id = %id,
                        event_type = %event_type,
                        handler_index = failure.index,
                        attempts,
                        error = %error,
                        next_attempt_at = %next_attempt_at,
                        "outbox delivery failed, will retry"
                    );
                    (
                        AttemptOutcome::Retry {
                            error,
                            next_attempt_at,
                        },
                        Disposition::Rescheduled,
                    )
                }
            }
        };

        match self.store.mark_attempt(id, outcome).await {
            Ok(_) => {
                if disposition == Disposition::Delivered {
                    debug!(entry_id = %id, event_type = %event_type, "outbox entry delivered");
                }
                Some(disposition)
            }
            Err(e) => {
                error!(entry_id = %id, event_type = %event_type, error = %e, "failed to record outbox attempt");
                None
            }
        }
    }
}

struct HandlerFailure {
    index: usize,
    error: anyhow::Error,
}

/// Run handlers in order. The first failure stops the rest.
///
/// A panic is caught and reported as that handler's failure.
async fn run_handlers(
    handlers: &[Arc<dyn OutboxHandler>],
    envelope: &Envelope,
) -> std::result::Result<(), HandlerFailure> {
    for (index, handler) in handlers.iter().enumerate() {
        let result = match AssertUnwindSafe(handler.handle(envelope)).catch_unwind().await {
            Ok(inner) => inner,
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(
                    entry_id = %envelope.id(),
                    event_type = %envelope.event_type(),
                    handler_index = index,
                    panic = %panic_msg,
                    "outbox handler panicked"
                );
                Err(anyhow::anyhow!("handler panicked: {}", panic_msg))
            }
        };
        result.map_err(|error| HandlerFailure { index, error })?;
    }
    Ok(())
}

fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
