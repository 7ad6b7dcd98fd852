//! # Outbox
//!
//! In-process transactional outbox: reliable, asynchronous, at-least-once
//! delivery of domain events to registered handlers, with retries, backoff,
//! priorities and a failed archive.
//!
//! ## Architecture
//!
//! ```text
//! Producer (same unit of work as the state change)
//!     │
//!     ▼ enqueue()
//! OutboxWriter ──► OutboxStore (queued entries, failed archive)
//!                       ▲
//!                       │ due_entries() / mark_attempt()
//!                       │
//! OutboxDispatcher (periodic, non-reentrant tick)
//!     │
//!     └─► HandlerRegistry ─► OutboxHandler.handle(&envelope)
//! ```
//!
//! ## Key Invariants
//!
//! 1. **At-least-once delivery** - Handlers must be idempotent
//! 2. **Priority dominates time** - Higher priority is always delivered first
//! 3. **No overlapping ticks** - Entries are processed strictly one at a time
//! 4. **Dedup while pending** - One queued entry per dedup key
//! 5. **Failed is terminal** - Archived entries are never retried automatically
//! 6. **Handler errors stay internal** - Producers never see them
//!
//! ## Example
//!
//! ```ignore
//! use outbox::{
//!     DispatcherConfig, Envelope, HandlerRegistry, InMemoryOutboxStore, OutboxDispatcher,
//!     OutboxStore, OutboxWriter,
//! };
//! use std::sync::Arc;
//!
//! let store: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());
//! let writer = OutboxWriter::new(store.clone());
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register_fn("account.created", |envelope| async move {
//!     send_welcome_email(envelope.aggregate_id()).await
//! });
//!
//! let dispatcher = OutboxDispatcher::new(store, registry, DispatcherConfig::from_env()?)?;
//! dispatcher.start();
//!
//! let envelope = Envelope::builder("account.created", "account", account_id, payload)
//!     .dedup_key(format!("account.created:{}", account_id))
//!     .build();
//! writer.enqueue(envelope).await?;
//!
//! dispatcher.shutdown().await;
//! ```

mod backoff;
mod config;
mod dispatcher;
mod envelope;
mod error;
mod handler;
mod store;
mod writer;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

mod delivery_tests;

pub use backoff::BackoffSeries;
pub use config::{
    DispatcherConfig, ENV_BACKOFF_SERIES, ENV_DISPATCH_INTERVAL_MS, ENV_ENABLED, ENV_MAX_ATTEMPTS,
};
pub use dispatcher::{DispatcherState, OutboxDispatcher, TickOutcome, TickReport};
pub use envelope::{EntryId, Envelope, EnvelopeBuilder};
pub use error::{OutboxError, OutboxResult};
pub use handler::{FnHandler, HandlerRegistry, OutboxHandler};
pub use store::{
    AttemptOutcome, EntryStatus, InMemoryOutboxStore, InsertOutcome, OutboxSnapshot, OutboxStore,
    QueueEntry,
};
pub use writer::{EnqueueResult, OutboxWriter};

// Re-export for implementing OutboxHandler / OutboxStore without a direct dependency
pub use async_trait::async_trait;
