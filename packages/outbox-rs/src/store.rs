//! Queue and failed-archive storage.
//!
//! The store owns every [`QueueEntry`] and is the only place entries are
//! mutated. Callers receive clones; the underlying collections are never
//! exposed.
//!
//! # Due-entry ordering
//!
//! [`OutboxStore::due_entries`] returns entries ordered by:
//! 1. `priority` descending
//! 2. `next_attempt_at` ascending
//! 3. `created_at` ascending
//!
//! The dispatcher processes entries in exactly this order, so priority always
//! dominates time.
//!
//! # Implementer Notes
//!
//! - `insert` must perform the dedup check and the insert in one critical section
//! - `mark_attempt` must be atomic per entry; it races with concurrent enqueues
//! - Never hold a lock across an `.await`

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::envelope::{EntryId, Envelope};

/// Status of a queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum EntryStatus {
    /// Waiting for its next delivery attempt.
    #[default]
    Queued,
    /// Retries exhausted. Terminal.
    Failed,
}

/// Mutable wrapper around one envelope, owned by the store.
#[derive(Debug, Clone, Serialize)]
pub struct QueueEntry {
    pub envelope: Envelope,
    /// Failed delivery attempts so far.
    pub attempts: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: DateTime<Utc>,
    pub status: EntryStatus,
    /// Error recorded by the most recent failed attempt.
    pub last_error: Option<String>,
    /// When the entry was moved to the failed archive.
    pub archived_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// Wrap a freshly enqueued envelope: no attempts, due at `deliver_after`.
    pub fn new(envelope: Envelope) -> Self {
        let next_attempt_at = envelope.deliver_after();
        Self {
            envelope,
            attempts: 0,
            next_attempt_at,
            status: EntryStatus::Queued,
            last_error: None,
            archived_at: None,
        }
    }

    pub fn id(&self) -> EntryId {
        self.envelope.id()
    }

    pub fn is_queued(&self) -> bool {
        self.status == EntryStatus::Queued
    }

    pub fn is_failed(&self) -> bool {
        self.status == EntryStatus::Failed
    }

    /// Whether the entry is queued and its next attempt time has arrived.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_queued() && self.next_attempt_at <= now
    }
}

/// What happened during one delivery attempt of an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// Every handler succeeded (or none was registered). The entry is removed.
    Delivered,
    /// A handler failed and attempts remain. The entry stays queued.
    Retry {
        error: String,
        next_attempt_at: DateTime<Utc>,
    },
    /// A handler failed and no attempts remain. The entry is archived.
    Exhausted { error: String },
}

/// Result of inserting an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The entry is now queued.
    Inserted,
    /// A queued entry with the same id or dedup key already exists; nothing was inserted.
    Duplicate { existing: EntryId },
}

/// Read-only counts for diagnostics and alerting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxSnapshot {
    pub queued: usize,
    pub failed: usize,
}

/// Storage for queue entries.
///
/// Only the writer inserts entries, and only the dispatcher records attempts.
/// Both go exclusively through this trait.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Add a new queued entry, unless its id or dedup key is already queued.
    async fn insert(&self, entry: QueueEntry) -> Result<InsertOutcome>;

    /// Whether a queued entry carries this dedup key.
    async fn exists_queued_by_dedup_key(&self, key: &str) -> Result<bool>;

    /// Queued entries with `next_attempt_at <= now`, in delivery order.
    async fn due_entries(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>>;

    /// Record the outcome of a delivery attempt.
    ///
    /// Returns the entry as it now stands, or `None` if it was removed or
    /// is unknown to the store.
    async fn mark_attempt(&self, id: EntryId, outcome: AttemptOutcome) -> Result<Option<QueueEntry>>;

    /// Queued and failed counts.
    async fn snapshot(&self) -> Result<OutboxSnapshot>;

    /// Archived entries, oldest archival first.
    async fn failed_entries(&self) -> Result<Vec<QueueEntry>>;
}

/// A queued entry plus its insertion sequence, used as the final sort tiebreak.
#[derive(Debug)]
struct Slot {
    entry: QueueEntry,
    seq: u64,
}

#[derive(Debug, Default)]
struct StoreState {
    queued: HashMap<EntryId, Slot>,
    queued_by_dedup_key: HashMap<String, EntryId>,
    failed: Vec<QueueEntry>,
    next_seq: u64,
}

/// In-memory [`OutboxStore`] guarded by a single mutex.
#[derive(Debug, Default)]
pub struct InMemoryOutboxStore {
    state: Mutex<StoreState>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self, operation: &'static str) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("outbox store lock poisoned during {}", operation))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn insert(&self, entry: QueueEntry) -> Result<InsertOutcome> {
        let mut guard = self.lock("insert")?;
        let state = &mut *guard;

        // Re-enqueuing a clone of a queued envelope must not reset its attempt state
        if state.queued.contains_key(&entry.id()) {
            return Ok(InsertOutcome::Duplicate { existing: entry.id() });
        }

        if let Some(key) = entry.envelope.dedup_key() {
            if let Some(existing) = state.queued_by_dedup_key.get(key) {
                return Ok(InsertOutcome::Duplicate { existing: *existing });
            }
            state.queued_by_dedup_key.insert(key.to_string(), entry.id());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.queued.insert(entry.id(), Slot { entry, seq });

        Ok(InsertOutcome::Inserted)
    }

    async fn exists_queued_by_dedup_key(&self, key: &str) -> Result<bool> {
        let state = self.lock("dedup lookup")?;
        Ok(state.queued_by_dedup_key.contains_key(key))
    }

    async fn due_entries(&self, now: DateTime<Utc>) -> Result<Vec<QueueEntry>> {
        let state = self.lock("due scan")?;

        let mut due: Vec<&Slot> = state
            .queued
            .values()
            .filter(|slot| slot.entry.is_due(now))
            .collect();

        due.sort_by(|a, b| {
            b.entry
                .envelope
                .priority()
                .cmp(&a.entry.envelope.priority())
                .then_with(|| a.entry.next_attempt_at.cmp(&b.entry.next_attempt_at))
                .then_with(|| {
                    a.entry
                        .envelope
                        .created_at()
                        .cmp(&b.entry.envelope.created_at())
                })
                .then_with(|| a.seq.cmp(&b.seq))
        });

        Ok(due.into_iter().map(|slot| slot.entry.clone()).collect())
    }

    async fn mark_attempt(&self, id: EntryId, outcome: AttemptOutcome) -> Result<Option<QueueEntry>> {
        let mut guard = self.lock("mark attempt")?;
        let state = &mut *guard;

        // Failed entries live only in the archive, so they never match here
        if !state.queued.contains_key(&id) {
            return Ok(None);
        }

        match outcome {
            AttemptOutcome::Delivered => {
                if let Some(slot) = state.queued.remove(&id) {
                    if let Some(key) = slot.entry.envelope.dedup_key() {
                        state.queued_by_dedup_key.remove(key);
                    }
                }
                Ok(None)
            }
            AttemptOutcome::Retry {
                error,
                next_attempt_at,
            } => {
                let Some(slot) = state.queued.get_mut(&id) else {
                    return Ok(None);
                };
                slot.entry.attempts += 1;
                slot.entry.next_attempt_at = next_attempt_at;
                slot.entry.last_error = Some(error);
                Ok(Some(slot.entry.clone()))
            }
            AttemptOutcome::Exhausted { error } => {
                let Some(Slot { mut entry, .. }) = state.queued.remove(&id) else {
                    return Ok(None);
                };
                if let Some(key) = entry.envelope.dedup_key() {
                    state.queued_by_dedup_key.remove(key);
                }
                entry.attempts += 1;
                entry.status = EntryStatus::Failed;
                entry.last_error = Some(error);
                entry.archived_at = Some(Utc::now());
                state.failed.push(entry.clone());
                Ok(Some(entry))
            }
        }
    }

    async fn snapshot(&self) -> Result<OutboxSnapshot> {
        let state = self.lock("snapshot")?;
        Ok(OutboxSnapshot {
            queued: state.queued.len(),
            failed: state.failed.len(),
        })
    }

    async fn failed_entries(&self) -> Result<Vec<QueueEntry>> {
        let state = self.lock("failed listing")?;
        Ok(state.failed.clone())
    }
}
