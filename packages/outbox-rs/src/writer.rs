//! Producer-facing enqueue API.
//!
//! The writer is the only way envelopes enter the outbox. Call it from the
//! same unit of work as the state change the event describes; delivery then
//! happens asynchronously on the dispatcher.

use std::sync::Arc;

use tracing::debug;

use crate::envelope::{EntryId, Envelope};
use crate::error::{OutboxError, OutboxResult};
use crate::store::{InsertOutcome, OutboxStore, QueueEntry};

/// Result of a single enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResult {
    /// A new queued entry was created.
    Enqueued(EntryId),
    /// An entry with the same dedup key is already queued; nothing was stored.
    Duplicate,
}

impl EnqueueResult {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, EnqueueResult::Enqueued(_))
    }

    pub fn entry_id(&self) -> Option<EntryId> {
        match self {
            EnqueueResult::Enqueued(id) => Some(*id),
            EnqueueResult::Duplicate => None,
        }
    }
}

/// Enqueues envelopes into an [`OutboxStore`].
///
/// Cheap to clone; every clone writes to the same store.
#[derive(Clone)]
pub struct OutboxWriter {
    store: Arc<dyn OutboxStore>,
}

impl OutboxWriter {
    pub fn new(store: Arc<dyn OutboxStore>) -> Self {
        Self { store }
    }

    /// Enqueue one envelope.
    ///
    /// If the envelope carries a dedup key and an entry with the same key is
    /// still queued, this is a no-op returning [`EnqueueResult::Duplicate`].
    /// Dedup only covers pending entries: once an entry has been delivered or
    /// archived, the same key enqueues a fresh entry.
    pub async fn enqueue(&self, envelope: Envelope) -> OutboxResult<EnqueueResult> {
        validate(&envelope)?;

        if let Some(key) = envelope.dedup_key() {
            if self.store.exists_queued_by_dedup_key(key).await? {
                debug!(
                    event_type = %envelope.event_type(),
                    dedup_key = %key,
                    "duplicate envelope skipped"
                );
                return Ok(EnqueueResult::Duplicate);
            }
        }

        let id = envelope.id();
        let event_type = envelope.event_type().to_string();

        // The store re-checks the dedup key under its lock; a concurrent
        // enqueue may have won since the lookup above.
        match self.store.insert(QueueEntry::new(envelope)).await? {
            InsertOutcome::Inserted => {
                debug!(entry_id = %id, event_type = %event_type, "envelope enqueued");
                Ok(EnqueueResult::Enqueued(id))
            }
            InsertOutcome::Duplicate { existing } => {
                debug!(
                    event_type = %event_type,
                    existing_entry_id = %existing,
                    "duplicate envelope skipped"
                );
                Ok(EnqueueResult::Duplicate)
            }
        }
    }

    /// Enqueue several envelopes in order.
    ///
    /// Every envelope is validated before anything is stored, so one malformed
    /// envelope rejects the whole batch. Dedup applies against entries enqueued
    /// earlier in the same batch.
    pub async fn enqueue_many<I>(&self, envelopes: I) -> OutboxResult<Vec<EnqueueResult>>
    where
        I: IntoIterator<Item = Envelope>,
    {
        let envelopes: Vec<Envelope> = envelopes.into_iter().collect();
        for envelope in &envelopes {
            validate(envelope)?;
        }

        let mut results = Vec::with_capacity(envelopes.len());
        for envelope in envelopes {
            results.push(self.enqueue(envelope).await?);
        }
        Ok(results)
    }
}

fn validate(envelope: &Envelope) -> OutboxResult<()> {
    let required = [
        ("event_type", envelope.event_type()),
        ("aggregate_type", envelope.aggregate_type()),
        ("aggregate_id", envelope.aggregate_id()),
    ];
    for (field, value) in required {
        if value.trim().is_empty() {
            return Err(OutboxError::invalid_envelope(format!("{} must not be empty", field)));
        }
    }

    if let Some(key) = envelope.dedup_key() {
        if key.trim().is_empty() {
            return Err(OutboxError::invalid_envelope("dedup_key must not be empty when set"));
        }
    }

    Ok(())
}
