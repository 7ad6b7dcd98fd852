//! Immutable event envelopes.
//!
//! An [`Envelope`] describes one occurrence of a domain event: what happened
//! (`event_type`), to which subject (`aggregate_type` / `aggregate_id`), the
//! opaque JSON payload, and the scheduling metadata the dispatcher uses
//! (`priority`, `deliver_after`, optional `dedup_key`).
//!
//! # Example
//!
//! ```ignore
//! use outbox::Envelope;
//! use std::time::Duration;
//!
//! let envelope = Envelope::builder(
//!     "course.published",
//!     "course",
//!     course_id.to_string(),
//!     serde_json::json!({ "title": "Rust 101" }),
//! )
//! .dedup_key(format!("course.published:{}", course_id))
//! .priority(10)
//! .deliver_in(Duration::from_secs(5))
//! .build();
//!
//! writer.enqueue(envelope).await?;
//! ```

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::error::OutboxResult;

/// Unique identifier of an envelope and of the queue entry wrapping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(Uuid);

impl EntryId {
    /// Create a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for EntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for EntryId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Immutable description of one event occurrence.
///
/// Fields are private; construct with [`Envelope::builder`] or
/// [`Envelope::new`] and read through the accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: EntryId,
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    priority: i32,
    deliver_after: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

impl Envelope {
    /// Build an envelope with default scheduling (priority 0, deliver now).
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self::builder(event_type, aggregate_type, aggregate_id, payload).build()
    }

    /// Start building an envelope from its required fields.
    pub fn builder(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            payload,
            dedup_key: None,
            priority: 0,
            deliver_after: None,
        }
    }

    /// Start building an envelope whose payload is serialized from a typed value.
    pub fn encode<T: Serialize>(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        payload: &T,
    ) -> OutboxResult<EnvelopeBuilder> {
        let payload = serde_json::to_value(payload)?;
        Ok(Self::builder(event_type, aggregate_type, aggregate_id, payload))
    }

    /// Decode the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> OutboxResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    // Getters
    pub fn id(&self) -> EntryId {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn dedup_key(&self) -> Option<&str> {
        self.dedup_key.as_deref()
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn deliver_after(&self) -> DateTime<Utc> {
        self.deliver_after
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}

/// Fluent builder for [`Envelope`].
///
/// Building is pure and infallible: the required fields are taken up front,
/// everything else has a default.
#[derive(Debug, Clone)]
#[must_use = "call .build() to produce the envelope"]
pub struct EnvelopeBuilder {
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    payload: serde_json::Value,
    dedup_key: Option<String>,
    priority: i32,
    deliver_after: Option<DateTime<Utc>>,
}

impl EnvelopeBuilder {
    /// Collapse duplicate enqueues of the same logical event while one is pending.
    pub fn dedup_key(mut self, key: impl Into<String>) -> Self {
        self.dedup_key = Some(key.into());
        self
    }

    /// Higher values are delivered first. Defaults to 0.
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Earliest time the envelope may be delivered. Defaults to creation time.
    pub fn deliver_after(mut self, at: DateTime<Utc>) -> Self {
        self.deliver_after = Some(at);
        self
    }

    /// Delay delivery by `delay` from now.
    pub fn deliver_in(self, delay: Duration) -> Self {
        self.deliver_after(offset(Utc::now(), delay))
    }

    /// Produce the envelope, assigning its id and creation time.
    pub fn build(self) -> Envelope {
        let created_at = Utc::now();
        Envelope {
            id: EntryId::new(),
            event_type: self.event_type,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            payload: self.payload,
            dedup_key: self.dedup_key,
            priority: self.priority,
            deliver_after: self.deliver_after.unwrap_or(created_at),
            created_at,
        }
    }
}

/// `at + delay`, saturating at the latest representable time.
pub(crate) fn offset(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| at.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
