//! Structured error types for the outbox.
//!
//! `OutboxError` is only ever returned synchronously: from configuration
//! validation, from dispatcher construction, and from the writer's enqueue
//! calls. Handler failures never surface here. The dispatcher converts them
//! into retry or archival state on the queue entry instead.
//!
//! # The Error Boundary Rule
//!
//! > **No handler error ever reaches the producer.**
//!
//! - `anyhow` is internal transport (ergonomic for handlers and stores)
//! - the Failed bucket of the store is the only externalized delivery failure

use thiserror::Error;

/// Errors returned by the outbox's synchronous surfaces.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Dispatcher configuration is malformed.
    ///
    /// Raised at startup (config loading or dispatcher construction), never at tick time.
    #[error("invalid outbox configuration: {message}")]
    Config {
        /// What was wrong with the configuration.
        message: String,
    },

    /// The envelope handed to enqueue is malformed.
    #[error("invalid envelope: {message}")]
    InvalidEnvelope {
        /// Which field was rejected.
        message: String,
    },

    /// A typed payload could not be encoded into, or decoded from, JSON.
    #[error("payload serialization failed: {0}")]
    Payload(#[from] serde_json::Error),

    /// The backing store failed while enqueuing.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl OutboxError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        OutboxError::Config {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_envelope(message: impl Into<String>) -> Self {
        OutboxError::InvalidEnvelope {
            message: message.into(),
        }
    }

    /// Whether this error was caused by the caller's input rather than the store.
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            OutboxError::Config { .. } | OutboxError::InvalidEnvelope { .. } | OutboxError::Payload(_)
        )
    }
}

/// Result type alias using [`OutboxError`].
pub type OutboxResult<T> = Result<T, OutboxError>;
