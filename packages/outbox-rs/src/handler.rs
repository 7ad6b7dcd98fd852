//! Consumers of outbox events and the registry that binds them to event types.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::envelope::Envelope;

/// A consumer of one event type.
///
/// Delivery is at-least-once. A handler may see the same envelope more than
/// once: after a crash between delivery and removal, and whenever another
/// handler of the same event type fails, since a retry re-runs every handler
/// of the type from the first. Handlers **must be idempotent**; key side
/// effects on [`Envelope::id`] or the envelope's dedup key.
///
/// Returning an error marks the whole attempt as failed. The error is never
/// seen by the producer; the dispatcher records it on the queue entry and
/// schedules a retry or archives the entry.
///
/// # Example
///
/// ```ignore
/// struct SendWelcomeEmail { mailer: Arc<Mailer> }
///
/// #[async_trait]
/// impl OutboxHandler for SendWelcomeEmail {
///     fn event_type(&self) -> &str {
///         "account.created"
///     }
///
///     async fn handle(&self, envelope: &Envelope) -> anyhow::Result<()> {
///         let event: AccountCreated = envelope.decode()?;
///         self.mailer.send_welcome(&event.email, envelope.id()).await
///     }
/// }
/// ```
#[async_trait]
pub trait OutboxHandler: Send + Sync {
    /// Event type this handler consumes.
    fn event_type(&self) -> &str;

    /// Handle one delivery of an envelope.
    async fn handle(&self, envelope: &Envelope) -> Result<()>;
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

type BoxedHandlerFn = Box<dyn Fn(Envelope) -> HandlerFuture + Send + Sync>;

/// Adapter turning an async closure into an [`OutboxHandler`].
///
/// The closure receives an owned clone of the envelope so the returned
/// future can be `'static`.
pub struct FnHandler {
    event_type: String,
    handler: BoxedHandlerFn,
}

impl FnHandler {
    pub fn new<F, Fut>(event_type: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            event_type: event_type.into(),
            handler: Box::new(move |envelope| -> HandlerFuture { Box::pin(handler(envelope)) }),
        }
    }
}

#[async_trait]
impl OutboxHandler for FnHandler {
    fn event_type(&self) -> &str {
        &self.event_type
    }

    async fn handle(&self, envelope: &Envelope) -> Result<()> {
        (self.handler)(envelope.clone()).await
    }
}

impl std::fmt::Debug for FnHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnHandler")
            .field("event_type", &self.event_type)
            .finish_non_exhaustive()
    }
}

/// Event type to handlers index, built once at startup.
///
/// Handlers of one type run in registration order. The registry is moved
/// into the dispatcher and never changes afterwards.
///
/// # Example
///
/// ```ignore
/// let registry = HandlerRegistry::new()
///     .with_handler(SendWelcomeEmail::new(mailer))
///     .with_handler(IndexAccount::new(search));
/// ```
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Vec<Arc<dyn OutboxHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler, builder style.
    pub fn with_handler<H>(mut self, handler: H) -> Self
    where
        H: OutboxHandler + 'static,
    {
        self.register(handler);
        self
    }

    /// Add a handler after any already registered for its event type.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: OutboxHandler + 'static,
    {
        self.register_arc(Arc::new(handler))
    }

    /// Add a shared handler, e.g. one the caller keeps a reference to.
    pub fn register_arc(&mut self, handler: Arc<dyn OutboxHandler>) -> &mut Self {
        self.handlers
            .entry(handler.event_type().to_string())
            .or_default()
            .push(handler);
        self
    }

    /// Register an async closure for `event_type`.
    ///
    /// ```ignore
    /// registry.register_fn("account.created", |envelope| async move {
    ///     tracing::info!(account = %envelope.aggregate_id(), "account created");
    ///     Ok(())
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, event_type: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(FnHandler::new(event_type, handler))
    }

    /// Handlers for `event_type` in registration order. Empty if none.
    pub fn handlers_for(&self, event_type: &str) -> &[Arc<dyn OutboxHandler>] {
        self.handlers
            .get(event_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_handlers(&self, event_type: &str) -> bool {
        !self.handlers_for(event_type).is_empty()
    }

    /// Registered event types, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    /// Total number of registered handlers across all event types.
    pub fn len(&self) -> usize {
        self.handlers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<&str, usize> = self
            .handlers
            .iter()
            .map(|(event_type, handlers)| (event_type.as_str(), handlers.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}
