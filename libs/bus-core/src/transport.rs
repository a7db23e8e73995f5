//! The abstract event-transport contract and the subscription reload signal.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::TransportResult;
use crate::message::{EventMessage, PublishOptions};

/// Opaque cursor returned by a fetch and replayed on the next call by
/// cursor-style transports. Transports that track their position
/// server-side (e.g. consumer groups) return `None`.
pub type ContinuationToken = String;

/// One batch of fetched events plus the transport's continuation token.
#[derive(Debug, Default)]
pub struct EventBatch {
    pub messages: Vec<EventMessage>,
    pub cursor: Option<ContinuationToken>,
}

impl EventBatch {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Publisher/consumer of event messages over some concrete medium.
///
/// The transactional layer treats implementations as opaque: it never
/// inspects the wire format, only the success/failure surface of these
/// operations.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Durably publish a message, returning once the medium has
    /// acknowledged it.
    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> TransportResult<()>;

    /// Produce the next batch of messages for the current subscription
    /// set. A pending fetch interrupted by a subscription reload yields
    /// an empty batch rather than an error.
    async fn fetch_events(&self) -> TransportResult<EventBatch>;

    /// Begin delivering `api_name.event_name`. May trigger a reload of
    /// the underlying consumer.
    async fn start_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()>;

    /// Stop delivering `api_name.event_name`.
    async fn stop_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()>;

    /// Signal that a message has been processed and need not be
    /// redelivered. Optional capability; the default is a no-op.
    async fn acknowledge(&self, _message: &EventMessage) -> TransportResult<()> {
        Ok(())
    }

    /// Past events for one `api_name.event_name`, oldest first. Optional
    /// capability; the default is an empty history.
    async fn history(
        &self,
        _api_name: &str,
        _event_name: &str,
    ) -> TransportResult<Vec<EventMessage>> {
        Ok(Vec::new())
    }
}

#[async_trait]
impl<T: EventTransport + ?Sized> EventTransport for Arc<T> {
    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> TransportResult<()> {
        (**self).send_event(message, options).await
    }

    async fn fetch_events(&self) -> TransportResult<EventBatch> {
        (**self).fetch_events().await
    }

    async fn start_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        (**self).start_listening_for(api_name, event_name).await
    }

    async fn stop_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        (**self).stop_listening_for(api_name, event_name).await
    }

    async fn acknowledge(&self, message: &EventMessage) -> TransportResult<()> {
        (**self).acknowledge(message).await
    }

    async fn history(
        &self,
        api_name: &str,
        event_name: &str,
    ) -> TransportResult<Vec<EventMessage>> {
        (**self).history(api_name, event_name).await
    }
}

/// One-shot signal telling an in-flight fetch that the subscription set
/// changed and the consumer must be rebuilt.
///
/// A fetch selects on [`ReloadSignal::wait`] at its suspension points and
/// yields an empty batch when the signal fires; cancellation stays
/// reserved for hard shutdown.
#[derive(Debug, Default)]
pub struct ReloadSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ReloadSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a reload, waking any fetch currently waiting.
    pub fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Consume a pending reload request, if any.
    pub fn take(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }

    /// Wait until a reload is requested.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking the flag so a concurrent
            // trigger cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.take() {
                return;
            }
            notified.await;
        }
    }
}
