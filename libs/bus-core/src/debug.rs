//! In-process event transport for development and tests.

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use crate::error::TransportResult;
use crate::message::{EventMessage, PublishOptions};
use crate::transport::{EventBatch, EventTransport, ReloadSignal};

/// Event transport that fakes a broker in process memory.
///
/// Published messages are recorded for inspection, inbound messages are
/// fed in with [`DebugEventTransport::queue_incoming`] and handed back by
/// `fetch_events`, and acknowledgements are tracked by message id. A
/// subscription change interrupts a pending fetch through the reload
/// signal, which surfaces as an empty batch.
#[derive(Default)]
pub struct DebugEventTransport {
    sent: Mutex<Vec<(EventMessage, PublishOptions)>>,
    incoming: Mutex<VecDeque<EventMessage>>,
    acknowledged: Mutex<Vec<String>>,
    listening: Mutex<HashSet<String>>,
    reload: ReloadSignal,
    fetch_poll: Duration,
}

impl DebugEventTransport {
    pub fn new() -> Self {
        Self {
            fetch_poll: Duration::from_millis(100),
            ..Self::default()
        }
    }

    /// Queue a message for delivery on the next fetch.
    pub fn queue_incoming(&self, message: EventMessage) {
        self.incoming.lock().unwrap().push_back(message);
    }

    /// Messages published so far, in publish order.
    pub fn sent_events(&self) -> Vec<(EventMessage, PublishOptions)> {
        self.sent.lock().unwrap().clone()
    }

    /// Ids acknowledged so far, in acknowledgement order.
    pub fn acknowledged_ids(&self) -> Vec<String> {
        self.acknowledged.lock().unwrap().clone()
    }

    /// The currently subscribed `api.event` pairs.
    pub fn subscriptions(&self) -> HashSet<String> {
        self.listening.lock().unwrap().clone()
    }

    fn drain_incoming(&self) -> Vec<EventMessage> {
        self.incoming.lock().unwrap().drain(..).collect()
    }
}

#[async_trait]
impl EventTransport for DebugEventTransport {
    async fn send_event(
        &self,
        message: &EventMessage,
        options: &PublishOptions,
    ) -> TransportResult<()> {
        info!(
            api_name = %message.api_name,
            event_name = %message.event_name,
            message_id = %message.id,
            "Faking publication of event"
        );
        self.sent
            .lock()
            .unwrap()
            .push((message.clone(), options.clone()));
        Ok(())
    }

    async fn fetch_events(&self) -> TransportResult<EventBatch> {
        let messages = self.drain_incoming();
        if !messages.is_empty() {
            return Ok(EventBatch {
                messages,
                cursor: None,
            });
        }

        // Nothing queued: wait one poll interval, unless a subscription
        // reload interrupts us first.
        tokio::select! {
            _ = self.reload.wait() => {
                debug!("Event transport reloading");
                Ok(EventBatch::empty())
            }
            _ = tokio::time::sleep(self.fetch_poll) => {
                Ok(EventBatch {
                    messages: self.drain_incoming(),
                    cursor: None,
                })
            }
        }
    }

    async fn start_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        info!("Beginning to listen for {api_name}.{event_name}");
        let inserted = self
            .listening
            .lock()
            .unwrap()
            .insert(format!("{api_name}.{event_name}"));
        if inserted {
            self.reload.trigger();
        }
        Ok(())
    }

    async fn stop_listening_for(&self, api_name: &str, event_name: &str) -> TransportResult<()> {
        let removed = self
            .listening
            .lock()
            .unwrap()
            .remove(&format!("{api_name}.{event_name}"));
        if removed {
            self.reload.trigger();
        }
        Ok(())
    }

    async fn acknowledge(&self, message: &EventMessage) -> TransportResult<()> {
        self.acknowledged.lock().unwrap().push(message.id.clone());
        Ok(())
    }
}
