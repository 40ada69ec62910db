//! Event bus for outbound delivery
//!
//! A Tokio broadcast channel carrying addressed [`Envelope`]s. Connection
//! handlers subscribe with a [`RecipientFilter`] and forward what matches to
//! their socket. The bus is the default [`Transport`].

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use super::types::{Envelope, Recipient, ServerEvent};
use crate::transport::Transport;

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 1024;

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Event bus with broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an addressed event to all subscribers
    pub fn publish(&self, envelope: Envelope) {
        let event_type = envelope.event.event_type();
        match self.sender.send(envelope) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            // No receivers: nobody is connected to hear it.
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    /// Subscribe to every envelope
    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    /// Subscribe to the envelopes addressed to one recipient
    pub fn subscribe_for(&self, recipient: Recipient) -> FilteredReceiver {
        FilteredReceiver::new(self.subscribe(), RecipientFilter::only(recipient))
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for EventBus {
    fn transmit(&self, recipient: Recipient, event: ServerEvent) {
        self.publish(Envelope { recipient, event });
    }
}

/// Envelope filter for selective subscription
#[derive(Debug, Clone, Default)]
pub struct RecipientFilter {
    pub recipient: Option<Recipient>,
    pub event_types: Option<Vec<String>>,
}

impl RecipientFilter {
    /// Create a new empty filter (matches all envelopes)
    pub fn new() -> Self {
        Self::default()
    }

    pub fn only(recipient: Recipient) -> Self {
        Self {
            recipient: Some(recipient),
            event_types: None,
        }
    }

    /// Filter by event types
    pub fn types(mut self, event_types: Vec<&str>) -> Self {
        self.event_types = Some(event_types.into_iter().map(String::from).collect());
        self
    }

    pub fn matches(&self, envelope: &Envelope) -> bool {
        if let Some(recipient) = self.recipient {
            if envelope.recipient != recipient {
                return false;
            }
        }
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == envelope.event.event_type()) {
                return false;
            }
        }
        true
    }
}

/// Receiver that only yields matching envelopes
pub struct FilteredReceiver {
    receiver: broadcast::Receiver<Envelope>,
    filter: RecipientFilter,
}

impl FilteredReceiver {
    pub fn new(receiver: broadcast::Receiver<Envelope>, filter: RecipientFilter) -> Self {
        Self { receiver, filter }
    }

    /// Receive the next matching envelope
    pub async fn recv(&mut self) -> Result<Envelope, broadcast::error::RecvError> {
        loop {
            let envelope = self.receiver.recv().await?;
            if self.filter.matches(&envelope) {
                return Ok(envelope);
            }
        }
    }
}
