//! Outbound transport seam
//!
//! The coordinator only ever unicasts. Wire encoding and connection handling
//! belong to the implementation behind [`Transport`].

use std::sync::{Arc, Mutex};

use crate::events::{Envelope, Recipient, ServerEvent};
use crate::registry::ParticipantId;

/// Unicast delivery of outbound events
pub trait Transport: Send + Sync {
    fn transmit(&self, recipient: Recipient, event: ServerEvent);
}

/// Shared reference to a transport
pub type SharedTransport = Arc<dyn Transport>;

/// Send one event to each of `recipients`.
pub fn broadcast<'a, I>(transport: &dyn Transport, recipients: I, event: &ServerEvent)
where
    I: IntoIterator<Item = &'a ParticipantId>,
{
    for id in recipients {
        transport.transmit(Recipient::Participant(*id), event.clone());
    }
}

/// Records every event in memory; used by tests and offline replays
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<Envelope>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Everything sent so far, in order.
    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Events sent to one recipient, in order.
    pub fn sent_to(&self, recipient: Recipient) -> Vec<ServerEvent> {
        self.sent()
            .into_iter()
            .filter(|e| e.recipient == recipient)
            .map(|e| e.event)
            .collect()
    }

    /// Events of one type sent to anyone.
    pub fn of_type(&self, event_type: &str) -> Vec<Envelope> {
        self.sent()
            .into_iter()
            .filter(|e| e.event.event_type() == event_type)
            .collect()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Transport for MemoryTransport {
    fn transmit(&self, recipient: Recipient, event: ServerEvent) {
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Envelope { recipient, event });
    }
}
