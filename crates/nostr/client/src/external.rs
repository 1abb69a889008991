//! Collaborators the relay core depends on but does not implement:
//! message decoding, event persistence and signing.

use crate::error::Result;
use crate::message::{DecodeError, RawEvent, RelayMessage, UnsignedEvent};
use crate::relay_url::RelayUrl;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Decodes raw relay payloads into routed messages.
pub trait Codec: Send + Sync {
    fn decode(&self, payload: &str) -> std::result::Result<RelayMessage, DecodeError>;
}

/// Codec for the standard NIP-01 JSON array framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn decode(&self, payload: &str) -> std::result::Result<RelayMessage, DecodeError> {
        RelayMessage::from_json(payload)
    }
}

/// Persistent event store.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist an event. Returns `true` if the event was not stored before.
    async fn save(&self, event: &RawEvent, relay: &RelayUrl) -> Result<bool>;

    /// Remember that an already stored event was also seen on `relay`.
    async fn record_relay(&self, _event_id: &str, _relay: &RelayUrl) -> Result<()> {
        Ok(())
    }
}

/// Signing oracle. The core never sees key material.
#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, event: UnsignedEvent) -> Result<RawEvent>;
}

#[derive(Debug, Clone)]
struct StoredEvent {
    event: RawEvent,
    relays: Vec<RelayUrl>,
}

/// In-memory [`EventStore`], used by tests and embedders without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    events: Mutex<HashMap<String, StoredEvent>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    pub fn get(&self, event_id: &str) -> Option<RawEvent> {
        self.events.lock().get(event_id).map(|s| s.event.clone())
    }

    /// Relays an event was seen on, in first-seen order.
    pub fn relays_for(&self, event_id: &str) -> Vec<RelayUrl> {
        self.events
            .lock()
            .get(event_id)
            .map(|s| s.relays.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn save(&self, event: &RawEvent, relay: &RelayUrl) -> Result<bool> {
        let mut events = self.events.lock();
        if let Some(stored) = events.get_mut(&event.id) {
            if !stored.relays.contains(relay) {
                stored.relays.push(relay.clone());
            }
            return Ok(false);
        }
        events.insert(
            event.id.clone(),
            StoredEvent {
                event: event.clone(),
                relays: vec![relay.clone()],
            },
        );
        Ok(true)
    }

    async fn record_relay(&self, event_id: &str, relay: &RelayUrl) -> Result<()> {
        if let Some(stored) = self.events.lock().get_mut(event_id)
            && !stored.relays.contains(relay)
        {
            stored.relays.push(relay.clone());
        }
        Ok(())
    }
}
