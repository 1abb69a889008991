//! Nostr relay message types.
//!
//! Only the envelope is interpreted here: the message type, the subscription id
//! and the handful of event header fields needed for routing and dedup. Event
//! bodies stay opaque JSON text and are handed to the store untouched.
//! - Client to Relay: EVENT, REQ, CLOSE, AUTH
//! - Relay to Client: EVENT, OK, EOSE, CLOSED, NOTICE, AUTH

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur when decoding relay messages.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid message format: {0}")]
    InvalidFormat(String),

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),
}

/// A signed event as received from (or sent to) a relay.
///
/// The header fields are parsed for routing; `raw` keeps the exact JSON the
/// relay sent so the store can verify and persist it without re-encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub id: String,
    pub pubkey: String,
    pub kind: u16,
    pub created_at: u64,
    pub raw: String,
}

#[derive(Deserialize)]
struct EventHeader {
    id: String,
    pubkey: String,
    kind: u16,
    created_at: u64,
}

impl RawEvent {
    /// Parse the header of an event object, keeping the full JSON text.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let header: EventHeader = serde_json::from_str(json)?;
        Ok(Self {
            id: header.id,
            pubkey: header.pubkey,
            kind: header.kind,
            created_at: header.created_at,
            raw: json.to_string(),
        })
    }

    fn raw_value(&self) -> Result<Box<RawValue>, serde_json::Error> {
        RawValue::from_string(self.raw.clone())
    }
}

/// An event that still needs a signature from the signing oracle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

/// Messages sent from client to relay.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    /// Publish an event: ["EVENT", <event JSON>]
    Event(RawEvent),

    /// Subscribe to events: ["REQ", <subscription_id>, <filter1>, <filter2>, ...]
    Req {
        subscription_id: String,
        filters: Vec<Filter>,
    },

    /// Close a subscription: ["CLOSE", <subscription_id>]
    Close { subscription_id: String },

    /// Authentication (NIP-42): ["AUTH", <event JSON>]
    Auth(RawEvent),
}

impl ClientMessage {
    /// Serialize to JSON array for sending to relay.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            ClientMessage::Event(event) => serde_json::to_string(&("EVENT", event.raw_value()?)),
            ClientMessage::Req {
                subscription_id,
                filters,
            } => {
                let mut arr = Vec::with_capacity(filters.len() + 2);
                arr.push(serde_json::Value::from("REQ"));
                arr.push(serde_json::Value::from(subscription_id.as_str()));
                for filter in filters {
                    arr.push(serde_json::to_value(filter)?);
                }
                serde_json::to_string(&arr)
            }
            ClientMessage::Close { subscription_id } => {
                serde_json::to_string(&("CLOSE", subscription_id))
            }
            ClientMessage::Auth(event) => serde_json::to_string(&("AUTH", event.raw_value()?)),
        }
    }
}

/// Messages sent from relay to client.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Event matching a subscription: ["EVENT", <subscription_id>, <event JSON>]
    Event {
        subscription_id: String,
        event: RawEvent,
    },

    /// Command result: ["OK", <event_id>, <true|false>, <message>]
    Ok {
        event_id: String,
        success: bool,
        message: String,
    },

    /// End of stored events: ["EOSE", <subscription_id>]
    Eose { subscription_id: String },

    /// Subscription closed by relay: ["CLOSED", <subscription_id>, <message>]
    Closed {
        subscription_id: String,
        message: String,
    },

    /// Human-readable notice: ["NOTICE", <message>]
    Notice { message: String },

    /// Authentication challenge (NIP-42): ["AUTH", <challenge>]
    Auth { challenge: String },
}

fn string_at(arr: &[Box<RawValue>], index: usize, field: &'static str) -> Result<String, DecodeError> {
    let raw = arr.get(index).ok_or(DecodeError::MissingField(field))?;
    serde_json::from_str::<String>(raw.get())
        .map_err(|_| DecodeError::InvalidFormat(format!("{field} not a string")))
}

impl RelayMessage {
    /// Parse a JSON message from the relay.
    pub fn from_json(json: &str) -> Result<Self, DecodeError> {
        let arr: Vec<Box<RawValue>> =
            serde_json::from_str(json).map_err(|e| DecodeError::InvalidFormat(e.to_string()))?;

        if arr.is_empty() {
            return Err(DecodeError::InvalidFormat("empty array".to_string()));
        }
        let msg_type = string_at(&arr, 0, "type")?;

        match msg_type.as_str() {
            "EVENT" => {
                let subscription_id = string_at(&arr, 1, "subscription_id")?;
                let body = arr.get(2).ok_or(DecodeError::MissingField("event"))?;
                let event = RawEvent::from_json(body.get())?;
                Ok(RelayMessage::Event {
                    subscription_id,
                    event,
                })
            }
            "OK" => {
                let event_id = string_at(&arr, 1, "event_id")?;
                let raw = arr.get(2).ok_or(DecodeError::MissingField("success"))?;
                let success: bool = serde_json::from_str(raw.get()).map_err(|_| {
                    DecodeError::InvalidFormat("success not a boolean".to_string())
                })?;
                let message = string_at(&arr, 3, "message").unwrap_or_default();
                Ok(RelayMessage::Ok {
                    event_id,
                    success,
                    message,
                })
            }
            "EOSE" => Ok(RelayMessage::Eose {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
            }),
            "CLOSED" => Ok(RelayMessage::Closed {
                subscription_id: string_at(&arr, 1, "subscription_id")?,
                message: string_at(&arr, 2, "message").unwrap_or_default(),
            }),
            "NOTICE" => Ok(RelayMessage::Notice {
                message: string_at(&arr, 1, "message")?,
            }),
            "AUTH" => Ok(RelayMessage::Auth {
                challenge: string_at(&arr, 1, "challenge")?,
            }),
            other => Err(DecodeError::UnknownType(other.to_string())),
        }
    }

    /// Subscription id this message correlates to, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            RelayMessage::Event {
                subscription_id, ..
            }
            | RelayMessage::Eose { subscription_id }
            | RelayMessage::Closed {
                subscription_id, ..
            } => Some(subscription_id),
            _ => None,
        }
    }
}

/// Filter for subscription requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    /// Event IDs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,

    /// Authors (pubkeys)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,

    /// Event kinds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u16>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub until: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Full-text search (NIP-50), only honored by search relays
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,

    /// Tag queries keyed as "#e", "#p", ...
    #[serde(flatten, skip_serializing_if = "HashMap::is_empty")]
    pub tags: HashMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids(mut self, ids: Vec<String>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn authors(mut self, authors: Vec<String>) -> Self {
        self.authors = Some(authors);
        self
    }

    pub fn kinds(mut self, kinds: Vec<u16>) -> Self {
        self.kinds = Some(kinds);
        self
    }

    pub fn since(mut self, timestamp: u64) -> Self {
        self.since = Some(timestamp);
        self
    }

    pub fn until(mut self, timestamp: u64) -> Self {
        self.until = Some(timestamp);
        self
    }

    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn search(mut self, query: impl Into<String>) -> Self {
        self.search = Some(query.into());
        self
    }

    /// Add a tag filter. The key is the tag letter (e.g., "e", "p").
    pub fn tag(mut self, key: impl Into<String>, values: Vec<String>) -> Self {
        self.tags.insert(format!("#{}", key.into()), values);
        self
    }

    /// Filter by #e (event reference) tags.
    pub fn event_refs(self, event_ids: Vec<String>) -> Self {
        self.tag("e", event_ids)
    }

    /// Filter by #p (pubkey reference) tags.
    pub fn pubkey_refs(self, pubkeys: Vec<String>) -> Self {
        self.tag("p", pubkeys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT_JSON: &str = r#"{"id":"abc","pubkey":"pk","created_at":123,"kind":1,"tags":[],"content":"Hello","sig":"sig"}"#;

    #[test]
    fn test_client_message_event_keeps_raw_body() {
        let event = RawEvent::from_json(EVENT_JSON).unwrap();
        let json = ClientMessage::Event(event).to_json().unwrap();
        assert_eq!(json, format!(r#"["EVENT",{}]"#, EVENT_JSON));
    }

    #[test]
    fn test_client_message_req() {
        let filter = Filter::new().kinds(vec![1]).limit(10);

        let msg = ClientMessage::Req {
            subscription_id: "sub1".to_string(),
            filters: vec![filter],
        };

        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["REQ","sub1",{"kinds":[1],"limit":10}]"#);
    }

    #[test]
    fn test_client_message_close() {
        let msg = ClientMessage::Close {
            subscription_id: "sub1".to_string(),
        };

        let json = msg.to_json().unwrap();
        assert_eq!(json, r#"["CLOSE","sub1"]"#);
    }

    #[test]
    fn test_client_message_auth() {
        let event = RawEvent::from_json(EVENT_JSON).unwrap();
        let json = ClientMessage::Auth(event).to_json().unwrap();
        assert!(json.starts_with(r#"["AUTH",{"#));
    }

    #[test]
    fn test_relay_message_event() {
        let json = format!(r#"["EVENT","sub1",{}]"#, EVENT_JSON);
        let msg = RelayMessage::from_json(&json).unwrap();

        match msg {
            RelayMessage::Event {
                subscription_id,
                event,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert_eq!(event.id, "abc");
                assert_eq!(event.kind, 1);
                assert_eq!(event.raw, EVENT_JSON);
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_event_missing_header() {
        let json = r#"["EVENT","sub1",{"content":"no id"}]"#;
        assert!(matches!(
            RelayMessage::from_json(json),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn test_relay_message_ok() {
        let json = r#"["OK","event123",false,"duplicate: already have this event"]"#;
        let msg = RelayMessage::from_json(json).unwrap();
        assert_eq!(
            msg,
            RelayMessage::Ok {
                event_id: "event123".to_string(),
                success: false,
                message: "duplicate: already have this event".to_string(),
            }
        );
    }

    #[test]
    fn test_relay_message_ok_without_message() {
        let msg = RelayMessage::from_json(r#"["OK","event123",true]"#).unwrap();
        assert!(matches!(msg, RelayMessage::Ok { success: true, .. }));
    }

    #[test]
    fn test_relay_message_eose() {
        let msg = RelayMessage::from_json(r#"["EOSE","sub1"]"#).unwrap();
        assert_eq!(msg.subscription_id(), Some("sub1"));
        assert!(matches!(msg, RelayMessage::Eose { .. }));
    }

    #[test]
    fn test_relay_message_closed() {
        let json = r#"["CLOSED","sub1","error: too many subscriptions"]"#;
        match RelayMessage::from_json(json).unwrap() {
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                assert_eq!(subscription_id, "sub1");
                assert!(message.contains("too many subscriptions"));
            }
            _ => panic!("wrong message type"),
        }
    }

    #[test]
    fn test_relay_message_notice_and_auth() {
        let notice = RelayMessage::from_json(r#"["NOTICE","rate limited"]"#).unwrap();
        assert_eq!(
            notice,
            RelayMessage::Notice {
                message: "rate limited".to_string()
            }
        );
        assert_eq!(notice.subscription_id(), None);

        let auth = RelayMessage::from_json(r#"["AUTH","challenge123"]"#).unwrap();
        assert_eq!(
            auth,
            RelayMessage::Auth {
                challenge: "challenge123".to_string()
            }
        );
    }

    #[test]
    fn test_filter_builder() {
        let filter = Filter::new()
            .kinds(vec![1, 4])
            .authors(vec!["author1".to_string()])
            .since(1000)
            .until(2000)
            .limit(100)
            .event_refs(vec!["event1".to_string()]);

        assert_eq!(filter.kinds, Some(vec![1, 4]));
        assert_eq!(filter.authors, Some(vec!["author1".to_string()]));
        assert_eq!(filter.since, Some(1000));
        assert_eq!(filter.until, Some(2000));
        assert_eq!(filter.limit, Some(100));
        assert!(filter.tags.contains_key("#e"));
    }

    #[test]
    fn test_filter_serialization_skips_empty() {
        let filter = Filter::new().pubkey_refs(vec!["pk".to_string()]);
        let json = serde_json::to_string(&filter).unwrap();
        assert_eq!(json, r##"{"#p":["pk"]}"##);
    }

    #[test]
    fn test_invalid_message() {
        assert!(matches!(
            RelayMessage::from_json("not valid json"),
            Err(DecodeError::InvalidFormat(_))
        ));
        assert!(RelayMessage::from_json("[]").is_err());
        assert!(matches!(
            RelayMessage::from_json(r#"["UNKNOWN"]"#),
            Err(DecodeError::UnknownType(_))
        ));
        assert!(matches!(
            RelayMessage::from_json(r#"["EOSE"]"#),
            Err(DecodeError::MissingField("subscription_id"))
        ));
        assert!(RelayMessage::from_json(r#"[42,"x"]"#).is_err());
    }
}
