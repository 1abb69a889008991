//! Subscription bookkeeping.
//!
//! The registry is the single source of truth for which subscription ids are
//! live, which filters produced them and which relays received the REQ. Every
//! `register` is paired with exactly one `close`, which is what keeps
//! subscriptions from leaking on relays.

use crate::error::{ClientError, Result};
use crate::message::{ClientMessage, Filter};
use crate::relay_url::RelayUrl;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

/// Generate a unique subscription id, optionally namespaced.
pub fn generate_subscription_id(prefix: Option<&str>) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{}{}", prefix.unwrap_or_default(), &id[..16])
}

/// Anything that can put a frame on a relay's outbound queue.
pub trait Outbound {
    fn send_frame(&self, relay: &RelayUrl, frame: String);

    /// Whether `relay` has an open session right now.
    fn is_live(&self, _relay: &RelayUrl) -> bool {
        true
    }
}

/// A live subscription.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub id: String,
    pub filters: Vec<Filter>,
    /// Relays the REQ was sent to
    pub relays: HashSet<RelayUrl>,
    pub created_at: Instant,
    eose_relays: HashSet<RelayUrl>,
}

impl Subscription {
    pub fn req_frame(&self) -> Result<String> {
        Ok(ClientMessage::Req {
            subscription_id: self.id.clone(),
            filters: self.filters.clone(),
        }
        .to_json()?)
    }

    /// Every target relay has sent EOSE (or closed the subscription).
    pub fn all_eose(&self) -> bool {
        !self.relays.is_empty() && self.relays.is_subset(&self.eose_relays)
    }
}

/// Result of recording an EOSE for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EoseProgress {
    pub all_relays: bool,
}

#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscription.
    ///
    /// Fails with [`ClientError::DuplicateSubscription`] if `id` is live, unless
    /// `replace` is set, in which case the previous entry is returned so the
    /// caller can close it on relays that are no longer targeted.
    pub fn register(
        &self,
        id: &str,
        filters: Vec<Filter>,
        relays: HashSet<RelayUrl>,
        replace: bool,
    ) -> Result<Option<Subscription>> {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(id) && !replace {
            return Err(ClientError::DuplicateSubscription(id.to_string()));
        }
        debug!("registering subscription {} on {} relays", id, relays.len());
        Ok(subscriptions.insert(
            id.to_string(),
            Subscription {
                id: id.to_string(),
                filters,
                relays,
                created_at: Instant::now(),
                eose_relays: HashSet::new(),
            },
        ))
    }

    /// Send CLOSE to every relay that got the REQ and forget the subscription.
    ///
    /// Relays without a live session are skipped: they only learn about a
    /// subscription through replay, which stops once it is forgotten.
    /// Returns `false` for an unknown id, which is not an error.
    pub fn close(&self, id: &str, outbound: &dyn Outbound) -> bool {
        let Some(subscription) = self.subscriptions.lock().remove(id) else {
            return false;
        };
        let frame = match (ClientMessage::Close {
            subscription_id: id.to_string(),
        })
        .to_json()
        {
            Ok(frame) => frame,
            Err(e) => {
                warn!("failed to encode CLOSE for {}: {}", id, e);
                return true;
            }
        };
        let mut sent = 0;
        for relay in subscription.relays.iter().filter(|r| outbound.is_live(r)) {
            outbound.send_frame(relay, frame.clone());
            sent += 1;
        }
        debug!("closed subscription {} on {} relays", id, sent);
        true
    }

    /// Record that `relay` finished (EOSE or CLOSED) for `id`.
    pub fn mark_eose(&self, id: &str, relay: &RelayUrl) -> Option<EoseProgress> {
        let mut subscriptions = self.subscriptions.lock();
        let subscription = subscriptions.get_mut(id)?;
        subscription.eose_relays.insert(relay.clone());
        Some(EoseProgress {
            all_relays: subscription.all_eose(),
        })
    }

    /// Add a relay to an existing subscription's target set.
    pub fn add_relay(&self, id: &str, relay: &RelayUrl) -> bool {
        self.subscriptions
            .lock()
            .get_mut(id)
            .map(|s| s.relays.insert(relay.clone()))
            .is_some()
    }

    /// Forget a relay that is no longer managed.
    pub fn remove_relay(&self, relay: &RelayUrl) {
        for subscription in self.subscriptions.lock().values_mut() {
            subscription.relays.remove(relay);
            subscription.eose_relays.remove(relay);
        }
    }

    /// REQ frames for every live subscription targeting `relay`, used when a
    /// session reopens. Stored results will be resent, so EOSE is reset too.
    pub fn req_frames_for(&self, relay: &RelayUrl) -> Vec<String> {
        let mut subscriptions = self.subscriptions.lock();
        subscriptions
            .values_mut()
            .filter(|s| s.relays.contains(relay))
            .filter_map(|s| {
                s.eose_relays.remove(relay);
                match s.req_frame() {
                    Ok(frame) => Some(frame),
                    Err(e) => {
                        warn!("failed to encode REQ for {}: {}", s.id, e);
                        None
                    }
                }
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<Subscription> {
        self.subscriptions.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.subscriptions.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.lock().is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.subscriptions.lock().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    impl Outbound for Recorder {
        fn send_frame(&self, relay: &RelayUrl, frame: String) {
            self.0.lock().push((relay.to_string(), frame));
        }
    }

    /// Treats every relay except `down` as live.
    struct PartlyDown {
        down: RelayUrl,
        sent: Recorder,
    }

    impl Outbound for PartlyDown {
        fn send_frame(&self, relay: &RelayUrl, frame: String) {
            self.sent.send_frame(relay, frame);
        }

        fn is_live(&self, relay: &RelayUrl) -> bool {
            relay != &self.down
        }
    }

    fn relays(urls: &[&str]) -> HashSet<RelayUrl> {
        urls.iter().map(|u| RelayUrl::parse(u).unwrap()).collect()
    }

    #[test]
    fn test_generate_subscription_id() {
        let a = generate_subscription_id(None);
        let b = generate_subscription_id(None);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
        assert!(generate_subscription_id(Some("prio-")).starts_with("prio-"));
    }

    #[test]
    fn test_duplicate_rejected_unless_replace() {
        let registry = SubscriptionRegistry::new();
        registry
            .register("sub", vec![Filter::new()], relays(&["wss://a.example"]), false)
            .unwrap();

        let err = registry
            .register("sub", vec![], relays(&[]), false)
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateSubscription(id) if id == "sub"));

        let previous = registry
            .register("sub", vec![], relays(&["wss://b.example"]), true)
            .unwrap()
            .unwrap();
        assert_eq!(previous.relays, relays(&["wss://a.example"]));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_close_sends_to_every_target_once() {
        let registry = SubscriptionRegistry::new();
        let recorder = Recorder::default();
        registry
            .register(
                "sub",
                vec![],
                relays(&["wss://a.example", "wss://b.example"]),
                false,
            )
            .unwrap();

        assert!(registry.close("sub", &recorder));
        assert!(!registry.close("sub", &recorder));

        let mut sent = recorder.0.lock().clone();
        sent.sort();
        assert_eq!(
            sent,
            vec![
                ("wss://a.example".to_string(), r#"["CLOSE","sub"]"#.to_string()),
                ("wss://b.example".to_string(), r#"["CLOSE","sub"]"#.to_string()),
            ]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_skips_relays_without_session() {
        let registry = SubscriptionRegistry::new();
        let outbound = PartlyDown {
            down: RelayUrl::parse("wss://b.example").unwrap(),
            sent: Recorder::default(),
        };
        registry
            .register(
                "sub",
                vec![],
                relays(&["wss://a.example", "wss://b.example"]),
                false,
            )
            .unwrap();

        assert!(registry.close("sub", &outbound));
        assert_eq!(
            outbound.sent.0.lock().clone(),
            vec![("wss://a.example".to_string(), r#"["CLOSE","sub"]"#.to_string())]
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_close_unknown_is_noop() {
        let registry = SubscriptionRegistry::new();
        let recorder = Recorder::default();
        assert!(!registry.close("nope", &recorder));
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn test_all_eose_tracking() {
        let registry = SubscriptionRegistry::new();
        let a = RelayUrl::parse("wss://a.example").unwrap();
        let b = RelayUrl::parse("wss://b.example").unwrap();
        registry
            .register("sub", vec![], relays(&["wss://a.example", "wss://b.example"]), false)
            .unwrap();

        assert_eq!(
            registry.mark_eose("sub", &a),
            Some(EoseProgress { all_relays: false })
        );
        assert_eq!(
            registry.mark_eose("sub", &b),
            Some(EoseProgress { all_relays: true })
        );
        assert_eq!(registry.mark_eose("other", &a), None);
    }

    #[test]
    fn test_removed_relay_no_longer_blocks_all_eose() {
        let registry = SubscriptionRegistry::new();
        let a = RelayUrl::parse("wss://a.example").unwrap();
        let b = RelayUrl::parse("wss://b.example").unwrap();
        registry
            .register("sub", vec![], relays(&["wss://a.example", "wss://b.example"]), false)
            .unwrap();
        registry.remove_relay(&b);
        assert_eq!(
            registry.mark_eose("sub", &a),
            Some(EoseProgress { all_relays: true })
        );
    }

    #[test]
    fn test_req_frames_for_relay() {
        let registry = SubscriptionRegistry::new();
        let a = RelayUrl::parse("wss://a.example").unwrap();
        registry
            .register(
                "one",
                vec![Filter::new().kinds(vec![1])],
                relays(&["wss://a.example"]),
                false,
            )
            .unwrap();
        registry
            .register("two", vec![], relays(&["wss://b.example"]), false)
            .unwrap();
        registry.mark_eose("one", &a);

        assert_eq!(
            registry.req_frames_for(&a),
            vec![r#"["REQ","one",{"kinds":[1]}]"#.to_string()]
        );
        assert_eq!(
            registry.mark_eose("one", &a),
            Some(EoseProgress { all_relays: true })
        );
        assert!(!registry.get("one").unwrap().relays.is_empty());
    }

    #[test]
    fn test_add_relay() {
        let registry = SubscriptionRegistry::new();
        let a = RelayUrl::parse("wss://a.example").unwrap();
        assert!(!registry.add_relay("sub", &a));
        registry.register("sub", vec![], HashSet::new(), false).unwrap();
        assert!(registry.add_relay("sub", &a));
        assert!(registry.get("sub").unwrap().relays.contains(&a));
    }
}
