//! Relay pool for managing connections to multiple Nostr relays.
//!
//! The pool owns every [`RelayConnection`], decides which relays receive a
//! request, keeps the [`SubscriptionRegistry`] in step with what was sent, and
//! funnels inbound frames from all relays into one channel for the importer.
//! No lock is ever held across an await, so `send` never blocks on I/O.

use crate::backlog::SubscriptionCloser;
use crate::config::{PoolConfig, RelayConfig};
use crate::error::{ClientError, Result};
use crate::external::Signer;
use crate::importer::InboundFrame;
use crate::message::{ClientMessage, Filter, RawEvent, UnsignedEvent};
use crate::relay::{ConnectionLinks, ConnectionState, RelayConnection, RelayDescriptor, RelayStats};
use crate::subscription::{Outbound, SubscriptionRegistry};
use crate::transport::Connector;
use crate::relay_url::RelayUrl;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Status events emitted by the pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    /// A relay was added to the pool
    Added { relay: RelayUrl },
    /// A relay was removed from the pool
    Removed { relay: RelayUrl },
    /// A connection changed state
    StateChanged {
        relay: RelayUrl,
        state: ConnectionState,
    },
    /// A relay failed too many times in a row; it is still retried
    Unreachable { relay: RelayUrl, failures: u32 },
}

/// Which relays a request goes to.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RelayTarget {
    /// Every managed relay
    All,
    /// Relays marked read-capable
    #[default]
    Read,
    /// Relays marked write-capable
    Write,
    /// Relays that support search
    Search,
    /// Exactly these relays, regardless of their flags
    Explicit(Vec<RelayUrl>),
}

impl RelayTarget {
    fn admits(&self, descriptor: &RelayDescriptor) -> bool {
        match self {
            RelayTarget::All => true,
            RelayTarget::Read => descriptor.read,
            RelayTarget::Write => descriptor.write,
            RelayTarget::Search => descriptor.search,
            RelayTarget::Explicit(urls) => urls.contains(&descriptor.url),
        }
    }
}

/// A REQ to be sent under `subscription_id`.
#[derive(Debug, Clone)]
pub struct FilterRequest {
    pub subscription_id: String,
    pub filters: Vec<Filter>,
    /// Replace a live subscription with the same id instead of failing.
    pub replace: bool,
}

impl FilterRequest {
    pub fn new(subscription_id: impl Into<String>, filters: Vec<Filter>) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            filters,
            replace: false,
        }
    }

    pub fn replacing(mut self) -> Self {
        self.replace = true;
        self
    }
}

/// Where a request ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to these relays
    Sent { relays: Vec<RelayUrl> },
    /// No selected relay could take it. The request is still registered, so a
    /// waiting task runs into its timeout.
    NoRoute,
}

impl SendOutcome {
    pub fn is_routed(&self) -> bool {
        matches!(self, SendOutcome::Sent { .. })
    }
}

/// A pool of Nostr relay connections.
pub struct ConnectionPool {
    config: PoolConfig,
    relay_config: RelayConfig,
    connector: Arc<dyn Connector>,
    connections: RwLock<HashMap<RelayUrl, Arc<RelayConnection>>>,
    /// Temporary connections and the token of their pending removal
    ephemeral: Mutex<HashMap<RelayUrl, u64>>,
    next_token: Mutex<u64>,
    registry: Arc<SubscriptionRegistry>,
    inbound_tx: mpsc::Sender<InboundFrame>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundFrame>>>,
    events_tx: broadcast::Sender<PoolEvent>,
    this: Weak<ConnectionPool>,
}

impl ConnectionPool {
    pub fn new(
        config: PoolConfig,
        relay_config: RelayConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        let (events_tx, _) = broadcast::channel(config.events_capacity.max(1));
        Arc::new_cyclic(|this| Self {
            config,
            relay_config,
            connector,
            connections: RwLock::new(HashMap::new()),
            ephemeral: Mutex::new(HashMap::new()),
            next_token: Mutex::new(0),
            registry: Arc::new(SubscriptionRegistry::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            events_tx,
            this: this.clone(),
        })
    }

    /// Take the fan-in receiver. Only the first call gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<InboundFrame>> {
        self.inbound_rx.lock().take()
    }

    /// Subscribe to pool status events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PoolEvent> {
        self.events_tx.subscribe()
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    fn links(&self) -> ConnectionLinks {
        let registry = Arc::clone(&self.registry);
        ConnectionLinks {
            inbound: self.inbound_tx.clone(),
            events: self.events_tx.clone(),
            replay: Some(Arc::new(move |url: &RelayUrl| registry.req_frames_for(url))),
        }
    }

    /// Add a relay, or update the flags of one already managed. An ephemeral
    /// connection to the same relay becomes permanent.
    pub fn add_connection(&self, descriptor: RelayDescriptor) -> Arc<RelayConnection> {
        let url = descriptor.url.clone();
        let mut connections = self.connections.write();
        if let Some(existing) = connections.get(&url) {
            existing.set_descriptor(descriptor);
            if self.ephemeral.lock().remove(&url).is_some() {
                debug!("promoted ephemeral connection {}", url);
            }
            return Arc::clone(existing);
        }

        info!("Adding relay to pool: {}", url);
        let conn = Arc::new(RelayConnection::new(
            descriptor,
            self.relay_config.clone(),
            Arc::clone(&self.connector),
            self.links(),
        ));
        connections.insert(url.clone(), Arc::clone(&conn));
        drop(connections);
        let _ = self.events_tx.send(PoolEvent::Added { relay: url });
        conn
    }

    /// Remove a relay, closing its socket and discarding queued frames.
    /// Returns `false` if the relay was not managed.
    pub async fn remove_connection(&self, url: &RelayUrl) -> bool {
        let removed = self.connections.write().remove(url);
        self.ephemeral.lock().remove(url);
        let Some(conn) = removed else {
            return false;
        };
        info!("Removing relay from pool: {}", url);
        self.registry.remove_relay(url);
        conn.disconnect().await;
        let _ = self.events_tx.send(PoolEvent::Removed { relay: url.clone() });
        true
    }

    pub fn connect_all(&self) {
        for conn in self.connections.read().values() {
            conn.connect();
        }
    }

    pub async fn disconnect_all(&self) {
        let connections: Vec<_> = self.connections.read().values().cloned().collect();
        join_all(connections.iter().map(|conn| conn.disconnect())).await;
    }

    pub fn connection(&self, url: &RelayUrl) -> Option<Arc<RelayConnection>> {
        self.connections.read().get(url).cloned()
    }

    pub fn relays(&self) -> Vec<RelayUrl> {
        self.connections.read().keys().cloned().collect()
    }

    pub fn any_connected(&self) -> bool {
        self.connections.read().values().any(|c| c.is_connected())
    }

    pub fn connected_count(&self) -> usize {
        self.connections
            .read()
            .values()
            .filter(|c| c.is_connected())
            .count()
    }

    pub fn states(&self) -> HashMap<RelayUrl, ConnectionState> {
        self.connections
            .read()
            .iter()
            .map(|(url, conn)| (url.clone(), conn.state()))
            .collect()
    }

    pub fn stats(&self, url: &RelayUrl) -> Option<RelayStats> {
        self.connection(url).map(|c| c.stats())
    }

    pub fn is_ephemeral(&self, url: &RelayUrl) -> bool {
        self.ephemeral.lock().contains_key(url)
    }

    /// Connections selected by `target`. Ephemeral connections are only picked
    /// when named explicitly.
    fn select(&self, target: &RelayTarget, live_only: bool) -> Vec<Arc<RelayConnection>> {
        let ephemeral = self.ephemeral.lock().clone();
        self.connections
            .read()
            .values()
            .filter(|conn| {
                let descriptor = conn.descriptor();
                let explicit = matches!(target, RelayTarget::Explicit(_));
                (explicit || !ephemeral.contains_key(&descriptor.url))
                    && target.admits(&descriptor)
                    && (!live_only || conn.is_connected())
            })
            .cloned()
            .collect()
    }

    /// Register `request` and send its REQ to the connected relays `target` selects.
    ///
    /// The subscription is registered before any frame is queued, against every
    /// selected relay: those still connecting get the REQ replayed when their
    /// session opens. With no connected relay the result is
    /// [`SendOutcome::NoRoute`], not an error.
    pub fn send(&self, request: FilterRequest, target: RelayTarget) -> Result<SendOutcome> {
        let selected = self.select(&target, false);
        let relays: HashSet<RelayUrl> = selected.iter().map(|c| c.url().clone()).collect();
        let frame = ClientMessage::Req {
            subscription_id: request.subscription_id.clone(),
            filters: request.filters.clone(),
        }
        .to_json()?;

        let previous = self.registry.register(
            &request.subscription_id,
            request.filters,
            relays.clone(),
            request.replace,
        )?;
        if let Some(previous) = previous {
            let close = ClientMessage::Close {
                subscription_id: request.subscription_id.clone(),
            }
            .to_json()?;
            for stale in previous.relays.difference(&relays).filter(|r| self.is_live(r)) {
                self.send_frame(stale, close.clone());
            }
        }

        // Filtered after registering so a session opening meanwhile replays it.
        let targets: Vec<_> = selected.into_iter().filter(|c| c.is_connected()).collect();
        if targets.is_empty() {
            warn!(
                "no connected relay for subscription {} ({:?})",
                request.subscription_id, target
            );
            return Ok(SendOutcome::NoRoute);
        }
        for conn in &targets {
            conn.send(frame.clone());
        }
        debug!(
            "sent REQ {} to {} relays",
            request.subscription_id,
            targets.len()
        );
        Ok(SendOutcome::Sent {
            relays: targets.iter().map(|c| c.url().clone()).collect(),
        })
    }

    /// Close a subscription on every relay that received it. Unknown ids are a no-op.
    pub fn close_subscription(&self, subscription_id: &str) -> bool {
        self.registry.close(subscription_id, self)
    }

    /// Send a frame over a temporary read-only connection, or over the managed
    /// connection if the relay is already in the pool. Temporary connections
    /// are removed after `ephemeral_ttl` unless promoted by `add_connection`.
    pub fn send_ephemeral(&self, message: &ClientMessage, url: &RelayUrl) -> Result<Arc<RelayConnection>> {
        let frame = message.to_json()?;
        if let ClientMessage::Req {
            subscription_id,
            filters,
        } = message
            && !self.registry.add_relay(subscription_id, url)
        {
            self.registry.register(
                subscription_id,
                filters.clone(),
                HashSet::from([url.clone()]),
                false,
            )?;
        }

        let existing = self.connection(url);
        let conn = match existing {
            Some(conn) if !self.is_ephemeral(url) => conn,
            existing => {
                let conn = match existing {
                    Some(conn) => conn,
                    None => {
                        let conn = self.add_connection(RelayDescriptor::read_only(url.clone()));
                        debug!("opened ephemeral connection {}", url);
                        conn
                    }
                };
                self.schedule_ephemeral_removal(url);
                conn
            }
        };
        conn.connect();
        conn.send(frame);
        Ok(conn)
    }

    fn schedule_ephemeral_removal(&self, url: &RelayUrl) {
        let token = {
            let mut next = self.next_token.lock();
            *next += 1;
            *next
        };
        self.ephemeral.lock().insert(url.clone(), token);

        let pool = self.this.clone();
        let url = url.clone();
        let ttl = self.config.ephemeral_ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let expired = {
                let mut ephemeral = pool.ephemeral.lock();
                if ephemeral.get(&url) == Some(&token) {
                    ephemeral.remove(&url);
                    true
                } else {
                    false
                }
            };
            if expired {
                debug!("ephemeral connection {} expired", url);
                pool.remove_connection(&url).await;
            }
        });
    }

    /// Publish a signed event to write relays, skipping relays that exclude its author.
    /// Frames for relays that are currently down wait in their outbound queue.
    pub fn publish(&self, event: &RawEvent, target: RelayTarget) -> Result<SendOutcome> {
        let frame = ClientMessage::Event(event.clone()).to_json()?;
        let targets: Vec<_> = self
            .select(&target, false)
            .into_iter()
            .filter(|conn| !conn.descriptor().excluded_pubkeys.contains(&event.pubkey))
            .collect();
        if targets.is_empty() {
            warn!("no relay to publish {} to ({:?})", event.id, target);
            return Ok(SendOutcome::NoRoute);
        }
        for conn in &targets {
            conn.send(frame.clone());
        }
        info!("publishing {} to {} relays", event.id, targets.len());
        Ok(SendOutcome::Sent {
            relays: targets.iter().map(|c| c.url().clone()).collect(),
        })
    }

    /// Sign through the oracle, then publish.
    pub async fn publish_unsigned(
        &self,
        event: UnsignedEvent,
        signer: &dyn Signer,
        target: RelayTarget,
    ) -> Result<(RawEvent, SendOutcome)> {
        let signed = signer.sign(event).await?;
        let outcome = self.publish(&signed, target)?;
        Ok((signed, outcome))
    }

    /// Answer a relay's AUTH challenge with a signed event.
    pub fn authenticate(&self, url: &RelayUrl, signed: &RawEvent) -> Result<()> {
        let conn = self.connection(url).ok_or(ClientError::NotConnected)?;
        conn.send_message(&ClientMessage::Auth(signed.clone()))?;
        debug!("answered AUTH challenge from {}", url);
        Ok(())
    }
}

impl Outbound for ConnectionPool {
    fn send_frame(&self, relay: &RelayUrl, frame: String) {
        match self.connection(relay) {
            Some(conn) => conn.send(frame),
            None => debug!("dropping frame for unmanaged relay {}", relay),
        }
    }

    fn is_live(&self, relay: &RelayUrl) -> bool {
        self.connection(relay).is_some_and(|conn| conn.is_connected())
    }
}

impl SubscriptionCloser for ConnectionPool {
    fn close_subscription(&self, subscription_id: &str) {
        ConnectionPool::close_subscription(self, subscription_id);
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("relays", &self.relays())
            .field("subscriptions", &self.registry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Jitter;
    use crate::transport::mock::{MockConnector, MockRemote};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn url(s: &str) -> RelayUrl {
        RelayUrl::parse(s).unwrap()
    }

    fn pool() -> (Arc<ConnectionPool>, mpsc::UnboundedReceiver<MockRemote>) {
        let (connector, remotes) = MockConnector::new();
        let relay_config = RelayConfig {
            jitter: Jitter::None,
            ..RelayConfig::default()
        };
        let pool = ConnectionPool::new(PoolConfig::default(), relay_config, Arc::new(connector));
        (pool, remotes)
    }

    async fn connected(
        pool: &ConnectionPool,
        remotes: &mut mpsc::UnboundedReceiver<MockRemote>,
        descriptor: RelayDescriptor,
    ) -> MockRemote {
        let conn = pool.add_connection(descriptor);
        conn.connect();
        let remote = remotes.recv().await.unwrap();
        timeout(Duration::from_secs(5), async {
            while !conn.is_connected() {
                sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        remote
    }

    fn event_from(pubkey: &str) -> RawEvent {
        RawEvent::from_json(&format!(
            r#"{{"id":"ev1","pubkey":"{pubkey}","created_at":1,"kind":1,"tags":[],"content":"hi","sig":"s"}}"#
        ))
        .unwrap()
    }

    #[tokio::test]
    async fn test_add_connection_is_idempotent() {
        let (pool, _remotes) = pool();
        let a = pool.add_connection(RelayDescriptor::new(url("wss://relay.example/")));
        let b = pool.add_connection(RelayDescriptor::read_only(url("WSS://RELAY.example")));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(pool.relays().len(), 1);
        assert!(!a.descriptor().write);
    }

    #[tokio::test]
    async fn test_send_without_connected_relays_is_no_route() {
        let (pool, _remotes) = pool();
        pool.add_connection(RelayDescriptor::new(url("wss://down.example")));

        let outcome = pool
            .send(FilterRequest::new("sub", vec![Filter::new()]), RelayTarget::All)
            .unwrap();
        assert_eq!(outcome, SendOutcome::NoRoute);
        assert!(!outcome.is_routed());
        assert!(pool.registry().contains("sub"));
        assert!(!pool.any_connected());
    }

    #[tokio::test]
    async fn test_send_registers_then_sends() {
        let (pool, mut remotes) = pool();
        let mut remote =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;

        let outcome = pool
            .send(
                FilterRequest::new("sub", vec![Filter::new().kinds(vec![1])]),
                RelayTarget::Read,
            )
            .unwrap();
        assert_eq!(
            outcome,
            SendOutcome::Sent {
                relays: vec![url("wss://a.example")]
            }
        );
        assert!(pool.registry().get("sub").unwrap().relays.contains(&url("wss://a.example")));
        assert_eq!(
            remote.next_text().await.as_deref(),
            Some(r#"["REQ","sub",{"kinds":[1]}]"#)
        );
        assert!(pool.any_connected());
        assert_eq!(pool.connected_count(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let (pool, _remotes) = pool();
        pool.send(FilterRequest::new("sub", vec![]), RelayTarget::All)
            .unwrap();
        let err = pool
            .send(FilterRequest::new("sub", vec![]), RelayTarget::All)
            .unwrap_err();
        assert!(matches!(err, ClientError::DuplicateSubscription(_)));
        assert!(pool
            .send(FilterRequest::new("sub", vec![]).replacing(), RelayTarget::All)
            .is_ok());
    }

    #[tokio::test]
    async fn test_target_policies() {
        let (pool, mut remotes) = pool();
        let _r = connected(
            &pool,
            &mut remotes,
            RelayDescriptor::new(url("wss://rw.example")),
        )
        .await;
        let _w = connected(
            &pool,
            &mut remotes,
            RelayDescriptor {
                read: false,
                ..RelayDescriptor::new(url("wss://write.example"))
            },
        )
        .await;
        let _s = connected(
            &pool,
            &mut remotes,
            RelayDescriptor::read_only(url("wss://search.example")).with_search(true),
        )
        .await;

        let routed = |id: &str, target: RelayTarget| -> Vec<String> {
            match pool.send(FilterRequest::new(id, vec![]), target).unwrap() {
                SendOutcome::Sent { relays } => {
                    let mut hosts: Vec<String> =
                        relays.iter().map(|r| r.host().to_string()).collect();
                    hosts.sort();
                    hosts
                }
                SendOutcome::NoRoute => vec![],
            }
        };

        assert_eq!(routed("all", RelayTarget::All).len(), 3);
        assert_eq!(
            routed("read", RelayTarget::Read),
            vec!["rw.example", "search.example"]
        );
        assert_eq!(routed("search", RelayTarget::Search), vec!["search.example"]);
        assert_eq!(
            routed(
                "explicit",
                RelayTarget::Explicit(vec![url("wss://write.example")])
            ),
            vec!["write.example"]
        );
    }

    #[tokio::test]
    async fn test_req_before_connect_is_replayed() {
        let (pool, mut remotes) = pool();
        let conn = pool.add_connection(RelayDescriptor::new(url("wss://late.example")));
        let outcome = pool
            .send(FilterRequest::new("early", vec![]), RelayTarget::Read)
            .unwrap();
        assert_eq!(outcome, SendOutcome::NoRoute);
        assert_eq!(conn.queued(), 0);

        conn.connect();
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.next_text().await.as_deref(), Some(r#"["REQ","early"]"#));
    }

    #[tokio::test]
    async fn test_close_subscription_sends_close() {
        let (pool, mut remotes) = pool();
        let mut remote =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        pool.send(FilterRequest::new("sub", vec![]), RelayTarget::All)
            .unwrap();
        assert!(remote.next_text().await.unwrap().starts_with("[\"REQ\""));

        assert!(pool.close_subscription("sub"));
        assert_eq!(
            remote.next_text().await.as_deref(),
            Some(r#"["CLOSE","sub"]"#)
        );
        assert!(!pool.close_subscription("sub"));
        assert!(pool.registry().is_empty());
    }

    #[tokio::test]
    async fn test_replace_closes_on_dropped_relays() {
        let (pool, mut remotes) = pool();
        let mut a =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        let mut b =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://b.example"))).await;
        pool.send(FilterRequest::new("sub", vec![]), RelayTarget::All)
            .unwrap();
        a.next_text().await.unwrap();
        b.next_text().await.unwrap();

        pool.send(
            FilterRequest::new("sub", vec![]).replacing(),
            RelayTarget::Explicit(vec![url("wss://a.example")]),
        )
        .unwrap();
        assert!(a.next_text().await.unwrap().starts_with("[\"REQ\""));
        assert_eq!(b.next_text().await.as_deref(), Some(r#"["CLOSE","sub"]"#));
    }

    #[tokio::test]
    async fn test_remove_connection_prunes_registry() {
        let (pool, mut remotes) = pool();
        let _remote =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        let mut events = pool.subscribe_events();
        pool.send(FilterRequest::new("sub", vec![]), RelayTarget::All)
            .unwrap();

        assert!(pool.remove_connection(&url("wss://a.example")).await);
        assert!(!pool.remove_connection(&url("wss://a.example")).await);
        assert!(pool.registry().get("sub").unwrap().relays.is_empty());
        assert!(pool.relays().is_empty());

        let mut removed = false;
        while let Ok(event) = events.try_recv() {
            removed |= matches!(event, PoolEvent::Removed { .. });
        }
        assert!(removed);
    }

    #[tokio::test]
    async fn test_publish_respects_write_flag_and_exclusions() {
        let (pool, mut remotes) = pool();
        let mut open =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://open.example"))).await;
        pool.add_connection(RelayDescriptor::new(url("wss://private.example")).exclude_pubkey("alice"));
        pool.add_connection(RelayDescriptor::read_only(url("wss://readonly.example")));
        let offline = pool.add_connection(RelayDescriptor::new(url("wss://offline.example")));

        let outcome = pool.publish(&event_from("alice"), RelayTarget::Write).unwrap();
        let SendOutcome::Sent { mut relays } = outcome else {
            panic!("expected a route");
        };
        relays.sort();
        assert_eq!(
            relays,
            vec![url("wss://offline.example"), url("wss://open.example")]
        );
        assert!(open.next_text().await.unwrap().starts_with("[\"EVENT\",{"));
        // Not connected: waits in the queue.
        assert_eq!(offline.queued(), 1);
    }

    #[tokio::test]
    async fn test_closing_unsent_subscriptions_keeps_queued_publish() {
        let (connector, _remotes) = MockConnector::new();
        let relay_config = RelayConfig {
            jitter: Jitter::None,
            outbound_queue_capacity: 4,
            ..RelayConfig::default()
        };
        let pool = ConnectionPool::new(PoolConfig::default(), relay_config, Arc::new(connector));
        let offline = pool.add_connection(RelayDescriptor::new(url("wss://offline.example")));

        assert!(pool.publish(&event_from("bob"), RelayTarget::Write).unwrap().is_routed());
        for i in 0..4 {
            let id = format!("sub-{i}");
            let outcome = pool
                .send(FilterRequest::new(&id, vec![]), RelayTarget::Read)
                .unwrap();
            assert_eq!(outcome, SendOutcome::NoRoute);
            assert!(pool.close_subscription(&id));
        }

        assert_eq!(offline.queued(), 1);
        assert_eq!(offline.stats().dropped_frames, 0);
        assert!(pool.registry().is_empty());
    }

    #[tokio::test]
    async fn test_publish_unsigned_signs_first() {
        struct FixedSigner;

        #[async_trait]
        impl Signer for FixedSigner {
            async fn sign(&self, event: UnsignedEvent) -> Result<RawEvent> {
                Ok(event_from(&event.pubkey))
            }
        }

        struct RefusingSigner;

        #[async_trait]
        impl Signer for RefusingSigner {
            async fn sign(&self, _event: UnsignedEvent) -> Result<RawEvent> {
                Err(ClientError::Signing("locked".to_string()))
            }
        }

        let (pool, _remotes) = pool();
        pool.add_connection(RelayDescriptor::new(url("wss://a.example")));
        let unsigned = UnsignedEvent {
            pubkey: "bob".to_string(),
            created_at: 1,
            kind: 1,
            tags: vec![],
            content: "hi".to_string(),
        };

        let (signed, outcome) = pool
            .publish_unsigned(unsigned.clone(), &FixedSigner, RelayTarget::Write)
            .await
            .unwrap();
        assert_eq!(signed.pubkey, "bob");
        assert!(outcome.is_routed());

        let err = pool
            .publish_unsigned(unsigned, &RefusingSigner, RelayTarget::Write)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Signing(_)));
    }

    #[tokio::test]
    async fn test_authenticate_unknown_relay() {
        let (pool, _remotes) = pool();
        let err = pool
            .authenticate(&url("wss://nowhere.example"), &event_from("bob"))
            .unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[tokio::test]
    async fn test_inbound_fan_in() {
        let (pool, mut remotes) = pool();
        let mut inbound = pool.take_inbound().unwrap();
        assert!(pool.take_inbound().is_none());

        let a = connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        let b = connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://b.example"))).await;
        a.push_text(r#"["EOSE","x"]"#);
        b.push_text(r#"["EOSE","y"]"#);

        let mut seen = vec![
            inbound.recv().await.unwrap().relay,
            inbound.recv().await.unwrap().relay,
        ];
        seen.sort();
        assert_eq!(seen, vec![url("wss://a.example"), url("wss://b.example")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_live_subscriptions() {
        let (pool, mut remotes) = pool();
        let mut first =
            connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        pool.send(FilterRequest::new("live", vec![]), RelayTarget::All)
            .unwrap();
        pool.send(FilterRequest::new("gone", vec![]), RelayTarget::All)
            .unwrap();
        first.next_text().await.unwrap();
        first.next_text().await.unwrap();
        pool.close_subscription("gone");
        first.next_text().await.unwrap();

        drop(first.inbound);
        let mut second = remotes.recv().await.unwrap();
        assert_eq!(
            second.next_text().await.as_deref(),
            Some(r#"["REQ","live"]"#)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ephemeral_connection_expires() {
        let (pool, mut remotes) = pool();
        let target = url("wss://elsewhere.example");
        let message = ClientMessage::Req {
            subscription_id: "peek".to_string(),
            filters: vec![],
        };

        pool.send_ephemeral(&message, &target).unwrap();
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(remote.next_text().await.as_deref(), Some(r#"["REQ","peek"]"#));
        assert!(pool.is_ephemeral(&target));
        assert!(pool.registry().get("peek").unwrap().relays.contains(&target));

        // Not picked by policy routing.
        assert_eq!(
            pool.send(FilterRequest::new("other", vec![]), RelayTarget::All)
                .unwrap(),
            SendOutcome::NoRoute
        );

        sleep(Duration::from_secs(36)).await;
        assert!(pool.connection(&target).is_none());
        assert!(pool.registry().get("peek").unwrap().relays.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_promoted_ephemeral_connection_survives() {
        let (pool, mut remotes) = pool();
        let target = url("wss://elsewhere.example");
        let message = ClientMessage::Close {
            subscription_id: "x".to_string(),
        };
        pool.send_ephemeral(&message, &target).unwrap();
        let _remote = remotes.recv().await.unwrap();

        pool.add_connection(RelayDescriptor::new(target.clone()));
        assert!(!pool.is_ephemeral(&target));

        sleep(Duration::from_secs(40)).await;
        assert!(pool.connection(&target).is_some());
    }

    #[tokio::test]
    async fn test_disconnect_all() {
        let (pool, mut remotes) = pool();
        let _a = connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://a.example"))).await;
        let _b = connected(&pool, &mut remotes, RelayDescriptor::new(url("wss://b.example"))).await;
        assert_eq!(pool.connected_count(), 2);

        pool.disconnect_all().await;
        assert!(!pool.any_connected());
        assert!(pool
            .states()
            .values()
            .all(|s| *s == ConnectionState::Disconnected));
    }
}
