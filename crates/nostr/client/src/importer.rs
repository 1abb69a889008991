//! Import pipeline.
//!
//! Consumes the pool's fan-in channel, decodes each frame through the
//! [`Codec`], persists new events through the [`EventStore`] and publishes
//! [`ImportNotification`]s. Event arrivals are batched: one `Imported`
//! notification covers every subscription id that received data during the
//! batch window, so a burst of events wakes each waiting task once.
//!
//! Relay input is untrusted. Anything that fails to decode is logged and
//! dropped; nothing here is fatal.

use crate::config::ImporterConfig;
use crate::dedup::DedupCache;
use crate::external::{Codec, EventStore};
use crate::message::{RawEvent, RelayMessage};
use crate::subscription::SubscriptionRegistry;
use crate::relay_url::RelayUrl;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Subscription ids with this prefix complete on their first event.
pub const PRIO_PREFIX: &str = "prio-";

/// A raw frame as it left a relay connection.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub relay: RelayUrl,
    pub text: String,
    pub received_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainReason {
    /// End of stored events
    Eose,
    /// The relay closed the subscription
    Closed(String),
}

/// Published by the importer for the backlog and other listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ImportNotification {
    /// New (or newly relevant) events arrived for these subscriptions
    Imported { subscription_ids: BTreeSet<String> },
    /// An event for a priority subscription, delivered without batching
    Prio {
        subscription_id: String,
        relay: RelayUrl,
        event: RawEvent,
    },
    /// A relay has no more stored events for the subscription
    Drained {
        subscription_id: String,
        relay: RelayUrl,
        /// Every relay the REQ went to has drained
        all_relays: bool,
        reason: DrainReason,
    },
    /// Publish acknowledgement
    Ok {
        relay: RelayUrl,
        event_id: String,
        success: bool,
        message: String,
    },
    /// The relay wants NIP-42 authentication
    AuthChallenge { relay: RelayUrl, challenge: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImporterStats {
    pub frames: u64,
    pub events: u64,
    /// Events the store had not seen before
    pub imported: u64,
    /// Events dropped by the dedup cache or reported known by the store
    pub duplicates: u64,
    pub malformed: u64,
    pub store_errors: u64,
    /// Notifications published
    pub notifications: u64,
}

pub struct Importer {
    config: ImporterConfig,
    codec: Arc<dyn Codec>,
    store: Arc<dyn EventStore>,
    registry: Arc<SubscriptionRegistry>,
    seen: DedupCache<String>,
    pending: BTreeSet<String>,
    notifications: broadcast::Sender<ImportNotification>,
    stats: Arc<Mutex<ImporterStats>>,
}

impl Importer {
    pub fn new(
        config: ImporterConfig,
        codec: Arc<dyn Codec>,
        store: Arc<dyn EventStore>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_capacity.max(1));
        Self {
            seen: DedupCache::new(config.dedup_capacity),
            config,
            codec,
            store,
            registry,
            pending: BTreeSet::new(),
            notifications,
            stats: Arc::new(Mutex::new(ImporterStats::default())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportNotification> {
        self.notifications.subscribe()
    }

    pub fn stats(&self) -> ImporterStats {
        self.stats.lock().clone()
    }

    /// Subscription ids waiting for the next `Imported` notification.
    pub fn pending(&self) -> &BTreeSet<String> {
        &self.pending
    }

    fn publish(&self, notification: ImportNotification) {
        self.stats.lock().notifications += 1;
        // No receivers is fine: nobody is waiting.
        let _ = self.notifications.send(notification);
    }

    /// Publish the pending batch, if any.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let subscription_ids = std::mem::take(&mut self.pending);
        debug!("imported events for {} subscriptions", subscription_ids.len());
        self.publish(ImportNotification::Imported { subscription_ids });
    }

    /// Process one raw payload from `relay`.
    ///
    /// Returns `true` when an event joined the pending batch.
    pub async fn ingest(&mut self, relay: &RelayUrl, payload: &str) -> bool {
        self.stats.lock().frames += 1;
        let message = match self.codec.decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.lock().malformed += 1;
                debug!("dropping malformed frame from {}: {} ({:.80})", relay, e, payload);
                return false;
            }
        };

        match message {
            RelayMessage::Event {
                subscription_id,
                event,
            } => return self.import_event(relay, subscription_id, event).await,
            RelayMessage::Eose { subscription_id } => {
                self.drained(relay, subscription_id, DrainReason::Eose)
            }
            RelayMessage::Closed {
                subscription_id,
                message,
            } => {
                info!("{} closed subscription {}: {}", relay, subscription_id, message);
                self.drained(relay, subscription_id, DrainReason::Closed(message))
            }
            RelayMessage::Ok {
                event_id,
                success,
                message,
            } => {
                if !success {
                    warn!("{} rejected event {}: {}", relay, event_id, message);
                }
                self.publish(ImportNotification::Ok {
                    relay: relay.clone(),
                    event_id,
                    success,
                    message,
                });
            }
            RelayMessage::Notice { message } => {
                info!("NOTICE from {}: {}", relay, message);
            }
            RelayMessage::Auth { challenge } => {
                debug!("{} requested authentication", relay);
                self.publish(ImportNotification::AuthChallenge {
                    relay: relay.clone(),
                    challenge,
                });
            }
        }
        false
    }

    async fn import_event(
        &mut self,
        relay: &RelayUrl,
        subscription_id: String,
        event: RawEvent,
    ) -> bool {
        self.stats.lock().events += 1;

        if self.seen.contains(&event.id) {
            self.stats.lock().duplicates += 1;
            if let Err(e) = self.store.record_relay(&event.id, relay).await {
                warn!("failed to record relay {} for {}: {}", relay, event.id, e);
            }
        } else {
            match self.store.save(&event, relay).await {
                Ok(is_new) => {
                    let mut stats = self.stats.lock();
                    if is_new {
                        stats.imported += 1;
                    } else {
                        stats.duplicates += 1;
                    }
                    drop(stats);
                    self.seen.insert(event.id.clone());
                }
                Err(e) => {
                    self.stats.lock().store_errors += 1;
                    warn!("failed to store event {} from {}: {}", event.id, relay, e);
                    return false;
                }
            }
        }

        if subscription_id.starts_with(PRIO_PREFIX) {
            self.publish(ImportNotification::Prio {
                subscription_id: subscription_id.clone(),
                relay: relay.clone(),
                event,
            });
        }
        self.pending.insert(subscription_id);
        true
    }

    fn drained(&mut self, relay: &RelayUrl, subscription_id: String, reason: DrainReason) {
        // Events that arrived before the EOSE are announced first.
        self.flush();
        let all_relays = match self.registry.mark_eose(&subscription_id, relay) {
            Some(progress) => progress.all_relays,
            None => {
                debug!("{} drained unknown subscription {}", relay, subscription_id);
                false
            }
        };
        self.publish(ImportNotification::Drained {
            subscription_id,
            relay: relay.clone(),
            all_relays,
            reason,
        });
    }

    /// Run the pipeline on its own task until `inbound` closes or the service is shut down.
    pub fn spawn(mut self, mut inbound: mpsc::Receiver<InboundFrame>) -> ImporterService {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let notifications = self.notifications.clone();
        let stats = Arc::clone(&self.stats);

        let handle = tokio::spawn(async move {
            let window = self.config.batch_window;
            let max_batch = self.config.max_batch.max(1);
            let mut deadline: Option<Instant> = None;
            let mut batched = 0usize;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    frame = inbound.recv() => {
                        let Some(frame) = frame else { break };
                        let joined = self.ingest(&frame.relay, &frame.text).await;
                        if self.pending.is_empty() {
                            deadline = None;
                            batched = 0;
                            continue;
                        }
                        if !joined {
                            continue;
                        }
                        batched += 1;
                        if batched >= max_batch {
                            self.flush();
                            deadline = None;
                            batched = 0;
                        } else if deadline.is_none() {
                            deadline = Some(Instant::now() + window);
                        }
                    }
                    _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        self.flush();
                        deadline = None;
                        batched = 0;
                    }
                }
            }
            self.flush();
            debug!("importer stopped");
        });

        ImporterService {
            cancel,
            handle,
            notifications,
            stats,
        }
    }
}

/// Handle to a running importer.
pub struct ImporterService {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
    notifications: broadcast::Sender<ImportNotification>,
    stats: Arc<Mutex<ImporterStats>>,
}

impl ImporterService {
    pub fn subscribe(&self) -> broadcast::Receiver<ImportNotification> {
        self.notifications.subscribe()
    }

    pub fn stats(&self) -> ImporterStats {
        self.stats.lock().clone()
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Flush the pending batch and stop.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("importer task ended abnormally: {}", e);
        }
    }
}
