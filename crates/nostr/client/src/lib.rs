//! Relay communication core for Nostr clients.
//!
//! This crate provides:
//! - A pool of self-healing WebSocket connections with exponential backoff
//! - A subscription registry that pairs every REQ with exactly one CLOSE
//! - An importer that decodes, deduplicates and persists relay traffic
//! - A request backlog that turns replies into request/response with
//!   debounce and timeouts
//!
//! # Example
//!
//! ```rust,no_run
//! use nostr_relay_core::{
//!     CoreConfig, Filter, JsonCodec, MemoryStore, RelayCore, RelayTarget, TaskOutcome,
//!     WsConnector, default_relays,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> nostr_relay_core::Result<()> {
//!     let mut config = CoreConfig::from_env()?;
//!     if config.relays.is_empty() {
//!         config.relays = default_relays();
//!     }
//!
//!     let core = RelayCore::start(
//!         config,
//!         Arc::new(WsConnector),
//!         Arc::new(JsonCodec),
//!         Arc::new(MemoryStore::new()),
//!     )?;
//!
//!     let task = core.fetch(vec![Filter::new().kinds(vec![1]).limit(10)], RelayTarget::Read);
//!     match task.outcome().await {
//!         TaskOutcome::Response(response) => println!("answered: {:?}", response.signal),
//!         TaskOutcome::Timeout { subscription_id } => println!("{subscription_id} timed out"),
//!         TaskOutcome::Cancelled => {}
//!     }
//!
//!     core.shutdown().await;
//!     Ok(())
//! }
//! ```

mod backlog;
mod backoff;
mod config;
mod dedup;
mod error;
mod external;
mod importer;
mod message;
mod pool;
mod relay;
mod relay_url;
mod service;
mod subscription;
mod transport;

pub use backlog::{
    Backlog, ReqTask, Response, ResponseSignal, SubscriptionCloser, TaskHandle, TaskOutcome,
    TaskState,
};
pub use backoff::{ExponentialBackoff, Jitter};
pub use config::{BacklogConfig, CoreConfig, ImporterConfig, PoolConfig, RelayConfig};
pub use dedup::DedupCache;
pub use error::{ClientError, Result};
pub use external::{Codec, EventStore, JsonCodec, MemoryStore, Signer};
pub use importer::{
    DrainReason, ImportNotification, Importer, ImporterService, ImporterStats, InboundFrame,
    PRIO_PREFIX,
};
pub use message::{ClientMessage, DecodeError, Filter, RawEvent, RelayMessage, UnsignedEvent};
pub use pool::{ConnectionPool, FilterRequest, PoolEvent, RelayTarget, SendOutcome};
pub use relay::{ConnectionState, RelayConnection, RelayDescriptor, RelayStats};
pub use relay_url::RelayUrl;
pub use service::RelayCore;
pub use subscription::{
    EoseProgress, Outbound, Subscription, SubscriptionRegistry, generate_subscription_id,
};
pub use transport::{Connector, FrameSink, FrameStream, InFrame, OutFrame, Session, WsConnector};

/// Relays used when nothing is configured.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.damus.io",
    "wss://nos.lol",
    "wss://relay.nostr.band",
];

/// Descriptors for [`DEFAULT_RELAYS`].
pub fn default_relays() -> Vec<RelayDescriptor> {
    DEFAULT_RELAYS
        .iter()
        .filter_map(|url| RelayUrl::parse(url).ok())
        .map(RelayDescriptor::new)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_relays() {
        assert!(!DEFAULT_RELAYS.is_empty());
        assert_eq!(default_relays().len(), DEFAULT_RELAYS.len());
        for relay in default_relays() {
            assert!(relay.read && relay.write);
        }
    }
}
