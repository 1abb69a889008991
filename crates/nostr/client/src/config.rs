//! Configuration for the relay core.
//!
//! All durations are written as (fractional) seconds, e.g. `timeout = 12.0` or
//! `debounce_time = 0.1`. Every section has defaults, so an empty document is a
//! valid configuration.

use crate::backoff::Jitter;
use crate::error::{ClientError, Result};
use crate::relay::RelayDescriptor;
use crate::relay_url::RelayUrl;
use serde::Deserialize;
use std::time::Duration;

/// Serde adapter for durations given as float seconds.
mod secs {
    use serde::{Deserialize, Deserializer, de::Error};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Per-connection settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    #[serde(with = "secs")]
    pub connect_timeout: Duration,
    /// Frames kept while the socket is down; the oldest is dropped on overflow.
    pub outbound_queue_capacity: usize,
    #[serde(with = "secs")]
    pub reconnect_base_delay: Duration,
    #[serde(with = "secs")]
    pub reconnect_max_delay: Duration,
    /// Consecutive failures after which a relay is reported unreachable.
    pub unreachable_after: u32,
    #[serde(with = "secs")]
    pub ping_interval: Duration,
    /// Inbound silence before a ping is sent. Twice this ends the session.
    #[serde(with = "secs")]
    pub stale_after: Duration,
    pub jitter: Jitter,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            outbound_queue_capacity: 256,
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(512),
            unreachable_after: 5,
            ping_interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(45),
            jitter: Jitter::Partial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bound of the fan-in channel between connections and the importer.
    pub inbound_capacity: usize,
    /// Capacity of the pool status broadcast.
    pub events_capacity: usize,
    /// Lifetime of connections opened by `send_ephemeral`.
    #[serde(with = "secs")]
    pub ephemeral_ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: 4096,
            events_capacity: 1024,
            ephemeral_ttl: Duration::from_secs(35),
        }
    }
}

/// Defaults applied to every task added to the backlog.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BacklogConfig {
    #[serde(with = "secs")]
    pub timeout: Duration,
    #[serde(with = "secs", alias = "debounceTime")]
    pub debounce_time: Duration,
    /// Consume importer notifications directly instead of waiting for `deliver`.
    pub auto: bool,
    /// Namespace prepended to generated subscription ids.
    pub prefix: Option<String>,
}

impl Default for BacklogConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(12),
            debounce_time: Duration::from_millis(100),
            auto: true,
            prefix: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    /// Entries kept in the "already imported" cache.
    pub dedup_capacity: usize,
    /// Time frames are collected before one notification is published.
    #[serde(with = "secs")]
    pub batch_window: Duration,
    /// A batch is flushed early once it holds this many frames.
    pub max_batch: usize,
    pub notification_capacity: usize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100_000,
            batch_window: Duration::from_millis(300),
            max_batch: 500,
            notification_capacity: 1024,
        }
    }
}

/// Complete relay core configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub relays: Vec<RelayDescriptor>,
    pub relay: RelayConfig,
    pub pool: PoolConfig,
    pub backlog: BacklogConfig,
    pub importer: ImporterConfig,
}

impl CoreConfig {
    /// Parse a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|e| ClientError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `NOSTR_RELAYS`, `NOSTR_BACKLOG_TIMEOUT` and
    /// `NOSTR_BACKLOG_DEBOUNCE`.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply environment-style overrides read through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(relays) = lookup("NOSTR_RELAYS") {
            self.relays = relays
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| RelayUrl::parse(s).map(RelayDescriptor::new))
                .collect::<Result<_>>()?;
        }
        if let Some(timeout) = lookup("NOSTR_BACKLOG_TIMEOUT") {
            self.backlog.timeout = parse_secs("NOSTR_BACKLOG_TIMEOUT", &timeout)?;
        }
        if let Some(debounce) = lookup("NOSTR_BACKLOG_DEBOUNCE") {
            self.backlog.debounce_time = parse_secs("NOSTR_BACKLOG_DEBOUNCE", &debounce)?;
        }
        self.validate()
    }

    /// Reject settings the services cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.relay.reconnect_base_delay.is_zero() {
            return Err(ClientError::Config(
                "relay.reconnect_base_delay must be positive".to_string(),
            ));
        }
        if self.relay.reconnect_max_delay < self.relay.reconnect_base_delay {
            return Err(ClientError::Config(
                "relay.reconnect_max_delay is below reconnect_base_delay".to_string(),
            ));
        }
        if self.backlog.timeout.is_zero() {
            return Err(ClientError::Config(
                "backlog.timeout must be positive".to_string(),
            ));
        }
        if self.pool.inbound_capacity == 0 || self.pool.events_capacity == 0 {
            return Err(ClientError::Config(
                "pool channel capacities must be positive".to_string(),
            ));
        }
        if self.importer.notification_capacity == 0 {
            return Err(ClientError::Config(
                "importer.notification_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_secs(key: &str, value: &str) -> Result<Duration> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .ok_or_else(|| ClientError::Config(format!("{key}: invalid seconds value {value:?}")))
}
