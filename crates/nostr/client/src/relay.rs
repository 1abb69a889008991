//! Single relay connection management
//!
//! A [`RelayConnection`] owns one background service task that connects,
//! keeps the session alive and reconnects with backoff until it is told to
//! stop. Callers never touch the socket: they push frames into a bounded
//! outbound queue and receive inbound frames on the pool's fan-in channel.

use crate::backoff::ExponentialBackoff;
use crate::config::RelayConfig;
use crate::error::Result;
use crate::importer::InboundFrame;
use crate::message::ClientMessage;
use crate::pool::PoolEvent;
use crate::transport::{Connector, FrameSink, InFrame, OutFrame, Session};
use crate::relay_url::RelayUrl;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECENT_ERRORS: usize = 10;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No service running
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Session established
    Connected,
    /// Relay sent an AUTH challenge that has not been answered yet
    Authenticating,
    /// Last attempt or session failed; a reconnect is scheduled
    Failed,
}

impl ConnectionState {
    /// Whether a session is currently open.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Connected | Self::Authenticating)
    }
}

fn default_true() -> bool {
    true
}

/// How a relay is used.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RelayDescriptor {
    pub url: RelayUrl,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    /// Relay supports NIP-50 search
    #[serde(default)]
    pub search: bool,
    /// Accounts whose events must never be published here
    #[serde(default)]
    pub excluded_pubkeys: HashSet<String>,
}

impl RelayDescriptor {
    /// Read/write relay without search support.
    pub fn new(url: RelayUrl) -> Self {
        Self {
            url,
            read: true,
            write: true,
            search: false,
            excluded_pubkeys: HashSet::new(),
        }
    }

    pub fn read_only(url: RelayUrl) -> Self {
        Self {
            write: false,
            ..Self::new(url)
        }
    }

    pub fn with_search(mut self, search: bool) -> Self {
        self.search = search;
        self
    }

    pub fn with_write(mut self, write: bool) -> Self {
        self.write = write;
        self
    }

    pub fn exclude_pubkey(mut self, pubkey: impl Into<String>) -> Self {
        self.excluded_pubkeys.insert(pubkey.into());
        self
    }
}

/// Per-relay counters, mostly for diagnostics screens.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    /// Sessions successfully established
    pub connects: u64,
    /// Inbound text frames received
    pub messages: u64,
    /// Failed connects and broken sessions
    pub errors: u64,
    /// Last few error messages, oldest first
    pub recent_errors: VecDeque<String>,
    /// Outbound frames dropped because the queue was full
    pub dropped_frames: u64,
    pub last_activity: Option<Instant>,
    pub consecutive_failures: u32,
}

impl RelayStats {
    fn record_error(&mut self, error: String) {
        self.errors += 1;
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if self.recent_errors.len() == RECENT_ERRORS {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(error);
    }
}

/// Produces the frames replayed when a session (re)opens.
pub type ReplayFn = Arc<dyn Fn(&RelayUrl) -> Vec<String> + Send + Sync>;

/// Channels a connection reports into.
#[derive(Clone)]
pub struct ConnectionLinks {
    pub inbound: mpsc::Sender<InboundFrame>,
    pub events: broadcast::Sender<PoolEvent>,
    pub replay: Option<ReplayFn>,
}

struct Inner {
    url: RelayUrl,
    config: RelayConfig,
    connector: Arc<dyn Connector>,
    links: ConnectionLinks,
    state: Mutex<ConnectionState>,
    queue: Mutex<VecDeque<String>>,
    wake: Notify,
    stats: Mutex<RelayStats>,
    backoff: Mutex<ExponentialBackoff>,
}

struct Service {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum SessionEnd {
    Cancelled,
    Failed(String),
}

/// Relay connection
pub struct RelayConnection {
    inner: Arc<Inner>,
    descriptor: RwLock<RelayDescriptor>,
    service: Mutex<Option<Service>>,
}

impl RelayConnection {
    pub fn new(
        descriptor: RelayDescriptor,
        config: RelayConfig,
        connector: Arc<dyn Connector>,
        links: ConnectionLinks,
    ) -> Self {
        let backoff =
            ExponentialBackoff::new(config.reconnect_base_delay, config.reconnect_max_delay)
                .with_jitter(config.jitter);
        Self {
            inner: Arc::new(Inner {
                url: descriptor.url.clone(),
                config,
                connector,
                links,
                state: Mutex::new(ConnectionState::Disconnected),
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                stats: Mutex::new(RelayStats::default()),
                backoff: Mutex::new(backoff),
            }),
            descriptor: RwLock::new(descriptor),
            service: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &RelayUrl {
        &self.inner.url
    }

    pub fn descriptor(&self) -> RelayDescriptor {
        self.descriptor.read().clone()
    }

    pub(crate) fn set_descriptor(&self, descriptor: RelayDescriptor) {
        *self.descriptor.write() = descriptor;
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_live()
    }

    /// Too many consecutive failures. Reconnect attempts continue regardless.
    pub fn is_unreachable(&self) -> bool {
        self.inner.stats.lock().consecutive_failures >= self.inner.config.unreachable_after
    }

    pub fn stats(&self) -> RelayStats {
        self.inner.stats.lock().clone()
    }

    /// Frames waiting for the socket.
    pub fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Start the connection service. No-op while it is already running.
    pub fn connect(&self) {
        let mut service = self.service.lock();
        if service.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            return;
        }
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Inner::run(self.inner.clone(), cancel.clone()));
        *service = Some(Service { cancel, handle });
    }

    /// Stop the service, close the socket and drop queued frames.
    ///
    /// This is the explicit path: backoff and failure counters are reset.
    pub async fn disconnect(&self) {
        let service = self.service.lock().take();
        if let Some(service) = service {
            service.cancel.cancel();
            if let Err(e) = service.handle.await {
                warn!("{} service task ended abnormally: {}", self.inner.url, e);
            }
            info!("Disconnected from relay: {}", self.inner.url);
        }
        self.inner.queue.lock().clear();
        self.inner.backoff.lock().reset();
        self.inner.stats.lock().consecutive_failures = 0;
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Queue a raw frame. Never blocks; the oldest frame is dropped when full.
    pub fn send(&self, frame: String) {
        let capacity = self.inner.config.outbound_queue_capacity.max(1);
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let dropped = if queue.len() >= capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(frame);
            dropped
        };
        if let Some(dropped) = dropped {
            self.inner.stats.lock().dropped_frames += 1;
            warn!(
                "{} outbound queue full, dropped frame: {:.60}",
                self.inner.url, dropped
            );
        }
        self.inner.wake.notify_one();
    }

    pub fn send_message(&self, message: &ClientMessage) -> Result<()> {
        self.send(message.to_json()?);
        Ok(())
    }
}

impl Drop for RelayConnection {
    fn drop(&mut self) {
        if let Some(service) = self.service.get_mut().take() {
            service.cancel.cancel();
        }
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.state.lock(), state);
        if previous != state {
            debug!("{} state {:?} -> {:?}", self.url, previous, state);
            let _ = self.links.events.send(PoolEvent::StateChanged {
                relay: self.url.clone(),
                state,
            });
        }
    }

    fn record_failure(&self, error: String) {
        let failures = {
            let mut stats = self.stats.lock();
            stats.record_error(error.clone());
            stats.consecutive_failures
        };
        warn!("{} failed ({} in a row): {}", self.url, failures, error);
        if failures == self.config.unreachable_after {
            let _ = self.links.events.send(PoolEvent::Unreachable {
                relay: self.url.clone(),
                failures,
            });
        }
        self.set_state(ConnectionState::Failed);
    }

    fn touch(&self) {
        self.stats.lock().last_activity = Some(Instant::now());
    }

    fn idle_for(&self, session_start: Instant) -> Duration {
        let last = self.stats.lock().last_activity.unwrap_or(session_start);
        last.max(session_start).elapsed()
    }

    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            self.set_state(ConnectionState::Connecting);
            info!("Connecting to relay: {}", self.url);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                result = timeout(self.config.connect_timeout, self.connector.connect(&self.url)) => result,
            };

            match attempt {
                Ok(Ok(session)) => {
                    {
                        let mut stats = self.stats.lock();
                        stats.connects += 1;
                    }
                    self.set_state(ConnectionState::Connected);
                    info!("Connected to relay: {}", self.url);

                    match self.run_session(session, &cancel).await {
                        SessionEnd::Cancelled => break,
                        SessionEnd::Failed(error) => self.record_failure(error),
                    }
                }
                Ok(Err(e)) => self.record_failure(e.to_string()),
                Err(_) => self.record_failure(format!(
                    "connection timeout after {:?}",
                    self.config.connect_timeout
                )),
            }

            let delay = self.backoff.lock().next_delay();
            debug!("{} reconnecting in {:?}", self.url, delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    async fn run_session(&self, session: Session, cancel: &CancellationToken) -> SessionEnd {
        let Session {
            mut sink,
            mut stream,
        } = session;
        let started = Instant::now();
        let mut saw_traffic = false;

        if let Some(replay) = &self.links.replay {
            for frame in replay(&self.url) {
                if let Err(e) = sink.send(OutFrame::Text(frame)).await {
                    return SessionEnd::Failed(e.to_string());
                }
            }
        }

        let period = self.config.ping_interval.max(Duration::from_millis(1));
        let mut keepalive = interval_at(started + period, period);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Err(e) = self.flush(&mut sink).await {
                return SessionEnd::Failed(e.to_string());
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = sink.close().await;
                    return SessionEnd::Cancelled;
                }
                frame = stream.next() => match frame {
                    Some(Ok(InFrame::Text(text))) => {
                        self.touch();
                        self.stats.lock().messages += 1;
                        if !saw_traffic {
                            // The relay answered, so this session is healthy.
                            saw_traffic = true;
                            self.backoff.lock().reset();
                            self.stats.lock().consecutive_failures = 0;
                        }
                        if text.starts_with("[\"AUTH\"") {
                            self.set_state(ConnectionState::Authenticating);
                        }
                        let frame = InboundFrame {
                            relay: self.url.clone(),
                            text,
                            received_at: Instant::now(),
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => return SessionEnd::Cancelled,
                            sent = self.links.inbound.send(frame) => {
                                if sent.is_err() {
                                    debug!("{} inbound channel closed, dropping frame", self.url);
                                }
                            }
                        }
                    }
                    Some(Ok(InFrame::Pong)) => self.touch(),
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Failed("connection closed by relay".to_string()),
                },
                _ = self.wake.notified() => {}
                _ = keepalive.tick() => {
                    let idle = self.idle_for(started);
                    if idle >= self.config.stale_after * 2 {
                        return SessionEnd::Failed(format!("no traffic for {:?}", idle));
                    }
                    if idle >= self.config.stale_after {
                        debug!("{} idle for {:?}, sending ping", self.url, idle);
                        if let Err(e) = sink.send(OutFrame::Ping).await {
                            return SessionEnd::Failed(e.to_string());
                        }
                    }
                }
            }
        }
    }

    /// Put an unsent frame back at the front. Frames queued meanwhile may have
    /// filled the queue, in which case the oldest is dropped as in `send`.
    fn requeue(&self, frame: String) {
        let capacity = self.config.outbound_queue_capacity.max(1);
        let mut dropped = 0;
        {
            let mut queue = self.queue.lock();
            queue.push_front(frame);
            while queue.len() > capacity {
                queue.pop_front();
                dropped += 1;
            }
        }
        if dropped > 0 {
            self.stats.lock().dropped_frames += dropped;
            warn!("{} outbound queue full, dropped {} unsent frames", self.url, dropped);
        }
    }

    /// Write every queued frame. A frame that fails to send goes back to the front.
    async fn flush(&self, sink: &mut FrameSink) -> Result<()> {
        loop {
            let Some(frame) = self.queue.lock().pop_front() else {
                return Ok(());
            };
            let answers_auth = frame.starts_with("[\"AUTH\",");
            if let Err(e) = sink.send(OutFrame::Text(frame.clone())).await {
                self.requeue(frame);
                return Err(e);
            }
            let authenticating = *self.state.lock() == ConnectionState::Authenticating;
            if answers_auth && authenticating {
                self.set_state(ConnectionState::Connected);
            }
        }
    }
}

impl std::fmt::Debug for RelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConnection")
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish()
    }
}
