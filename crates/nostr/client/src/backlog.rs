//! Request backlog: turns the unordered reply stream into request/response.
//!
//! Every logical fetch is a task keyed by its subscription id. A single actor
//! owns the pending map together with a [`DelayQueue`] holding each task's
//! deadline and debounce timer, and processes commands, timer expiries and
//! importer notifications one at a time. A task resolves through a oneshot
//! channel, so it completes at most once: whichever of response, timeout or
//! cancellation reaches the actor first wins and removes the task.
//!
//! Lifecycle: `Idle` (added) → `Scheduled` (fetch, debounce running) →
//! `InFlight` (REQ issued) → completed. A deadline can end the task in any
//! state; responses only complete tasks that are `InFlight`.

use crate::config::BacklogConfig;
use crate::importer::{DrainReason, ImportNotification, PRIO_PREFIX};
use crate::message::RawEvent;
use crate::subscription::generate_subscription_id;
use crate::relay_url::RelayUrl;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::time::{DelayQueue, delay_queue};
use tracing::{debug, trace, warn};

/// Closes a subscription on the relays once its task is done.
pub trait SubscriptionCloser: Send + Sync {
    fn close_subscription(&self, subscription_id: &str);
}

/// Where a task is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Added, waiting for `fetch`
    Idle,
    /// Debounce running
    Scheduled,
    /// REQ issued, waiting for a response or the deadline
    InFlight,
}

/// What answered a task.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSignal {
    /// Events for the subscription were imported
    Imported,
    /// First event of a priority task
    Event { relay: RelayUrl, event: RawEvent },
    /// A relay finished sending stored events
    Drained {
        relay: RelayUrl,
        all_relays: bool,
        reason: DrainReason,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub subscription_id: String,
    pub signal: ResponseSignal,
}

/// How a task ended. Exactly one of these is delivered per task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Response(Response),
    Timeout { subscription_id: String },
    /// Replaced, cleared, cancelled, or the backlog shut down
    Cancelled,
}

type ReqFn = Box<dyn FnMut(&str) + Send>;

/// A logical fetch.
///
/// `req` is invoked with the task's subscription id once the debounce after
/// the last `fetch` elapses; it is expected to hand a REQ to the pool.
pub struct ReqTask {
    id: Option<String>,
    prefix: Option<String>,
    prio: bool,
    debounce: Option<Duration>,
    timeout: Option<Duration>,
    req: ReqFn,
}

impl ReqTask {
    pub fn new(req: impl FnMut(&str) + Send + 'static) -> Self {
        Self {
            id: None,
            prefix: None,
            prio: false,
            debounce: None,
            timeout: None,
            req: Box::new(req),
        }
    }

    /// Use a fixed id instead of a generated one. Adding a task whose id is
    /// live replaces the old task.
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Namespace for the subscription id, overriding the backlog default.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Complete on the first event instead of on the batched import signal.
    pub fn prio(mut self) -> Self {
        self.prio = true;
        self
    }

    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.debounce = Some(debounce);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for ReqTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReqTask")
            .field("id", &self.id)
            .field("prefix", &self.prefix)
            .field("prio", &self.prio)
            .field("debounce", &self.debounce)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

enum Command {
    Add {
        id: String,
        serial: u64,
        prio: bool,
        debounce: Duration,
        timeout: Duration,
        req: ReqFn,
        outcome: oneshot::Sender<TaskOutcome>,
    },
    Fetch {
        id: String,
        serial: u64,
    },
    Cancel {
        id: String,
        serial: u64,
    },
    Deliver(ImportNotification),
    Clear,
    Len(oneshot::Sender<usize>),
    State(String, oneshot::Sender<Option<TaskState>>),
    TasksWith(Vec<String>, oneshot::Sender<Vec<String>>),
}

/// Caller's side of one task.
#[derive(Debug)]
pub struct TaskHandle {
    subscription_id: String,
    serial: u64,
    commands: mpsc::UnboundedSender<Command>,
    outcome: oneshot::Receiver<TaskOutcome>,
}

impl TaskHandle {
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Request the data. Calls within the debounce window coalesce into one REQ.
    pub fn fetch(&self) {
        let _ = self.commands.send(Command::Fetch {
            id: self.subscription_id.clone(),
            serial: self.serial,
        });
    }

    /// Abandon this task. Resolves `Cancelled` unless it already completed.
    pub fn cancel(&self) {
        let _ = self.commands.send(Command::Cancel {
            id: self.subscription_id.clone(),
            serial: self.serial,
        });
    }

    /// Outcome without waiting, if the task already completed.
    pub fn try_outcome(&mut self) -> Option<TaskOutcome> {
        match self.outcome.try_recv() {
            Ok(outcome) => Some(outcome),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(TaskOutcome::Cancelled),
        }
    }

    /// Wait for the task to complete.
    pub async fn outcome(self) -> TaskOutcome {
        self.outcome.await.unwrap_or(TaskOutcome::Cancelled)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Add { id, serial, .. } => write!(f, "Add({id}#{serial})"),
            Command::Fetch { id, serial } => write!(f, "Fetch({id}#{serial})"),
            Command::Cancel { id, serial } => write!(f, "Cancel({id}#{serial})"),
            Command::Deliver(n) => write!(f, "Deliver({n:?})"),
            Command::Clear => f.write_str("Clear"),
            Command::Len(_) => f.write_str("Len"),
            Command::State(id, _) => write!(f, "State({id})"),
            Command::TasksWith(ids, _) => write!(f, "TasksWith({ids:?})"),
        }
    }
}

/// Handle to the backlog actor.
pub struct Backlog {
    config: BacklogConfig,
    commands: mpsc::UnboundedSender<Command>,
    next_serial: AtomicU64,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Backlog {
    /// Start the actor.
    ///
    /// With `config.auto` set, the actor consumes `notifications` itself;
    /// otherwise they are ignored and the caller forwards them via [`Backlog::deliver`].
    pub fn spawn(
        config: BacklogConfig,
        closer: Arc<dyn SubscriptionCloser>,
        notifications: Option<broadcast::Receiver<ImportNotification>>,
    ) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let notifications = if config.auto { notifications } else { None };
        let actor = Actor {
            closer,
            tasks: HashMap::new(),
            delays: DelayQueue::new(),
        };
        let handle = tokio::spawn(actor.run(rx, notifications, cancel.clone()));
        Self {
            config,
            commands,
            next_serial: AtomicU64::new(1),
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &BacklogConfig {
        &self.config
    }

    /// Add a task and arm its deadline. Returns immediately.
    pub fn add(&self, task: ReqTask) -> TaskHandle {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let prefix = task.prefix.as_deref().or(self.config.prefix.as_deref());
        let base = match task.id {
            Some(id) => format!("{}{}", prefix.unwrap_or_default(), id),
            None => generate_subscription_id(prefix),
        };
        let subscription_id = if task.prio {
            format!("{PRIO_PREFIX}{base}")
        } else {
            base
        };

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let command = Command::Add {
            id: subscription_id.clone(),
            serial,
            prio: task.prio,
            debounce: task.debounce.unwrap_or(self.config.debounce_time),
            timeout: task.timeout.unwrap_or(self.config.timeout),
            req: task.req,
            outcome: outcome_tx,
        };
        if self.commands.send(command).is_err() {
            warn!("backlog stopped, task {} resolves as cancelled", subscription_id);
        }

        TaskHandle {
            subscription_id,
            serial,
            commands: self.commands.clone(),
            outcome: outcome_rx,
        }
    }

    /// Hand an importer notification to the actor.
    pub fn deliver(&self, notification: ImportNotification) {
        let _ = self.commands.send(Command::Deliver(notification));
    }

    /// Drop every task without firing responses or timeouts. Each resolves
    /// `Cancelled` and its subscription is closed.
    pub fn clear(&self) {
        let _ = self.commands.send(Command::Clear);
    }

    async fn query<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).ok()?;
        rx.await.ok()
    }

    /// Number of live tasks.
    pub async fn len(&self) -> usize {
        self.query(Command::Len).await.unwrap_or(0)
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn state(&self, subscription_id: &str) -> Option<TaskState> {
        self.query(|tx| Command::State(subscription_id.to_string(), tx))
            .await
            .flatten()
    }

    /// Which of `subscription_ids` belong to live tasks.
    pub async fn tasks_with(&self, subscription_ids: &[String]) -> Vec<String> {
        self.query(|tx| Command::TasksWith(subscription_ids.to_vec(), tx))
            .await
            .unwrap_or_default()
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Stop the actor. Pending tasks resolve `Cancelled`.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("backlog actor ended abnormally: {}", e);
        }
    }
}

impl Drop for Backlog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[derive(Debug, Clone)]
enum Timer {
    Deadline { id: String, serial: u64 },
    Debounce { id: String, serial: u64 },
}

struct Entry {
    serial: u64,
    prio: bool,
    debounce: Duration,
    state: TaskState,
    req: ReqFn,
    outcome: oneshot::Sender<TaskOutcome>,
    deadline_key: Option<delay_queue::Key>,
    debounce_key: Option<delay_queue::Key>,
}

struct Actor {
    closer: Arc<dyn SubscriptionCloser>,
    tasks: HashMap<String, Entry>,
    delays: DelayQueue<Timer>,
}

async fn next_notification(
    notifications: &mut Option<broadcast::Receiver<ImportNotification>>,
) -> std::result::Result<ImportNotification, RecvError> {
    match notifications {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut notifications: Option<broadcast::Receiver<ImportNotification>>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                Some(expired) = self.delays.next(), if !self.delays.is_empty() => {
                    self.expire(expired.into_inner());
                }
                received = next_notification(&mut notifications) => match received {
                    Ok(notification) => self.respond(notification),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("backlog missed {} import notifications", skipped);
                    }
                    Err(RecvError::Closed) => {
                        debug!("import notifications closed");
                        notifications = None;
                    }
                },
            }
        }

        let ids: Vec<String> = self.tasks.keys().cloned().collect();
        for id in ids {
            self.finish(&id, TaskOutcome::Cancelled);
        }
        debug!("backlog stopped");
    }

    fn handle(&mut self, command: Command) {
        trace!("backlog command {:?}", command);
        match command {
            Command::Add {
                id,
                serial,
                prio,
                debounce,
                timeout,
                req,
                outcome,
            } => {
                if self.tasks.contains_key(&id) {
                    debug!("task {} replaced", id);
                    self.finish(&id, TaskOutcome::Cancelled);
                }
                let deadline_key = self.delays.insert(
                    Timer::Deadline {
                        id: id.clone(),
                        serial,
                    },
                    timeout,
                );
                self.tasks.insert(
                    id,
                    Entry {
                        serial,
                        prio,
                        debounce,
                        state: TaskState::Idle,
                        req,
                        outcome,
                        deadline_key: Some(deadline_key),
                        debounce_key: None,
                    },
                );
            }
            Command::Fetch { id, serial } => self.fetch(&id, serial),
            Command::Cancel { id, serial } => {
                if self.tasks.get(&id).is_some_and(|e| e.serial == serial) {
                    self.finish(&id, TaskOutcome::Cancelled);
                }
            }
            Command::Deliver(notification) => self.respond(notification),
            Command::Clear => {
                let ids: Vec<String> = self.tasks.keys().cloned().collect();
                debug!("clearing {} tasks", ids.len());
                for id in ids {
                    self.finish(&id, TaskOutcome::Cancelled);
                }
            }
            Command::Len(reply) => {
                let _ = reply.send(self.tasks.len());
            }
            Command::State(id, reply) => {
                let _ = reply.send(self.tasks.get(&id).map(|e| e.state));
            }
            Command::TasksWith(ids, reply) => {
                let live = ids
                    .into_iter()
                    .filter(|id| self.tasks.contains_key(id))
                    .collect();
                let _ = reply.send(live);
            }
        }
    }

    fn fetch(&mut self, id: &str, serial: u64) {
        let Some(entry) = self.tasks.get_mut(id) else {
            return;
        };
        if entry.serial != serial {
            return;
        }
        match entry.state {
            TaskState::InFlight => {
                debug!("task {} already in flight, fetch ignored", id);
            }
            TaskState::Idle | TaskState::Scheduled => {
                match &entry.debounce_key {
                    Some(key) => self.delays.reset(key, entry.debounce),
                    None => {
                        let key = self.delays.insert(
                            Timer::Debounce {
                                id: id.to_string(),
                                serial,
                            },
                            entry.debounce,
                        );
                        entry.debounce_key = Some(key);
                    }
                }
                entry.state = TaskState::Scheduled;
            }
        }
    }

    fn expire(&mut self, timer: Timer) {
        match timer {
            Timer::Debounce { id, serial } => {
                let Some(entry) = self.tasks.get_mut(&id) else {
                    return;
                };
                if entry.serial != serial {
                    return;
                }
                entry.debounce_key = None;
                entry.state = TaskState::InFlight;
                debug!("issuing request for task {}", id);
                (entry.req)(&id);
            }
            Timer::Deadline { id, serial } => {
                let Some(entry) = self.tasks.get_mut(&id) else {
                    return;
                };
                if entry.serial != serial {
                    return;
                }
                entry.deadline_key = None;
                debug!("task {} timed out in state {:?}", id, entry.state);
                let outcome = TaskOutcome::Timeout {
                    subscription_id: id.clone(),
                };
                self.finish(&id, outcome);
            }
        }
    }

    fn respond(&mut self, notification: ImportNotification) {
        match notification {
            ImportNotification::Imported { subscription_ids } => {
                for id in subscription_ids {
                    if self.in_flight(&id).is_some_and(|prio| !prio) {
                        self.complete(id, ResponseSignal::Imported);
                    }
                }
            }
            ImportNotification::Prio {
                subscription_id,
                relay,
                event,
            } => {
                if self.in_flight(&subscription_id).is_some_and(|prio| prio) {
                    self.complete(subscription_id, ResponseSignal::Event { relay, event });
                }
            }
            ImportNotification::Drained {
                subscription_id,
                relay,
                all_relays,
                reason,
            } => {
                if self.in_flight(&subscription_id).is_some() {
                    self.complete(
                        subscription_id,
                        ResponseSignal::Drained {
                            relay,
                            all_relays,
                            reason,
                        },
                    );
                }
            }
            ImportNotification::Ok { .. } | ImportNotification::AuthChallenge { .. } => {}
        }
    }

    /// `Some(prio)` if the task is waiting for a response.
    fn in_flight(&self, id: &str) -> Option<bool> {
        self.tasks
            .get(id)
            .filter(|e| e.state == TaskState::InFlight)
            .map(|e| e.prio)
    }

    fn complete(&mut self, subscription_id: String, signal: ResponseSignal) {
        let outcome = TaskOutcome::Response(Response {
            subscription_id: subscription_id.clone(),
            signal,
        });
        self.finish(&subscription_id, outcome);
    }

    /// Remove the task, cancel its remaining timers, resolve it and close its subscription.
    fn finish(&mut self, id: &str, outcome: TaskOutcome) {
        let Some(entry) = self.tasks.remove(id) else {
            return;
        };
        if let Some(key) = entry.deadline_key {
            self.delays.remove(&key);
        }
        if let Some(key) = entry.debounce_key {
            self.delays.remove(&key);
        }
        debug!("task {} completed: {:?}", id, outcome);
        // The handle may be gone; nobody is waiting then.
        let _ = entry.outcome.send(outcome);
        self.closer.close_subscription(id);
    }
}
