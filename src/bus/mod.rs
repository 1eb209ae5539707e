//! Asynchronous publish/subscribe message bus.
//!
//! Every topic is a bounded mpsc channel drained by one dispatcher task,
//! which invokes the topic's subscribers in subscription order. That keeps
//! per-subscriber delivery in publish order for a topic while topics run
//! independently of each other. Direct messages go to per-agent bounded
//! inboxes.
//!
//! A full queue either blocks the publisher or fails fast, depending on
//! the configured `BackpressurePolicy`. A failing or panicking handler is
//! logged and skipped; it never stops the dispatcher.

pub mod message;

pub use message::{
    CorrelationId, Message, MessageKind, Payload, Recipient, ORCHESTRATOR_SENDER,
    ORCHESTRATOR_TOPIC, STATUS_TOPIC,
};

use crate::agent::AgentId;
pub use crate::config::BackpressurePolicy;
use crate::config::Config;
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Receives messages published on a subscribed topic.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Result<()>;
}

/// Forwards every message into an mpsc channel.
///
/// The orchestrator subscribes with one of these so its run loop can
/// process reports serially alongside its own commands.
pub struct ChannelHandler {
    tx: mpsc::Sender<Message>,
}

impl ChannelHandler {
    pub fn new(tx: mpsc::Sender<Message>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn handle(&self, message: Message) -> Result<()> {
        self.tx.send(message).await.map_err(|_| Error::BusClosed)
    }
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, message: Message) -> Result<()> {
        (self.0)(message).await
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Identifier returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Queue sizes and limits for a bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub topic_capacity: usize,
    pub inbox_capacity: usize,
    pub backpressure: BackpressurePolicy,
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for BusConfig {
    fn from(config: &Config) -> Self {
        Self {
            topic_capacity: config.topic_capacity.max(1),
            inbox_capacity: config.inbox_capacity.max(1),
            backpressure: config.backpressure,
            history_limit: config.history_limit,
        }
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    subscriber: String,
    /// First topic sequence number this subscription should see.
    since: u64,
    handler: Arc<dyn MessageHandler>,
}

struct Envelope {
    seq: u64,
    message: Message,
}

struct Topic {
    tx: mpsc::Sender<Envelope>,
    next_seq: Arc<AtomicU64>,
    subscribers: Arc<RwLock<Vec<Subscription>>>,
}

struct BusInner {
    config: BusConfig,
    topics: Mutex<HashMap<String, Topic>>,
    inboxes: Mutex<HashMap<AgentId, mpsc::Sender<Message>>>,
    history: Mutex<VecDeque<Message>>,
    next_subscription: AtomicU64,
    delivery_failures: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to a message bus. Clones share the same bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                topics: Mutex::new(HashMap::new()),
                inboxes: Mutex::new(HashMap::new()),
                history: Mutex::new(VecDeque::new()),
                next_subscription: AtomicU64::new(1),
                delivery_failures: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(BusConfig::from(config))
    }

    pub fn backpressure(&self) -> BackpressurePolicy {
        self.inner.config.backpressure
    }

    /// Register a handler for every message published on `topic` from now on.
    ///
    /// The first subscription to a topic spawns its dispatcher, so this must
    /// be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        topic: &str,
        subscriber: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        if self.is_closed() {
            return Err(Error::BusClosed);
        }
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::Relaxed));
        let mut topics = lock(&self.inner.topics);
        let entry = topics
            .entry(topic.to_string())
            .or_insert_with(|| self.spawn_topic(topic));
        let since = entry.next_seq.load(Ordering::SeqCst);
        write(&entry.subscribers).push(Subscription {
            id,
            subscriber: subscriber.to_string(),
            since,
            handler,
        });
        debug!("'{}' subscribed to topic '{}'", subscriber, topic);
        Ok(id)
    }

    /// Remove a subscription. Returns false if it was not found.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let topics = lock(&self.inner.topics);
        for (name, topic) in topics.iter() {
            let mut subs = write(&topic.subscribers);
            if let Some(pos) = subs.iter().position(|s| s.id == id) {
                let removed = subs.remove(pos);
                debug!(
                    "'{}' unsubscribed from topic '{}'",
                    removed.subscriber, name
                );
                return true;
            }
        }
        false
    }

    fn spawn_topic(&self, name: &str) -> Topic {
        let (tx, rx) = mpsc::channel(self.inner.config.topic_capacity);
        let subscribers: Arc<RwLock<Vec<Subscription>>> = Arc::new(RwLock::new(Vec::new()));
        tokio::spawn(dispatch(
            name.to_string(),
            rx,
            subscribers.clone(),
            Arc::downgrade(&self.inner),
            self.inner.cancel.child_token(),
        ));
        Topic {
            tx,
            next_seq: Arc::new(AtomicU64::new(0)),
            subscribers,
        }
    }

    /// Publish `message` to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub async fn publish(&self, topic: &str, message: Message) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::BusClosed);
        }
        self.record(&message);

        let (tx, seq, subscribers) = {
            let topics = lock(&self.inner.topics);
            let Some(entry) = topics.get(topic) else {
                trace!("No subscribers on topic '{}'", topic);
                return Ok(0);
            };
            let count = read(&entry.subscribers).len();
            if count == 0 {
                return Ok(0);
            }
            (
                entry.tx.clone(),
                entry.next_seq.fetch_add(1, Ordering::SeqCst),
                count,
            )
        };

        let envelope = Envelope { seq, message };
        match self.inner.config.backpressure {
            BackpressurePolicy::Block => tx.send(envelope).await.map_err(|_| Error::BusClosed)?,
            BackpressurePolicy::Reject => tx.try_send(envelope).map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => Error::TopicFull {
                    topic: topic.to_string(),
                },
                mpsc::error::TrySendError::Closed(_) => Error::BusClosed,
            })?,
        }
        trace!("Queued message on '{}' for {} subscriber(s)", topic, subscribers);
        Ok(subscribers)
    }

    /// Create (or replace) the inbox for `agent` and return its receiving end.
    pub fn register_inbox(&self, agent: &AgentId) -> mpsc::Receiver<Message> {
        let (tx, rx) = mpsc::channel(self.inner.config.inbox_capacity);
        lock(&self.inner.inboxes).insert(agent.clone(), tx);
        debug!("Registered inbox for agent {}", agent);
        rx
    }

    pub fn unregister_inbox(&self, agent: &AgentId) -> bool {
        lock(&self.inner.inboxes).remove(agent).is_some()
    }

    pub fn has_inbox(&self, agent: &AgentId) -> bool {
        lock(&self.inner.inboxes).contains_key(agent)
    }

    /// Deliver `message` to exactly one agent's inbox.
    pub async fn send_direct(&self, agent: &AgentId, message: Message) -> Result<()> {
        let tx = self.inbox(agent)?;
        self.record(&message);

        match self.inner.config.backpressure {
            BackpressurePolicy::Block => {
                tx.send(message)
                    .await
                    .map_err(|_| Error::UnknownRecipient {
                        agent: agent.clone(),
                    })?
            }
            BackpressurePolicy::Reject => Self::offer(&tx, agent, message)?,
        }
        trace!("Delivered direct message to {}", agent);
        Ok(())
    }

    /// Deliver to one inbox without waiting, whatever the backpressure policy.
    ///
    /// Fails with `InboxFull` when the agent is not draining its inbox.
    pub fn try_send_direct(&self, agent: &AgentId, message: Message) -> Result<()> {
        let tx = self.inbox(agent)?;
        self.record(&message);
        Self::offer(&tx, agent, message)?;
        trace!("Delivered direct message to {}", agent);
        Ok(())
    }

    fn inbox(&self, agent: &AgentId) -> Result<mpsc::Sender<Message>> {
        if self.is_closed() {
            return Err(Error::BusClosed);
        }
        lock(&self.inner.inboxes)
            .get(agent)
            .cloned()
            .ok_or_else(|| Error::UnknownRecipient {
                agent: agent.clone(),
            })
    }

    fn offer(tx: &mpsc::Sender<Message>, agent: &AgentId, message: Message) -> Result<()> {
        tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::InboxFull {
                agent: agent.clone(),
            },
            mpsc::error::TrySendError::Closed(_) => Error::UnknownRecipient {
                agent: agent.clone(),
            },
        })
    }

    fn record(&self, message: &Message) {
        let limit = self.inner.config.history_limit;
        if limit == 0 {
            return;
        }
        let mut history = lock(&self.inner.history);
        history.push_back(message.clone());
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// The most recent messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let history = lock(&self.inner.history);
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    /// Number of subscriptions on `topic`, or on all topics when `None`.
    pub fn subscription_count(&self, topic: Option<&str>) -> usize {
        let topics = lock(&self.inner.topics);
        match topic {
            Some(name) => topics
                .get(name)
                .map(|t| read(&t.subscribers).len())
                .unwrap_or(0),
            None => topics.values().map(|t| read(&t.subscribers).len()).sum(),
        }
    }

    /// Topics with at least one subscription, sorted.
    pub fn topics(&self) -> Vec<String> {
        let topics = lock(&self.inner.topics);
        let mut names: Vec<String> = topics
            .iter()
            .filter(|(_, t)| !read(&t.subscribers).is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Handler invocations that returned an error or panicked.
    pub fn delivery_failures(&self) -> u64 {
        self.inner.delivery_failures.load(Ordering::Relaxed)
    }

    /// Stop all dispatchers and reject further publishes.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        lock(&self.inner.inboxes).clear();
        debug!("Message bus shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

async fn dispatch(
    topic: String,
    mut rx: mpsc::Receiver<Envelope>,
    subscribers: Arc<RwLock<Vec<Subscription>>>,
    bus: std::sync::Weak<BusInner>,
    cancel: CancellationToken,
) {
    loop {
        let envelope = tokio::select! {
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };

        // Snapshot so no lock is held across handler awaits.
        let targets: Vec<Subscription> = read(&subscribers)
            .iter()
            .filter(|s| s.since <= envelope.seq)
            .cloned()
            .collect();

        for sub in targets {
            let outcome = AssertUnwindSafe(sub.handler.handle(envelope.message.clone()))
                .catch_unwind()
                .await;
            let error = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => e.to_string(),
                Err(_) => "handler panicked".to_string(),
            };
            let err = Error::BusDelivery {
                topic: topic.clone(),
                error,
            };
            warn!("Subscriber '{}': {}", sub.subscriber, err);
            if let Some(inner) = bus.upgrade() {
                inner.delivery_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("Dispatcher for topic '{}' stopped", topic);
}

// Poisoning only happens if a thread panicked while holding the lock; the
// guarded collections stay structurally valid, so keep going.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
