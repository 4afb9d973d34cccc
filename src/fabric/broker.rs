//! Process-wide message broker.
//!
//! The broker is the only shared-mutable structure in the system. It owns one
//! inbox per registered agent plus the kind-to-subscribers index, both behind
//! a single `parking_lot::Mutex`. Delivery targets are resolved under the
//! lock; the actual enqueues happen after it is released, so a bounded inbox
//! exerting back-pressure never stalls other publishers inside the lock.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::messages::{Message, MessageId, MessageKind};
use super::types::AgentId;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("agent `{0}` is already registered")]
    AlreadyRegistered(AgentId),
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a subscriber snapshot stays valid before it is rebuilt.
    pub cache_ttl: Duration,
    /// Bounded inbox capacity. `None` (the default) means unbounded; a bound
    /// makes `publish` block the sender when a recipient's inbox is full.
    pub inbox_capacity: Option<usize>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(5),
            inbox_capacity: None,
        }
    }
}

// ─────────────────────────────────────────────────────────
// Inbox
// ─────────────────────────────────────────────────────────

/// Receiving end of an agent's FIFO inbox. Cloneable so the idempotent
/// registration path can hand out another handle to the same queue.
#[derive(Debug, Clone)]
pub struct Inbox {
    receiver: async_channel::Receiver<Arc<Message>>,
}

impl Inbox {
    /// Wait for the next message. Returns `None` once the agent has been
    /// unregistered and the queue is drained.
    pub async fn recv(&self) -> Option<Arc<Message>> {
        self.receiver.recv().await.ok()
    }

    /// Non-blocking dequeue for the cooperative drain loop.
    pub fn try_recv(&self) -> Option<Arc<Message>> {
        self.receiver.try_recv().ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

struct Route {
    sender: async_channel::Sender<Arc<Message>>,
    receiver: async_channel::Receiver<Arc<Message>>,
}

struct SubscriberSnapshot {
    ids: Vec<AgentId>,
    taken: Instant,
}

#[derive(Default)]
struct BrokerState {
    routes: HashMap<AgentId, Route>,
    subscriptions: HashMap<MessageKind, HashSet<AgentId>>,
    cache: HashMap<MessageKind, SubscriberSnapshot>,
}

// ─────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────

pub struct MessageBroker {
    cfg: BrokerConfig,
    next_id: AtomicU64,
    state: Mutex<BrokerState>,
}

impl MessageBroker {
    pub fn new(cfg: BrokerConfig) -> MessageBroker {
        MessageBroker {
            cfg,
            next_id: AtomicU64::new(1),
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Create the inbox for `agent_id`. Fails if the id is taken.
    pub fn register(&self, agent_id: &str) -> Result<Inbox, BrokerError> {
        let mut state = self.state.lock();
        if state.routes.contains_key(agent_id) {
            return Err(BrokerError::AlreadyRegistered(agent_id.to_string()));
        }
        let (sender, receiver) = match self.cfg.inbox_capacity {
            Some(cap) => async_channel::bounded(cap),
            None => async_channel::unbounded(),
        };
        state.routes.insert(
            agent_id.to_string(),
            Route {
                sender,
                receiver: receiver.clone(),
            },
        );
        debug!(agent = agent_id, "registered");
        Ok(Inbox { receiver })
    }

    /// Idempotent registration: an existing agent gets another handle to its
    /// current inbox instead of an error.
    pub fn register_or_attach(&self, agent_id: &str) -> Inbox {
        {
            let state = self.state.lock();
            if let Some(route) = state.routes.get(agent_id) {
                warn!(agent = agent_id, "already registered, reusing inbox");
                return Inbox {
                    receiver: route.receiver.clone(),
                };
            }
        }
        // Not present above; a racing registration still wins here.
        match self.register(agent_id) {
            Ok(inbox) => inbox,
            Err(BrokerError::AlreadyRegistered(_)) => {
                let state = self.state.lock();
                Inbox {
                    receiver: state.routes[agent_id].receiver.clone(),
                }
            }
        }
    }

    /// Remove the agent's inbox and purge it from every subscription set.
    pub fn unregister(&self, agent_id: &str) {
        let mut state = self.state.lock();
        if state.routes.remove(agent_id).is_none() {
            return;
        }
        let mut touched = Vec::new();
        for (kind, subscribers) in state.subscriptions.iter_mut() {
            if subscribers.remove(agent_id) {
                touched.push(*kind);
            }
        }
        for kind in touched {
            state.cache.remove(&kind);
        }
        debug!(agent = agent_id, "unregistered");
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.state.lock().routes.contains_key(agent_id)
    }

    pub fn subscribe(&self, agent_id: &str, kinds: &[MessageKind]) {
        let mut state = self.state.lock();
        for kind in kinds {
            let inserted = state
                .subscriptions
                .entry(*kind)
                .or_default()
                .insert(agent_id.to_string());
            if inserted {
                state.cache.remove(kind);
            }
        }
        info!(agent = agent_id, kinds = kinds.len(), "subscribed");
    }

    pub fn unsubscribe(&self, agent_id: &str, kinds: &[MessageKind]) {
        let mut state = self.state.lock();
        for kind in kinds {
            let removed = state
                .subscriptions
                .get_mut(kind)
                .map(|s| s.remove(agent_id))
                .unwrap_or(false);
            if removed {
                state.cache.remove(kind);
            }
        }
    }

    /// Next value of the global monotonic message id. Zero-padded so string
    /// order equals assignment order.
    pub fn next_message_id(&self) -> MessageId {
        format!("{:020}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Route one message. Direct messages go to the registered subset of
    /// `recipients`; broadcasts go to every subscriber of the kind except the
    /// sender. Delivery failures never surface to the publisher.
    pub async fn publish(&self, mut message: Message) -> MessageId {
        message.id = self.next_message_id();
        let id = message.id.clone();
        let targets = self.resolve_targets(&message);
        let shared = Arc::new(message);
        for (agent, sender) in targets {
            if sender.send(Arc::clone(&shared)).await.is_err() {
                debug!(agent = %agent, "inbox closed, message dropped");
            }
        }
        id
    }

    /// Route a batch, grouping per recipient so each inbox is written in one
    /// pass. Every recipient observes the batch's internal order as a
    /// contiguous run.
    pub async fn publish_batch(&self, messages: Vec<Message>) -> Vec<MessageId> {
        let mut ids = Vec::with_capacity(messages.len());
        let mut per_recipient: Vec<(AgentId, Sender, Vec<Arc<Message>>)> = Vec::new();
        {
            // Ids are assigned and targets resolved under one lock hold so a
            // concurrent unsubscribe cannot split the batch's view.
            let mut state = self.state.lock();
            for mut message in messages {
                message.id = format!("{:020}", self.next_id.fetch_add(1, Ordering::Relaxed));
                ids.push(message.id.clone());
                let targets = Self::resolve_with(&mut state, &message, self.cfg.cache_ttl);
                let shared = Arc::new(message);
                for (agent, sender) in targets {
                    match per_recipient.iter_mut().find(|(a, _, _)| *a == agent) {
                        Some((_, _, queue)) => queue.push(Arc::clone(&shared)),
                        None => per_recipient.push((agent, sender, vec![Arc::clone(&shared)])),
                    }
                }
            }
        }
        for (agent, sender, queue) in per_recipient {
            for msg in queue {
                if sender.send(msg).await.is_err() {
                    debug!(agent = %agent, "inbox closed, batch remainder dropped");
                    break;
                }
            }
        }
        ids
    }

    fn resolve_targets(&self, message: &Message) -> Vec<(AgentId, Sender)> {
        let mut state = self.state.lock();
        Self::resolve_with(&mut state, message, self.cfg.cache_ttl)
    }

    fn resolve_with(
        state: &mut BrokerState,
        message: &Message,
        cache_ttl: Duration,
    ) -> Vec<(AgentId, Sender)> {
        if !message.recipients.is_empty() {
            return message
                .recipients
                .iter()
                .filter_map(|id| {
                    let route = state.routes.get(id);
                    if route.is_none() {
                        debug!(recipient = %id, msg_id = %message.id, "unknown recipient dropped");
                    }
                    route.map(|r| (id.clone(), r.sender.clone()))
                })
                .collect();
        }
        Self::subscribers_for(state, message.kind, cache_ttl)
            .into_iter()
            .filter(|id| *id != message.sender)
            .filter_map(|id| {
                state
                    .routes
                    .get(&id)
                    .map(|r| (id.clone(), r.sender.clone()))
            })
            .collect()
    }

    /// Subscriber snapshot for a kind, served from the TTL cache when fresh.
    /// The cache holds owned ids, not references, so a reader can never see a
    /// torn set across an invalidation.
    fn subscribers_for(
        state: &mut BrokerState,
        kind: MessageKind,
        cache_ttl: Duration,
    ) -> Vec<AgentId> {
        let now = Instant::now();
        if let Some(snapshot) = state.cache.get(&kind) {
            if now.duration_since(snapshot.taken) < cache_ttl {
                return snapshot.ids.clone();
            }
        }
        let ids: Vec<AgentId> = state
            .subscriptions
            .get(&kind)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        state.cache.insert(
            kind,
            SubscriberSnapshot {
                ids: ids.clone(),
                taken: now,
            },
        );
        ids
    }
}

type Sender = async_channel::Sender<Arc<Message>>;
