use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use super::channel::Channel;
use super::event::RealtimeEvent;
use super::index::SubscriptionIndex;
use super::metrics;
use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;

pub type ConnectionId = u64;

/// Item on a connection's outbound queue.
#[derive(Clone, Debug)]
pub enum Delivery {
    Event {
        channel: Channel,
        event: Arc<RealtimeEvent>,
    },
    /// The connection lost access to the channel.
    Revoked { channel: Channel },
}

#[derive(Clone, Copy, Debug)]
pub struct RegistryConfig {
    pub queue_capacity: usize,
    pub liveness_deadline: Duration,
}

#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub receiver: mpsc::Receiver<Delivery>,
}

struct ConnectionEntry {
    actor: ActorIdentity,
    sender: mpsc::Sender<Delivery>,
    last_seen: Instant,
    stalled: bool,
    channels: HashSet<Channel>,
}

/// Live connections, their liveness and the channels each one is subscribed to.
pub struct ConnectionRegistry {
    index: Arc<SubscriptionIndex>,
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    next_id: AtomicU64,
    config: RegistryConfig,
}

impl ConnectionRegistry {
    pub(crate) fn new(index: Arc<SubscriptionIndex>, config: RegistryConfig) -> Self {
        Self {
            index,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            config: RegistryConfig {
                queue_capacity: config.queue_capacity.max(1),
                liveness_deadline: config.liveness_deadline,
            },
        }
    }

    pub fn register(&self, actor: &ActorIdentity) -> ConnectionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.config.queue_capacity);
        let open = {
            let mut connections = self.lock();
            connections.insert(
                id,
                ConnectionEntry {
                    actor: actor.clone(),
                    sender,
                    last_seen: Instant::now(),
                    stalled: false,
                    channels: HashSet::new(),
                },
            );
            connections.len()
        };
        metrics::record_open_connections(open);
        debug!(connection_id = id, actor_id = %actor.user_id, "connection registered");
        ConnectionHandle { id, receiver }
    }

    /// Refreshes liveness. Returns `false` when the connection is gone.
    pub fn touch(&self, id: ConnectionId) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn deregister(&self, id: ConnectionId) -> bool {
        let (entry, open) = {
            let mut connections = self.lock();
            let Some(entry) = connections.remove(&id) else {
                return false;
            };
            (entry, connections.len())
        };
        metrics::record_open_connections(open);
        for channel in &entry.channels {
            self.index.remove(channel, id);
        }
        debug!(connection_id = id, "connection deregistered");
        true
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    /// Drops connections that are stalled or have not been touched within the
    /// liveness deadline as of `now`, cancelling their subscriptions.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let deadline = self.config.liveness_deadline;
        let (expired, open): (Vec<(ConnectionId, ConnectionEntry)>, usize) = {
            let mut connections = self.lock();
            let ids: Vec<ConnectionId> = connections
                .iter()
                .filter(|(_, entry)| {
                    entry.stalled || now.saturating_duration_since(entry.last_seen) > deadline
                })
                .map(|(id, _)| *id)
                .collect();
            let expired = ids
                .into_iter()
                .filter_map(|id| connections.remove(&id).map(|entry| (id, entry)))
                .collect();
            (expired, connections.len())
        };
        metrics::record_open_connections(open);

        for (id, entry) in &expired {
            for channel in &entry.channels {
                self.index.remove(channel, *id);
            }
            debug!(
                connection_id = *id,
                actor_id = %entry.actor.user_id,
                stalled = entry.stalled,
                "connection swept"
            );
        }
        if !expired.is_empty() {
            metrics::record_swept(expired.len());
        }
        expired.len()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let swept = registry.sweep();
                if swept > 0 {
                    info!(swept, remaining = registry.len(), "swept idle realtime connections");
                }
            }
        })
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn channels_of(&self, id: ConnectionId) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .lock()
            .get(&id)
            .map(|entry| entry.channels.iter().cloned().collect())
            .unwrap_or_default();
        channels.sort();
        channels
    }

    pub(crate) fn sender_for(
        &self,
        id: ConnectionId,
        actor: &ActorIdentity,
    ) -> DomainResult<mpsc::Sender<Delivery>> {
        let connections = self.lock();
        let entry = connections.get(&id).ok_or(DomainError::NotFound)?;
        if entry.actor.user_id != actor.user_id {
            return Err(DomainError::NotFound);
        }
        Ok(entry.sender.clone())
    }

    pub(crate) fn record_subscription(&self, id: ConnectionId, channel: &Channel) -> bool {
        match self.lock().get_mut(&id) {
            Some(entry) => {
                entry.channels.insert(channel.clone());
                true
            }
            None => false,
        }
    }

    pub(crate) fn forget_subscription(&self, id: ConnectionId, channel: &Channel) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.channels.remove(channel);
        }
    }

    pub(crate) fn mark_stalled(&self, id: ConnectionId) {
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.stalled = true;
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
