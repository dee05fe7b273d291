use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::mpsc::{self, error::TrySendError};

use super::broadcaster::DeliveryError;
use super::channel::Channel;
use super::event::RealtimeEvent;
use super::registry::{ConnectionId, Delivery};

pub(crate) struct SubscriberSlot {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub sender: mpsc::Sender<Delivery>,
}

#[derive(Default)]
struct ChannelShard {
    subscribers: Mutex<Vec<SubscriberSlot>>,
}

impl ChannelShard {
    fn lock(&self) -> MutexGuard<'_, Vec<SubscriberSlot>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Default)]
pub(crate) struct FanOut {
    pub delivered: usize,
    pub failed: Vec<(ConnectionId, DeliveryError)>,
}

/// Channel-sharded subscriber sets. The outer map lock is only held to find or
/// create a shard; fan-out for a channel is serialized on that shard's mutex.
#[derive(Default)]
pub(crate) struct SubscriptionIndex {
    shards: RwLock<HashMap<Channel, Arc<ChannelShard>>>,
}

impl SubscriptionIndex {
    fn shard(&self, channel: &Channel) -> Option<Arc<ChannelShard>> {
        self.shards
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(channel)
            .cloned()
    }

    /// Adds or replaces the slot for `slot.connection_id` on the channel.
    pub fn insert(&self, channel: &Channel, slot: SubscriberSlot) {
        {
            let shards = self.shards.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(shard) = shards.get(channel) {
                upsert_slot(&mut shard.lock(), slot);
                return;
            }
        }
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let shard = shards.entry(channel.clone()).or_default();
        upsert_slot(&mut shard.lock(), slot);
    }

    pub fn remove(&self, channel: &Channel, connection_id: ConnectionId) -> bool {
        let removed = self.remove_where(channel, |slot| slot.connection_id == connection_id);
        !removed.is_empty()
    }

    /// Removes every slot of `user_id` on the channel and returns their connections.
    pub fn remove_user(
        &self,
        channel: &Channel,
        user_id: &str,
    ) -> Vec<(ConnectionId, mpsc::Sender<Delivery>)> {
        self.remove_where(channel, |slot| slot.user_id == user_id)
            .into_iter()
            .map(|slot| (slot.connection_id, slot.sender))
            .collect()
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.shard(channel).map_or(0, |shard| shard.lock().len())
    }

    /// Offers the event to every subscriber without waiting. Subscribers whose
    /// queue is full or closed are removed from the channel.
    pub fn fan_out(&self, channel: &Channel, event: &Arc<RealtimeEvent>) -> FanOut {
        let mut outcome = FanOut::default();
        let Some(shard) = self.shard(channel) else {
            return outcome;
        };
        let mut subscribers = shard.lock();
        subscribers.retain(|slot| {
            let delivery = Delivery::Event {
                channel: channel.clone(),
                event: event.clone(),
            };
            match slot.sender.try_send(delivery) {
                Ok(()) => {
                    outcome.delivered += 1;
                    true
                }
                Err(TrySendError::Full(_)) => {
                    outcome
                        .failed
                        .push((slot.connection_id, DeliveryError::QueueFull));
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    outcome
                        .failed
                        .push((slot.connection_id, DeliveryError::Disconnected));
                    false
                }
            }
        });
        let now_empty = subscribers.is_empty();
        drop(subscribers);
        if now_empty {
            self.prune(channel);
        }
        outcome
    }

    fn remove_where<F>(&self, channel: &Channel, predicate: F) -> Vec<SubscriberSlot>
    where
        F: Fn(&SubscriberSlot) -> bool,
    {
        let Some(shard) = self.shard(channel) else {
            return Vec::new();
        };
        let mut subscribers = shard.lock();
        let mut removed = Vec::new();
        let mut index = 0;
        while index < subscribers.len() {
            if predicate(&subscribers[index]) {
                removed.push(subscribers.swap_remove(index));
            } else {
                index += 1;
            }
        }
        let now_empty = subscribers.is_empty();
        drop(subscribers);
        if now_empty {
            self.prune(channel);
        }
        removed
    }

    /// Drops the shard when it has no subscribers. Inserts hold the outer read
    /// lock while touching a shard, so a shard cannot be detached mid-insert.
    fn prune(&self, channel: &Channel) {
        let mut shards = self.shards.write().unwrap_or_else(PoisonError::into_inner);
        let empty = shards
            .get(channel)
            .is_some_and(|shard| shard.lock().is_empty());
        if empty {
            shards.remove(channel);
        }
    }
}

fn upsert_slot(subscribers: &mut Vec<SubscriberSlot>, slot: SubscriberSlot) {
    match subscribers
        .iter_mut()
        .find(|existing| existing.connection_id == slot.connection_id)
    {
        Some(existing) => *existing = slot,
        None => subscribers.push(slot),
    }
}
