use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tracing::{debug, warn};

use super::channel::Channel;
use super::event::RealtimeEvent;
use super::index::{SubscriberSlot, SubscriptionIndex};
use super::journal::EventJournal;
use super::metrics;
use super::outbox::OutboxEntry;
use super::policy::ChannelAuthorizer;
use super::registry::{ConnectionId, ConnectionRegistry, Delivery, RegistryConfig};
use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;

/// Per-subscriber delivery failure. Logged and counted, never surfaced to the publisher.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("subscriber queue is full")]
    QueueFull,
    #[error("subscriber disconnected")]
    Disconnected,
}

impl DeliveryError {
    pub fn reason(&self) -> &'static str {
        match self {
            DeliveryError::QueueFull => "queue_full",
            DeliveryError::Disconnected => "disconnected",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub connection_id: ConnectionId,
    pub channel: Channel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub failed: usize,
}

impl PublishReport {
    fn absorb(&mut self, other: PublishReport) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

pub struct EventBroadcaster {
    index: Arc<SubscriptionIndex>,
    registry: Arc<ConnectionRegistry>,
    authorizer: ChannelAuthorizer,
    journal: EventJournal,
    /// Held from stamping through fan-out so every channel sees timestamp order.
    sequencer: Mutex<()>,
}

impl EventBroadcaster {
    pub fn new(
        authorizer: ChannelAuthorizer,
        journal: EventJournal,
        registry_config: RegistryConfig,
    ) -> Self {
        let index = Arc::new(SubscriptionIndex::default());
        let registry = Arc::new(ConnectionRegistry::new(index.clone(), registry_config));
        Self {
            index,
            registry,
            authorizer,
            journal,
            sequencer: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn journal(&self) -> &EventJournal {
        &self.journal
    }

    pub fn authorizer(&self) -> &ChannelAuthorizer {
        &self.authorizer
    }

    pub fn subscriber_count(&self, channel: &Channel) -> usize {
        self.index.subscriber_count(channel)
    }

    /// Position a fresh catchup cursor may safely start from: every event
    /// stamped after this call has a greater timestamp.
    pub fn current_position(&self) -> i64 {
        self.journal.position()
    }

    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        channel: Channel,
        actor: &ActorIdentity,
    ) -> DomainResult<Subscription> {
        self.authorizer.authorize(actor, &channel).await?;
        let sender = self.registry.sender_for(connection_id, actor)?;
        self.index.insert(
            &channel,
            SubscriberSlot {
                connection_id,
                user_id: actor.user_id.clone(),
                sender,
            },
        );
        if !self.registry.record_subscription(connection_id, &channel) {
            self.index.remove(&channel, connection_id);
            return Err(DomainError::NotFound);
        }
        debug!(connection_id, channel = %channel, "subscribed");
        Ok(Subscription {
            connection_id,
            channel,
        })
    }

    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.registry
            .forget_subscription(subscription.connection_id, &subscription.channel);
        self.index
            .remove(&subscription.channel, subscription.connection_id)
    }

    /// Cancels every live subscription `user_id` holds on the channel and tells
    /// the affected connections. Returns the number of subscriptions removed.
    pub fn revoke(&self, channel: &Channel, user_id: &str) -> usize {
        let removed = self.index.remove_user(channel, user_id);
        for (connection_id, sender) in &removed {
            self.registry.forget_subscription(*connection_id, channel);
            if sender
                .try_send(Delivery::Revoked {
                    channel: channel.clone(),
                })
                .is_err()
            {
                self.registry.mark_stalled(*connection_id);
            }
        }
        if !removed.is_empty() {
            debug!(channel = %channel, user_id, revoked = removed.len(), "subscriptions revoked");
        }
        removed.len()
    }

    /// Offers a stamped event to the channel's current subscribers.
    pub fn publish(&self, event: &Arc<RealtimeEvent>, channel: &Channel) -> PublishReport {
        let outcome = self.index.fan_out(channel, event);
        for (connection_id, error) in &outcome.failed {
            warn!(
                connection_id = *connection_id,
                channel = %channel,
                event_id = %event.event_id,
                error = %error,
                "dropping realtime subscriber"
            );
            metrics::record_delivery_failure(error.reason());
            if *error == DeliveryError::QueueFull {
                self.registry.mark_stalled(*connection_id);
            }
            self.registry.forget_subscription(*connection_id, channel);
        }
        PublishReport {
            delivered: outcome.delivered,
            failed: outcome.failed.len(),
        }
    }

    /// Stamps a drained outbox entry, journals it when replayable and publishes
    /// it on each of its channels.
    pub fn emit(&self, entry: OutboxEntry) -> (Arc<RealtimeEvent>, PublishReport) {
        let OutboxEntry { event, channels } = entry;
        let _sequenced = self.sequencer.lock().unwrap_or_else(PoisonError::into_inner);
        let event = self.journal.stamp(event, &channels);

        let mut report = PublishReport::default();
        for channel in &channels {
            report.absorb(self.publish(&event, channel));
        }
        metrics::record_published(event.kind.as_str(), report.delivered);
        (event, report)
    }
}
