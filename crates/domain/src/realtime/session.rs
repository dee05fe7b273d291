use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::broadcaster::EventBroadcaster;
use super::channel::Channel;
use super::cursor::CursorCodec;
use super::event::EventEnvelope;
use super::registry::{ConnectionId, Delivery};
use crate::DomainResult;
use crate::identity::ActorIdentity;

pub const PERMISSION_LOST: &str = "permission_lost";
const SEEN_CAPACITY: usize = 1_024;

#[derive(Debug, PartialEq)]
pub enum StreamOutput {
    Event {
        cursor: String,
        envelope: EventEnvelope,
    },
    Closed {
        reason: &'static str,
    },
    Skip,
}

/// Bounded memory of recently forwarded event ids.
#[derive(Debug, Default)]
struct SeenSet {
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl SeenSet {
    fn insert(&mut self, event_id: &str) -> bool {
        if self.ids.contains(event_id) {
            return false;
        }
        if self.order.len() >= SEEN_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        self.order.push_back(event_id.to_string());
        self.ids.insert(event_id.to_string());
        true
    }
}

/// Transport-independent state of one client stream on one channel. The SSE
/// and WebSocket handlers both drive one of these; dropping it deregisters the
/// connection.
pub struct StreamSession {
    broadcaster: Arc<EventBroadcaster>,
    cursors: CursorCodec,
    actor: ActorIdentity,
    channel: Channel,
    connection_id: ConnectionId,
    seen: SeenSet,
}

impl StreamSession {
    /// Registers a connection and subscribes it. Authorization failures are
    /// returned before anything is left registered.
    pub async fn open(
        broadcaster: Arc<EventBroadcaster>,
        cursors: CursorCodec,
        actor: ActorIdentity,
        channel: Channel,
    ) -> DomainResult<(Self, mpsc::Receiver<Delivery>)> {
        let handle = broadcaster.registry().register(&actor);
        if let Err(err) = broadcaster
            .subscribe(handle.id, channel.clone(), &actor)
            .await
        {
            broadcaster.registry().deregister(handle.id);
            return Err(err);
        }
        let session = Self {
            broadcaster,
            cursors,
            actor,
            channel,
            connection_id: handle.id,
            seen: SeenSet::default(),
        };
        Ok((session, handle.receiver))
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    pub fn actor(&self) -> &ActorIdentity {
        &self.actor
    }

    pub fn current_cursor(&self) -> String {
        self.cursors
            .encode(&self.actor, self.broadcaster.current_position())
    }

    pub fn touch(&self) -> bool {
        self.broadcaster.registry().touch(self.connection_id)
    }

    /// Decides what, if anything, to write for one queued delivery.
    pub async fn admit(&mut self, delivery: Delivery) -> DomainResult<StreamOutput> {
        let (channel, event) = match delivery {
            Delivery::Revoked { .. } => {
                return Ok(StreamOutput::Closed {
                    reason: PERMISSION_LOST,
                });
            }
            Delivery::Event { channel, event } => (channel, event),
        };

        if !self.seen.insert(&event.event_id) {
            return Ok(StreamOutput::Skip);
        }

        let authorizer = self.broadcaster.authorizer();
        if matches!(channel, Channel::Room(_)) {
            match authorizer.authorize(&self.actor, &channel).await {
                Ok(()) => {}
                Err(err) if err.is_authorization_denied() => {
                    return Ok(StreamOutput::Closed {
                        reason: PERMISSION_LOST,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let visible = authorizer.visible_event(&self.actor, &channel, &event);
        Ok(StreamOutput::Event {
            cursor: self.cursors.encode(&self.actor, visible.server_timestamp),
            envelope: EventEnvelope::live(&visible),
        })
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.broadcaster.registry().deregister(self.connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seen_set_forgets_oldest_beyond_capacity() {
        let mut seen = SeenSet::default();
        assert!(seen.insert("evt-0"));
        assert!(!seen.insert("evt-0"));
        for index in 1..=SEEN_CAPACITY {
            assert!(seen.insert(&format!("evt-{index}")));
        }
        assert!(seen.insert("evt-0"));
    }
}
