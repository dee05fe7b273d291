use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use super::broadcaster::EventBroadcaster;
use super::channel::Channel;
use super::cursor::CursorCodec;
use super::event::{EventEnvelope, RealtimeEvent};
use super::metrics;
use super::policy::ChannelAuthorizer;
use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::rooms::RoomDirectory;
use crate::rooms::message_created_event;
use crate::util::now_ms;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CatchupConfig {
    pub max_events: usize,
    pub window_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CatchupBatch {
    pub events: Vec<EventEnvelope>,
    pub is_replay: bool,
    /// The cursor predates retained history; the client must fully resync.
    pub gap: bool,
    pub next_cursor: String,
    pub has_more: bool,
}

#[derive(Clone)]
pub struct CatchupService {
    broadcaster: Arc<EventBroadcaster>,
    rooms: Arc<dyn RoomDirectory>,
    cursors: CursorCodec,
    config: CatchupConfig,
}

impl CatchupService {
    pub fn new(
        broadcaster: Arc<EventBroadcaster>,
        rooms: Arc<dyn RoomDirectory>,
        cursors: CursorCodec,
        config: CatchupConfig,
    ) -> Self {
        Self {
            broadcaster,
            rooms,
            cursors,
            config: CatchupConfig {
                max_events: config.max_events.max(1),
                window_ms: config.window_ms.max(1),
            },
        }
    }

    pub fn cursors(&self) -> &CursorCodec {
        &self.cursors
    }

    /// Cursor for a client that has seen everything published so far.
    pub fn current_cursor(&self, actor: &ActorIdentity) -> String {
        self.cursors
            .encode(actor, self.broadcaster.current_position())
    }

    pub async fn catchup(
        &self,
        actor: Option<&ActorIdentity>,
        since: &str,
    ) -> DomainResult<CatchupBatch> {
        let actor = match actor {
            Some(actor) if !actor.user_id.trim().is_empty() => actor,
            _ => return Err(DomainError::AuthenticationRequired),
        };
        let cursor = self.cursors.decode(actor, since)?;
        self.catchup_from(actor, cursor.position).await
    }

    async fn catchup_from(&self, actor: &ActorIdentity, position: i64) -> DomainResult<CatchupBatch> {
        let now = now_ms();
        let window_start = now - self.config.window_ms;
        let authorizer = self.broadcaster.authorizer();
        let read = self.broadcaster.journal().read_since(position, now);
        let gap = read.gap || position < window_start;

        let mut grants = ChannelGrants::default();
        let mut seen = HashSet::new();
        let mut events: Vec<Arc<RealtimeEvent>> = Vec::new();

        for entry in &read.entries {
            if entry.event.server_timestamp < window_start {
                continue;
            }
            let Some(channel) = grants
                .first_visible(authorizer, actor, &entry.channels)
                .await?
            else {
                continue;
            };
            if seen.insert(entry.event.event_id.clone()) {
                events.push(authorizer.visible_event(actor, &channel, &entry.event));
            }
        }

        // Room history the journal no longer holds is rebuilt from stored messages.
        let floor = position.max(window_start);
        if floor < read.horizon {
            let mut room_ids = Vec::new();
            for room_id in self.rooms.list_active_rooms(&actor.user_id).await? {
                if grants
                    .allows(authorizer, actor, &Channel::room(room_id.as_str()))
                    .await?
                {
                    room_ids.push(room_id);
                }
            }
            if !room_ids.is_empty() {
                let messages = self
                    .rooms
                    .list_messages_since(&room_ids, floor, self.config.max_events + 1)
                    .await?;
                for message in messages {
                    if message.created_at_ms > read.horizon {
                        continue;
                    }
                    let event = message_created_event(&message)?.stamp(message.created_at_ms);
                    if seen.insert(event.event_id.clone()) {
                        events.push(Arc::new(event));
                    }
                }
            }
        }

        events.sort_by(|left, right| {
            left.server_timestamp
                .cmp(&right.server_timestamp)
                .then_with(|| left.event_id.cmp(&right.event_id))
        });
        let has_more = events.len() > self.config.max_events;
        events.truncate(self.config.max_events);

        // Never later than the journal read: anything stamped since then is above it.
        let next_position = match (has_more, events.last()) {
            (true, Some(last)) => last.server_timestamp,
            _ => read.watermark,
        }
        .max(position);

        metrics::record_catchup(gap);
        Ok(CatchupBatch {
            events: events
                .iter()
                .map(|event| EventEnvelope::replay(event))
                .collect(),
            is_replay: true,
            gap,
            next_cursor: self.cursors.encode(actor, next_position),
            has_more,
        })
    }
}

/// Authorization results memoized for the duration of one catchup request.
#[derive(Default)]
struct ChannelGrants {
    granted: HashMap<Channel, bool>,
}

impl ChannelGrants {
    async fn allows(
        &mut self,
        authorizer: &ChannelAuthorizer,
        actor: &ActorIdentity,
        channel: &Channel,
    ) -> DomainResult<bool> {
        if let Some(granted) = self.granted.get(channel) {
            return Ok(*granted);
        }
        let granted = match authorizer.authorize(actor, channel).await {
            Ok(()) => true,
            Err(err) if err.is_authorization_denied() => false,
            Err(err) => return Err(err),
        };
        self.granted.insert(channel.clone(), granted);
        Ok(granted)
    }

    /// Prefers private channels over the feed so an authorized recipient gets
    /// the unredacted copy.
    async fn first_visible(
        &mut self,
        authorizer: &ChannelAuthorizer,
        actor: &ActorIdentity,
        channels: &[Channel],
    ) -> DomainResult<Option<Channel>> {
        let mut ordered: Vec<&Channel> = channels.iter().collect();
        ordered.sort_by_key(|channel| channel.is_feed());
        for channel in ordered {
            if self.allows(authorizer, actor, channel).await? {
                return Ok(Some(channel.clone()));
            }
        }
        Ok(None)
    }
}
