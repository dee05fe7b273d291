use std::sync::Arc;

use serde_json::Value;

use super::channel::Channel;
use super::event::{RESTRICTED_FIELD, RealtimeEvent};
use crate::DomainResult;
use crate::error::{AccessDenial, DomainError};
use crate::identity::ActorIdentity;
use crate::ports::rooms::RoomDirectory;
use crate::rooms::{RoomMember, is_active_member};

pub const OWNER_FIELD: &str = "owner_id";
pub const PARTICIPANTS_FIELD: &str = "participant_ids";

/// The single authorization predicate per channel kind. Live subscription,
/// per-event stream forwarding and catchup all go through here, always
/// against current room state.
#[derive(Clone)]
pub struct ChannelAuthorizer {
    rooms: Arc<dyn RoomDirectory>,
}

impl ChannelAuthorizer {
    pub fn new(rooms: Arc<dyn RoomDirectory>) -> Self {
        Self { rooms }
    }

    pub async fn authorize(&self, actor: &ActorIdentity, channel: &Channel) -> DomainResult<()> {
        match channel {
            Channel::User(user_id) => authorize_user_channel(actor, user_id),
            Channel::Room(room_id) => {
                let member = self.rooms.get_member(room_id, &actor.user_id).await?;
                authorize_room_channel(member.as_ref())
            }
            Channel::Feed => Ok(()),
        }
    }

    /// The event as this actor may see it on this channel.
    pub fn visible_event(
        &self,
        actor: &ActorIdentity,
        channel: &Channel,
        event: &Arc<RealtimeEvent>,
    ) -> Arc<RealtimeEvent> {
        if !channel.is_feed() {
            return event.clone();
        }
        match redact_feed_event(actor, event) {
            Some(redacted) => Arc::new(redacted),
            None => event.clone(),
        }
    }
}

pub fn authorize_user_channel(actor: &ActorIdentity, user_id: &str) -> DomainResult<()> {
    if actor.user_id == user_id || actor.is_admin() {
        return Ok(());
    }
    Err(DomainError::AuthorizationDenied(
        AccessDenial::ForbiddenStream,
    ))
}

pub fn authorize_room_channel(member: Option<&RoomMember>) -> DomainResult<()> {
    if is_active_member(member) {
        return Ok(());
    }
    Err(DomainError::AuthorizationDenied(AccessDenial::NotRoomMember))
}

pub fn can_see_restricted(actor: &ActorIdentity, data: &Value) -> bool {
    if actor.can_moderate() {
        return true;
    }
    if data.get(OWNER_FIELD).and_then(Value::as_str) == Some(actor.user_id.as_str()) {
        return true;
    }
    data.get(PARTICIPANTS_FIELD)
        .and_then(Value::as_array)
        .is_some_and(|participants| {
            participants
                .iter()
                .any(|participant| participant.as_str() == Some(actor.user_id.as_str()))
        })
}

/// Redacted copy of a feed event, or `None` when the actor may see it whole.
/// Ownership fields go with the restricted section so the redacted copy does
/// not identify the owner.
pub fn redact_feed_event(actor: &ActorIdentity, event: &RealtimeEvent) -> Option<RealtimeEvent> {
    if can_see_restricted(actor, event.payload.data()) {
        return None;
    }
    event
        .payload
        .without_fields(&[RESTRICTED_FIELD, OWNER_FIELD, PARTICIPANTS_FIELD])
        .map(|payload| event.with_payload(payload))
}
