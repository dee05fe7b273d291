use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::DomainResult;
use crate::error::{AccessDenial, DomainError};
use crate::identity::ActorIdentity;
use crate::ports::db::WriteOp;
use crate::realtime::channel::Channel;
use crate::realtime::event::{EventKind, EventPayload, PendingEvent};
use crate::realtime::unit::{Committed, MutationPipeline, TransactionalUnit};
use crate::util::{now_ms, stable_id};

pub const ROOM_TABLE: &str = "room";
pub const MEMBER_TABLE: &str = "room_member";
pub const MESSAGE_TABLE: &str = "room_message";
pub const RECEIPT_TABLE: &str = "message_receipt";

const MAX_BODY_LENGTH: usize = 2_000;
const MAX_REQUEST_ID_LENGTH: usize = 128;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RoomRole {
    Owner,
    Member,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Room {
    pub room_id: String,
    pub scope_id: String,
    pub created_by: String,
    pub privacy_level: String,
    pub created_at_ms: i64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMember {
    pub room_id: String,
    pub user_id: String,
    pub role: RoomRole,
    pub joined_at_ms: i64,
    pub left_at_ms: Option<i64>,
    pub mute_until_ms: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoomMessage {
    pub room_id: String,
    pub message_id: String,
    pub author_id: String,
    pub body: String,
    pub created_at_ms: i64,
    pub request_id: String,
    pub origin_client_id: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageReceipt {
    pub room_id: String,
    pub message_id: String,
    pub user_id: String,
    pub delivered_at_ms: Option<i64>,
    pub read_at_ms: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateRoomInput {
    pub scope_id: String,
    pub privacy_level: String,
    pub request_id: String,
}

#[derive(Clone, Debug)]
pub struct SendMessageInput {
    pub room_id: String,
    pub body: String,
    pub request_id: String,
    pub origin_client_id: Option<String>,
}

pub fn member_key(room_id: &str, user_id: &str) -> String {
    format!("{room_id}:{user_id}")
}

pub fn receipt_key(message_id: &str, user_id: &str) -> String {
    format!("{message_id}:{user_id}")
}

/// The one membership predicate: joined and not departed.
pub fn is_active_member(member: Option<&RoomMember>) -> bool {
    member.is_some_and(|member| member.left_at_ms.is_none())
}

/// Builds the `message_created` fact for a stored message. Live delivery and
/// catchup derive it the same way, so both carry the same event id.
pub fn message_created_event(message: &RoomMessage) -> DomainResult<PendingEvent> {
    let payload = EventPayload::full(json!({
        "room_id": message.room_id,
        "message_id": message.message_id,
        "author_id": message.author_id,
        "body": message.body,
        "created_at_ms": message.created_at_ms,
    }));
    Ok(PendingEvent::new(
        EventKind::MessageCreated,
        &message.room_id,
        &message.message_id,
        payload,
    )?
    .with_origin_client(message.origin_client_id.clone()))
}

#[derive(Clone)]
pub struct RoomService {
    pipeline: MutationPipeline,
}

impl RoomService {
    pub fn new(pipeline: MutationPipeline) -> Self {
        Self { pipeline }
    }

    /// Creates a room owned by the actor. Replaying the same `request_id`
    /// returns the existing room without emitting again.
    pub async fn create_room(
        &self,
        actor: &ActorIdentity,
        input: CreateRoomInput,
    ) -> DomainResult<Committed<Room>> {
        let input = validate_room_create_input(input)?;
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let room_id = stable_id("room", &[actor_id.as_str(), input.request_id.as_str()]);
                    if let Some(existing) = unit.fetch_as::<Room>(ROOM_TABLE, &room_id).await? {
                        return Ok(existing);
                    }

                    let now = now_ms();
                    let room = Room {
                        room_id: room_id.clone(),
                        scope_id: input.scope_id,
                        created_by: actor_id.clone(),
                        privacy_level: input.privacy_level,
                        created_at_ms: now,
                    };
                    let owner = RoomMember {
                        room_id: room_id.clone(),
                        user_id: actor_id.clone(),
                        role: RoomRole::Owner,
                        joined_at_ms: now,
                        left_at_ms: None,
                        mute_until_ms: None,
                    };
                    unit.execute(WriteOp::create(ROOM_TABLE, &room_id, &room)?)
                        .await?;
                    unit.execute(WriteOp::create(
                        MEMBER_TABLE,
                        &member_key(&room_id, &actor_id),
                        &owner,
                    )?)
                    .await?;

                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::RoomCreated,
                            &room_id,
                            "created",
                            EventPayload::full(json!({
                                "room_id": room.room_id,
                                "scope_id": room.scope_id,
                                "privacy_level": room.privacy_level,
                                "created_by": room.created_by,
                            })),
                        )?,
                        vec![Channel::user(actor_id.as_str())],
                    )?;
                    stage_member_joined(unit, &owner)?;
                    Ok(room)
                })
            })
            .await
    }

    pub async fn join_room(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
    ) -> DomainResult<Committed<RoomMember>> {
        let room_id = room_id.to_string();
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    if unit.fetch(ROOM_TABLE, &room_id).await?.is_none() {
                        return Err(DomainError::NotFound);
                    }
                    let key = member_key(&room_id, &actor_id);
                    let existing = unit.fetch_as::<RoomMember>(MEMBER_TABLE, &key).await?;
                    if let Some(member) = existing.as_ref() {
                        if member.left_at_ms.is_none() {
                            return Ok(member.clone());
                        }
                    }

                    let member = RoomMember {
                        room_id: room_id.clone(),
                        user_id: actor_id.clone(),
                        role: existing
                            .as_ref()
                            .map_or(RoomRole::Member, |member| member.role),
                        joined_at_ms: now_ms(),
                        left_at_ms: None,
                        mute_until_ms: existing.and_then(|member| member.mute_until_ms),
                    };
                    unit.execute(WriteOp::upsert(MEMBER_TABLE, &key, &member)?)
                        .await?;
                    stage_member_joined(unit, &member)?;
                    Ok(member)
                })
            })
            .await
    }

    pub async fn leave_room(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
    ) -> DomainResult<Committed<RoomMember>> {
        let room_id = room_id.to_string();
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let key = member_key(&room_id, &actor_id);
                    let mut member = unit
                        .fetch_as::<RoomMember>(MEMBER_TABLE, &key)
                        .await?
                        .ok_or(DomainError::NotFound)?;
                    if member.left_at_ms.is_some() {
                        return Ok(member);
                    }

                    let left_at_ms = now_ms();
                    member.left_at_ms = Some(left_at_ms);
                    unit.execute(WriteOp::merge(
                        MEMBER_TABLE,
                        &key,
                        json!({ "left_at_ms": left_at_ms }),
                    ))
                    .await?;
                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::MemberLeft,
                            &room_id,
                            &format!("{actor_id}:{left_at_ms}"),
                            EventPayload::full(json!({
                                "room_id": room_id,
                                "user_id": actor_id,
                                "left_at_ms": left_at_ms,
                            })),
                        )?,
                        vec![Channel::room(room_id.as_str()), Channel::user(actor_id.as_str())],
                    )?;
                    Ok(member)
                })
            })
            .await
    }

    /// Idempotent per `(room, author, request_id)`: a retried request returns
    /// the stored message and stages nothing.
    pub async fn send_message(
        &self,
        actor: &ActorIdentity,
        input: SendMessageInput,
    ) -> DomainResult<Committed<RoomMessage>> {
        let body = input.body.trim().to_string();
        validate_message_input(&body, &input.request_id)?;
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    assert_can_send(unit, &input.room_id).await?;
                    let message_id = stable_id(
                        "msg",
                        &[
                            input.room_id.as_str(),
                            actor_id.as_str(),
                            input.request_id.as_str(),
                        ],
                    );
                    if let Some(existing) = unit
                        .fetch_as::<RoomMessage>(MESSAGE_TABLE, &message_id)
                        .await?
                    {
                        return Ok(existing);
                    }

                    let message = RoomMessage {
                        room_id: input.room_id.clone(),
                        message_id: message_id.clone(),
                        author_id: actor_id.clone(),
                        body,
                        created_at_ms: now_ms(),
                        request_id: input.request_id,
                        origin_client_id: input.origin_client_id,
                    };
                    unit.execute(WriteOp::create(MESSAGE_TABLE, &message_id, &message)?)
                        .await?;
                    unit.stage_event(
                        message_created_event(&message)?,
                        vec![Channel::room(message.room_id.as_str())],
                    )?;
                    Ok(message)
                })
            })
            .await
    }

    pub async fn mark_delivered(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
        message_id: &str,
    ) -> DomainResult<Committed<MessageReceipt>> {
        self.record_receipt(actor, room_id, message_id, false).await
    }

    /// Marks a message read. Reading implies delivery, so the delivered fact is
    /// staged too under the same id an explicit delivery receipt would carry.
    pub async fn mark_read(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
        message_id: &str,
    ) -> DomainResult<Committed<MessageReceipt>> {
        self.record_receipt(actor, room_id, message_id, true).await
    }

    /// Ephemeral: nothing is written and the event is never journaled.
    pub async fn typing(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
        origin_client_id: Option<String>,
    ) -> DomainResult<Committed<()>> {
        let room_id = room_id.to_string();
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    assert_can_send(unit, &room_id).await?;
                    let at_ms = now_ms();
                    unit.stage_event(
                        PendingEvent::new(
                            EventKind::Typing,
                            &room_id,
                            &format!("{actor_id}:{at_ms}"),
                            EventPayload::full(json!({
                                "room_id": room_id,
                                "user_id": actor_id,
                                "at_ms": at_ms,
                            })),
                        )?
                        .with_origin_client(origin_client_id),
                        vec![Channel::room(room_id.as_str())],
                    )?;
                    Ok(())
                })
            })
            .await
    }

    async fn record_receipt(
        &self,
        actor: &ActorIdentity,
        room_id: &str,
        message_id: &str,
        read: bool,
    ) -> DomainResult<Committed<MessageReceipt>> {
        let room_id = room_id.to_string();
        let message_id = message_id.to_string();
        let actor_id = actor.user_id.clone();
        self.pipeline
            .mutate(actor, move |unit| {
                Box::pin(async move {
                    let member = unit
                        .fetch_as::<RoomMember>(MEMBER_TABLE, &member_key(&room_id, &actor_id))
                        .await?;
                    if !is_active_member(member.as_ref()) {
                        return Err(DomainError::AuthorizationDenied(
                            AccessDenial::NotRoomMember,
                        ));
                    }
                    let message = unit
                        .fetch_as::<RoomMessage>(MESSAGE_TABLE, &message_id)
                        .await?
                        .filter(|message| message.room_id == room_id)
                        .ok_or(DomainError::NotFound)?;

                    let key = receipt_key(&message_id, &actor_id);
                    let now = now_ms();
                    let mut receipt = unit
                        .fetch_as::<MessageReceipt>(RECEIPT_TABLE, &key)
                        .await?
                        .unwrap_or(MessageReceipt {
                            room_id: room_id.clone(),
                            message_id: message_id.clone(),
                            user_id: actor_id.clone(),
                            delivered_at_ms: None,
                            read_at_ms: None,
                        });
                    receipt.delivered_at_ms.get_or_insert(now);
                    if read {
                        receipt.read_at_ms.get_or_insert(now);
                    }
                    unit.execute(WriteOp::upsert(RECEIPT_TABLE, &key, &receipt)?)
                        .await?;

                    let channels = vec![
                        Channel::room(room_id.as_str()),
                        Channel::user(message.author_id.as_str()),
                    ];
                    unit.stage_event(
                        receipt_event(EventKind::MessageDelivered, &message, &actor_id)?,
                        channels.clone(),
                    )?;
                    if read {
                        unit.stage_event(
                            receipt_event(EventKind::MessageRead, &message, &actor_id)?,
                            channels,
                        )?;
                    }
                    Ok(receipt)
                })
            })
            .await
    }
}

fn receipt_event(
    kind: EventKind,
    message: &RoomMessage,
    user_id: &str,
) -> DomainResult<PendingEvent> {
    PendingEvent::new(
        kind,
        &message.message_id,
        user_id,
        EventPayload::full(json!({
            "room_id": message.room_id,
            "message_id": message.message_id,
            "user_id": user_id,
        })),
    )
}

fn stage_member_joined(unit: &mut TransactionalUnit, member: &RoomMember) -> DomainResult<()> {
    unit.stage_event(
        PendingEvent::new(
            EventKind::MemberJoined,
            &member.room_id,
            &format!("{}:{}", member.user_id, member.joined_at_ms),
            EventPayload::full(json!({
                "room_id": member.room_id,
                "user_id": member.user_id,
                "role": member.role,
                "joined_at_ms": member.joined_at_ms,
            })),
        )?,
        vec![
            Channel::room(member.room_id.as_str()),
            Channel::user(member.user_id.as_str()),
        ],
    )
}

/// Membership is read through the unit so it is checked under the bound identity.
async fn assert_can_send(unit: &mut TransactionalUnit, room_id: &str) -> DomainResult<()> {
    let key = member_key(room_id, &unit.actor().user_id);
    let member = unit.fetch_as::<RoomMember>(MEMBER_TABLE, &key).await?;
    let Some(member) = member.filter(|member| member.left_at_ms.is_none()) else {
        return Err(DomainError::AuthorizationDenied(
            AccessDenial::NotRoomMember,
        ));
    };

    if let Some(mute_until_ms) = member.mute_until_ms {
        if now_ms() < mute_until_ms {
            return Err(DomainError::Validation(
                "member is currently muted in this room".into(),
            ));
        }
    }
    Ok(())
}

fn validate_room_create_input(mut input: CreateRoomInput) -> DomainResult<CreateRoomInput> {
    input.scope_id = input.scope_id.trim().to_string();
    input.privacy_level = input.privacy_level.trim().to_lowercase();
    input.request_id = input.request_id.trim().to_string();

    if input.scope_id.is_empty() {
        return Err(DomainError::Validation("scope_id is required".into()));
    }
    validate_request_id(&input.request_id)?;

    match input.privacy_level.as_str() {
        "public" | "private" => Ok(input),
        _ => Err(DomainError::Validation(
            "privacy_level must be public or private".into(),
        )),
    }
}

fn validate_message_input(body: &str, request_id: &str) -> DomainResult<()> {
    if body.is_empty() {
        return Err(DomainError::Validation("body is required".into()));
    }

    if body.chars().count() > MAX_BODY_LENGTH {
        return Err(DomainError::Validation(format!(
            "body exceeds max length of {MAX_BODY_LENGTH}"
        )));
    }

    validate_request_id(request_id)
}

pub(crate) fn validate_request_id(request_id: &str) -> DomainResult<()> {
    let request_id = request_id.trim();
    if request_id.is_empty() {
        return Err(DomainError::Validation("request_id is required".into()));
    }
    if request_id.len() > MAX_REQUEST_ID_LENGTH {
        return Err(DomainError::Validation(format!(
            "request_id exceeds max length of {MAX_REQUEST_ID_LENGTH}"
        )));
    }
    Ok(())
}
