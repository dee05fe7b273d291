use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::DomainResult;
use crate::error::DomainError;
use crate::util::stable_id;

/// Feed payload section visible only to the item's owner, its participants and moderators.
pub const RESTRICTED_FIELD: &str = "restricted";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RoomCreated,
    MemberJoined,
    MemberLeft,
    MessageCreated,
    MessageDelivered,
    MessageRead,
    Typing,
    ReportSubmitted,
    ReportUpdated,
    CommentCreated,
}

#[derive(Debug, PartialEq, Eq)]
pub struct KindDescriptor {
    pub kind: EventKind,
    pub name: &'static str,
    pub aggregate_type: &'static str,
    /// Replayable kinds are journaled for catchup; ephemeral kinds are live-only.
    pub replayable: bool,
}

/// Indexed by `EventKind as usize`.
const KIND_TABLE: [KindDescriptor; 10] = [
    KindDescriptor {
        kind: EventKind::RoomCreated,
        name: "room_created",
        aggregate_type: "room",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::MemberJoined,
        name: "member_joined",
        aggregate_type: "room",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::MemberLeft,
        name: "member_left",
        aggregate_type: "room",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::MessageCreated,
        name: "message_created",
        aggregate_type: "room",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::MessageDelivered,
        name: "message_delivered",
        aggregate_type: "message",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::MessageRead,
        name: "message_read",
        aggregate_type: "message",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::Typing,
        name: "typing",
        aggregate_type: "room",
        replayable: false,
    },
    KindDescriptor {
        kind: EventKind::ReportSubmitted,
        name: "report_submitted",
        aggregate_type: "report",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::ReportUpdated,
        name: "report_updated",
        aggregate_type: "report",
        replayable: true,
    },
    KindDescriptor {
        kind: EventKind::CommentCreated,
        name: "comment_created",
        aggregate_type: "report",
        replayable: true,
    },
];

impl EventKind {
    pub fn descriptor(self) -> &'static KindDescriptor {
        &KIND_TABLE[self as usize]
    }

    pub fn as_str(self) -> &'static str {
        self.descriptor().name
    }

    pub fn aggregate_type(self) -> &'static str {
        self.descriptor().aggregate_type
    }

    pub fn is_replayable(self) -> bool {
        self.descriptor().replayable
    }
}

/// Payload completeness is always explicit on the wire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "completeness", rename_all = "snake_case")]
pub enum EventPayload {
    Full { data: Value },
    Partial { omitted: Vec<String>, data: Value },
}

impl EventPayload {
    pub fn full(data: Value) -> Self {
        EventPayload::Full { data }
    }

    pub fn data(&self) -> &Value {
        match self {
            EventPayload::Full { data } | EventPayload::Partial { data, .. } => data,
        }
    }

    pub fn is_partial(&self) -> bool {
        matches!(self, EventPayload::Partial { .. })
    }

    /// Copy of this payload with the given top-level fields removed.
    /// Returns `None` when none of the fields are present.
    pub fn without_fields(&self, fields: &[&str]) -> Option<EventPayload> {
        let Value::Object(object) = self.data() else {
            return None;
        };
        if !fields.iter().any(|field| object.contains_key(*field)) {
            return None;
        }

        let mut omitted = match self {
            EventPayload::Partial { omitted, .. } => omitted.clone(),
            EventPayload::Full { .. } => Vec::new(),
        };
        let data: Map<String, Value> = object
            .iter()
            .filter(|(key, _)| !fields.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        for field in fields {
            if object.contains_key(*field) && !omitted.iter().any(|item| item == field) {
                omitted.push((*field).to_string());
            }
        }
        Some(EventPayload::Partial {
            omitted,
            data: Value::Object(data),
        })
    }
}

/// An event staged inside a transactional unit, not yet stamped by the broadcaster.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingEvent {
    event_id: String,
    kind: EventKind,
    aggregate_id: String,
    payload: EventPayload,
    origin_client_id: Option<String>,
}

impl PendingEvent {
    /// `fact_key` identifies the domain fact within its aggregate; the event id is
    /// derived from it so the same fact always yields the same id.
    pub fn new(
        kind: EventKind,
        aggregate_id: &str,
        fact_key: &str,
        payload: EventPayload,
    ) -> DomainResult<Self> {
        let aggregate_id = aggregate_id.trim();
        if aggregate_id.is_empty() {
            return Err(DomainError::Validation("aggregate_id is required".into()));
        }
        if fact_key.trim().is_empty() {
            return Err(DomainError::Validation("event fact key is required".into()));
        }
        Ok(Self {
            event_id: derive_event_id(kind, aggregate_id, fact_key),
            kind,
            aggregate_id: aggregate_id.to_string(),
            payload,
            origin_client_id: None,
        })
    }

    pub fn with_origin_client(mut self, origin_client_id: Option<String>) -> Self {
        self.origin_client_id = origin_client_id.filter(|value| !value.trim().is_empty());
        self
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    pub fn stamp(self, server_timestamp: i64) -> RealtimeEvent {
        RealtimeEvent {
            event_id: self.event_id,
            aggregate_type: self.kind.aggregate_type().to_string(),
            aggregate_id: self.aggregate_id,
            kind: self.kind,
            payload: self.payload,
            server_timestamp,
            origin_client_id: self.origin_client_id,
        }
    }
}

pub fn derive_event_id(kind: EventKind, aggregate_id: &str, fact_key: &str) -> String {
    stable_id(
        "evt",
        &[kind.aggregate_type(), aggregate_id, kind.as_str(), fact_key],
    )
}

/// A stamped event. Shared as `Arc<RealtimeEvent>` and never mutated after stamping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: EventPayload,
    pub server_timestamp: i64,
    pub origin_client_id: Option<String>,
}

impl RealtimeEvent {
    pub fn with_payload(&self, payload: EventPayload) -> RealtimeEvent {
        RealtimeEvent {
            payload,
            ..self.clone()
        }
    }
}

/// Wire shape delivered to clients, live and replayed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub aggregate_type: String,
    pub aggregate_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: EventPayload,
    pub server_timestamp: i64,
    pub origin_client_id: Option<String>,
    pub is_replay: bool,
}

impl EventEnvelope {
    pub fn live(event: &RealtimeEvent) -> Self {
        Self::from_event(event, false)
    }

    pub fn replay(event: &RealtimeEvent) -> Self {
        Self::from_event(event, true)
    }

    fn from_event(event: &RealtimeEvent, is_replay: bool) -> Self {
        Self {
            event_id: event.event_id.clone(),
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            kind: event.kind,
            payload: event.payload.clone(),
            server_timestamp: event.server_timestamp,
            origin_client_id: event.origin_client_id.clone(),
            is_replay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ALL_KINDS: [EventKind; 10] = [
        EventKind::RoomCreated,
        EventKind::MemberJoined,
        EventKind::MemberLeft,
        EventKind::MessageCreated,
        EventKind::MessageDelivered,
        EventKind::MessageRead,
        EventKind::Typing,
        EventKind::ReportSubmitted,
        EventKind::ReportUpdated,
        EventKind::CommentCreated,
    ];

    #[test]
    fn descriptor_table_is_indexed_by_kind() {
        for kind in ALL_KINDS {
            assert_eq!(kind.descriptor().kind, kind);
            let wire = serde_json::to_value(kind).unwrap();
            assert_eq!(wire, json!(kind.as_str()));
        }
        assert!(!EventKind::Typing.is_replayable());
        assert!(EventKind::MessageCreated.is_replayable());
    }

    #[test]
    fn same_fact_yields_same_event_id() {
        let first = PendingEvent::new(
            EventKind::MessageDelivered,
            "msg-1",
            "user-2",
            EventPayload::full(json!({})),
        )
        .unwrap();
        let second = PendingEvent::new(
            EventKind::MessageDelivered,
            "msg-1",
            "user-2",
            EventPayload::full(json!({ "other": true })),
        )
        .unwrap();
        let read = PendingEvent::new(
            EventKind::MessageRead,
            "msg-1",
            "user-2",
            EventPayload::full(json!({})),
        )
        .unwrap();

        assert_eq!(first.event_id(), second.event_id());
        assert_ne!(first.event_id(), read.event_id());
    }

    #[test]
    fn envelope_has_exact_wire_fields() {
        let event = PendingEvent::new(
            EventKind::MessageCreated,
            "room-1",
            "msg-1",
            EventPayload::full(json!({ "body": "hi" })),
        )
        .unwrap()
        .with_origin_client(Some("client-a".into()))
        .stamp(42);

        let wire = serde_json::to_value(EventEnvelope::replay(&event)).unwrap();
        let mut keys: Vec<_> = wire.as_object().unwrap().keys().cloned().collect();
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "aggregate_id",
                "aggregate_type",
                "event_id",
                "is_replay",
                "origin_client_id",
                "payload",
                "server_timestamp",
                "type",
            ]
        );
        assert_eq!(wire["type"], "message_created");
        assert_eq!(wire["payload"]["completeness"], "full");
        assert_eq!(wire["is_replay"], true);
    }

    #[test]
    fn removing_fields_marks_payload_partial() {
        let payload = EventPayload::full(json!({ "title": "flood", RESTRICTED_FIELD: { "contact": "x" } }));
        let redacted = payload.without_fields(&[RESTRICTED_FIELD]).unwrap();
        assert_eq!(
            redacted,
            EventPayload::Partial {
                omitted: vec![RESTRICTED_FIELD.to_string()],
                data: json!({ "title": "flood" }),
            }
        );
        assert!(redacted.without_fields(&[RESTRICTED_FIELD]).is_none());
    }
}
