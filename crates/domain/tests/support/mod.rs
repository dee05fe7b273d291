#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use lapor_domain::identity::ActorIdentity;
use lapor_domain::ports::BoxFuture;
use lapor_domain::ports::db::{DbError, StoreTransaction, TransactionalStore, WriteOp};
use lapor_domain::realtime::channel::Channel;
use lapor_domain::realtime::event::EventEnvelope;
use lapor_domain::realtime::registry::Delivery;
use lapor_domain::realtime::session::{StreamOutput, StreamSession};
use lapor_domain::realtime::{RealtimeConfig, RealtimeEngine};
use lapor_domain::reports::ReportService;
use lapor_domain::rooms::{CreateRoomInput, Room, RoomService, SendMessageInput};
use lapor_domain::store::InMemoryStore;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub struct Harness {
    pub store: InMemoryStore,
    pub engine: RealtimeEngine,
    pub rooms: RoomService,
    pub reports: ReportService,
    pub fail_commits: Arc<AtomicBool>,
}

pub fn test_config() -> RealtimeConfig {
    RealtimeConfig {
        subscriber_buffer: 32,
        cursor_secret: "test-cursor-secret".to_string(),
        ..RealtimeConfig::default()
    }
}

pub fn harness() -> Harness {
    harness_with(test_config())
}

pub fn harness_with(config: RealtimeConfig) -> Harness {
    let store = InMemoryStore::new();
    let fail_commits = Arc::new(AtomicBool::new(false));
    let flaky = FlakyStore {
        inner: store.clone(),
        fail_commits: fail_commits.clone(),
    };
    let engine = RealtimeEngine::new(Arc::new(flaky), Arc::new(store.clone()), config);
    Harness {
        rooms: RoomService::new(engine.pipeline.clone()),
        reports: ReportService::new(engine.pipeline.clone()),
        store,
        engine,
        fail_commits,
    }
}

impl Harness {
    pub async fn open(
        &self,
        actor: &ActorIdentity,
        channel: Channel,
    ) -> (StreamSession, mpsc::Receiver<Delivery>) {
        StreamSession::open(
            self.engine.broadcaster.clone(),
            self.engine.cursors.clone(),
            actor.clone(),
            channel,
        )
        .await
        .unwrap()
    }

    /// Room owned by `owner` with every other actor joined; all setup events flushed.
    pub async fn room_with(&self, owner: &ActorIdentity, members: &[&ActorIdentity]) -> Room {
        let room = self
            .rooms
            .create_room(
                owner,
                CreateRoomInput {
                    scope_id: "rw-42".into(),
                    privacy_level: "private".into(),
                    request_id: format!("room-{}", owner.user_id),
                },
            )
            .await
            .unwrap()
            .flushed()
            .await;
        for member in members {
            self.rooms
                .join_room(member, &room.room_id)
                .await
                .unwrap()
                .flushed()
                .await;
        }
        room
    }

    pub async fn say(&self, actor: &ActorIdentity, room_id: &str, request_id: &str, body: &str) -> String {
        self.rooms
            .send_message(
                actor,
                SendMessageInput {
                    room_id: room_id.to_string(),
                    body: body.to_string(),
                    request_id: request_id.to_string(),
                    origin_client_id: Some(format!("client-{}", actor.user_id)),
                },
            )
            .await
            .unwrap()
            .flushed()
            .await
            .message_id
    }
}

pub fn actor(user_id: &str) -> ActorIdentity {
    ActorIdentity::with_user_id(user_id)
}

pub async fn next_output(
    session: &mut StreamSession,
    receiver: &mut mpsc::Receiver<Delivery>,
) -> StreamOutput {
    loop {
        let delivery = timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("connection queue closed");
        match session.admit(delivery).await.unwrap() {
            StreamOutput::Skip => continue,
            output => return output,
        }
    }
}

pub async fn next_envelope(
    session: &mut StreamSession,
    receiver: &mut mpsc::Receiver<Delivery>,
) -> EventEnvelope {
    match next_output(session, receiver).await {
        StreamOutput::Event { envelope, .. } => envelope,
        other => panic!("expected an event, got {other:?}"),
    }
}

/// Drains whatever is queued and returns the envelopes the session would forward.
pub async fn drain_envelopes(
    session: &mut StreamSession,
    receiver: &mut mpsc::Receiver<Delivery>,
) -> Vec<EventEnvelope> {
    let mut envelopes = Vec::new();
    while let Ok(Some(delivery)) = timeout(Duration::from_millis(50), receiver.recv()).await {
        if let StreamOutput::Event { envelope, .. } = session.admit(delivery).await.unwrap() {
            envelopes.push(envelope);
        }
    }
    envelopes
}

pub fn data_str<'a>(envelope: &'a EventEnvelope, field: &str) -> Option<&'a str> {
    envelope.payload.data().get(field).and_then(Value::as_str)
}

/// Wraps the in-memory store so commits can be made to fail on demand.
struct FlakyStore {
    inner: InMemoryStore,
    fail_commits: Arc<AtomicBool>,
}

struct FlakyTransaction {
    inner: Box<dyn StoreTransaction>,
    fail_commit: bool,
}

impl StoreTransaction for FlakyTransaction {
    fn actor(&self) -> &ActorIdentity {
        self.inner.actor()
    }

    fn execute(&mut self, op: WriteOp) -> BoxFuture<'_, Result<Option<Value>, DbError>> {
        self.inner.execute(op)
    }

    fn fetch(
        &mut self,
        table: &str,
        record_id: &str,
    ) -> BoxFuture<'_, Result<Option<Value>, DbError>> {
        self.inner.fetch(table, record_id)
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>> {
        if self.fail_commit {
            return Box::pin(async { Err(DbError::Unavailable("injected commit failure".into())) });
        }
        self.inner.commit()
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>> {
        self.inner.rollback()
    }
}

impl TransactionalStore for FlakyStore {
    fn name(&self) -> &'static str {
        "flaky-memory"
    }

    fn begin(
        &self,
        actor: &ActorIdentity,
    ) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, DbError>> {
        let fail_commit = self.fail_commits.load(Ordering::SeqCst);
        let begin = self.inner.begin(actor);
        Box::pin(async move {
            let inner = begin.await?;
            let tx: Box<dyn StoreTransaction> = Box::new(FlakyTransaction { inner, fail_commit });
            Ok(tx)
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        self.inner.health_check()
    }
}
