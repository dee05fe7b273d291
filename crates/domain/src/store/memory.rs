use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::BoxFuture;
use crate::ports::db::{DbError, StoreTransaction, TransactionalStore, WriteOp};
use crate::ports::rooms::RoomDirectory;
use crate::rooms::{
    MEMBER_TABLE, MESSAGE_TABLE, ROOM_TABLE, Room, RoomMember, RoomMessage, member_key,
};

type Tables = HashMap<String, BTreeMap<String, Value>>;

/// Process-local store. Each transaction keeps its writes in an overlay and
/// applies them under one write lock on commit.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed state of one record.
    pub async fn get(&self, table: &str, record_id: &str) -> Option<Value> {
        self.tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(record_id))
            .cloned()
    }

    pub async fn count(&self, table: &str) -> usize {
        self.tables.read().await.get(table).map_or(0, BTreeMap::len)
    }

    async fn decode_row<T: DeserializeOwned>(
        &self,
        table: &str,
        record_id: &str,
    ) -> DomainResult<Option<T>> {
        self.get(table, record_id)
            .await
            .map(|row| decode(table, row))
            .transpose()
    }
}

fn decode<T: DeserializeOwned>(table: &str, row: Value) -> DomainResult<T> {
    serde_json::from_value(row)
        .map_err(|err| DomainError::Validation(format!("malformed {table} row: {err}")))
}

struct InMemoryTransaction {
    actor: ActorIdentity,
    tables: Arc<RwLock<Tables>>,
    writes: Vec<WriteOp>,
}

impl InMemoryTransaction {
    async fn read(&self, table: &str, record_id: &str) -> Result<Option<Value>, DbError> {
        let mut current = self
            .tables
            .read()
            .await
            .get(table)
            .and_then(|rows| rows.get(record_id))
            .cloned();
        for op in self
            .writes
            .iter()
            .filter(|op| op.table == table && op.record_id == record_id)
        {
            current = op.apply(current)?;
        }
        Ok(current)
    }
}

impl StoreTransaction for InMemoryTransaction {
    fn actor(&self) -> &ActorIdentity {
        &self.actor
    }

    fn execute(&mut self, op: WriteOp) -> BoxFuture<'_, Result<Option<Value>, DbError>> {
        Box::pin(async move {
            if !op.permits(&self.actor) {
                return Err(op.permission_denied());
            }
            let current = self.read(&op.table, &op.record_id).await?;
            if !op.permits_existing(&self.actor, current.as_ref()) {
                return Err(op.permission_denied());
            }
            let next = op.apply(current)?;
            self.writes.push(op);
            Ok(next)
        })
    }

    fn fetch(
        &mut self,
        table: &str,
        record_id: &str,
    ) -> BoxFuture<'_, Result<Option<Value>, DbError>> {
        let table = table.to_string();
        let record_id = record_id.to_string();
        Box::pin(async move { self.read(&table, &record_id).await })
    }

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>> {
        Box::pin(async move {
            let mut tables = self.tables.write().await;
            let mut staged: HashMap<(String, String), Option<Value>> = HashMap::new();
            for op in &self.writes {
                let key = (op.table.clone(), op.record_id.clone());
                let current = match staged.get(&key) {
                    Some(value) => value.clone(),
                    None => tables
                        .get(&op.table)
                        .and_then(|rows| rows.get(&op.record_id))
                        .cloned(),
                };
                if !op.permits_existing(&self.actor, current.as_ref()) {
                    return Err(op.permission_denied());
                }
                let next = op.apply(current)?;
                staged.insert(key, next);
            }

            for ((table, record_id), value) in staged {
                let rows = tables.entry(table).or_default();
                match value {
                    Some(value) => {
                        rows.insert(record_id, value);
                    }
                    None => {
                        rows.remove(&record_id);
                    }
                }
            }
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>> {
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

impl TransactionalStore for InMemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn begin(
        &self,
        actor: &ActorIdentity,
    ) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, DbError>> {
        let actor = actor.clone();
        let tables = self.tables.clone();
        Box::pin(async move {
            let tx: Box<dyn StoreTransaction> = Box::new(InMemoryTransaction {
                actor,
                tables,
                writes: Vec::new(),
            });
            Ok(tx)
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async { Ok(()) })
    }
}

impl RoomDirectory for InMemoryStore {
    fn get_room(&self, room_id: &str) -> BoxFuture<'_, DomainResult<Option<Room>>> {
        let room_id = room_id.to_string();
        Box::pin(async move { self.decode_row(ROOM_TABLE, &room_id).await })
    }

    fn get_member(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RoomMember>>> {
        let key = member_key(room_id, user_id);
        Box::pin(async move { self.decode_row(MEMBER_TABLE, &key).await })
    }

    fn list_active_rooms(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let user_id = user_id.to_string();
        let tables = self.tables.clone();
        Box::pin(async move {
            let tables = tables.read().await;
            let Some(rows) = tables.get(MEMBER_TABLE) else {
                return Ok(Vec::new());
            };
            let mut room_ids = Vec::new();
            for row in rows.values() {
                let member: RoomMember = decode(MEMBER_TABLE, row.clone())?;
                if member.user_id == user_id && member.left_at_ms.is_none() {
                    room_ids.push(member.room_id);
                }
            }
            room_ids.sort();
            room_ids.dedup();
            Ok(room_ids)
        })
    }

    fn list_messages_since(
        &self,
        room_ids: &[String],
        since_ms: i64,
        limit: usize,
    ) -> BoxFuture<'_, DomainResult<Vec<RoomMessage>>> {
        let room_ids: HashSet<String> = room_ids.iter().cloned().collect();
        let tables = self.tables.clone();
        Box::pin(async move {
            let tables = tables.read().await;
            let Some(rows) = tables.get(MESSAGE_TABLE) else {
                return Ok(Vec::new());
            };
            let mut messages = Vec::new();
            for row in rows.values() {
                let message: RoomMessage = decode(MESSAGE_TABLE, row.clone())?;
                if room_ids.contains(&message.room_id) && message.created_at_ms > since_ms {
                    messages.push(message);
                }
            }
            messages.sort_by(|a, b| {
                a.created_at_ms
                    .cmp(&b.created_at_ms)
                    .then_with(|| a.message_id.cmp(&b.message_id))
            });
            messages.truncate(limit);
            Ok(messages)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn uncommitted_writes_are_visible_only_inside_the_transaction() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut tx = store.begin(&actor).await.unwrap();
        tx.execute(WriteOp::create("note", "n1", &json!({ "author_id": "user-1" })).unwrap())
            .await
            .unwrap();

        assert!(tx.fetch("note", "n1").await.unwrap().is_some());
        assert!(store.get("note", "n1").await.is_none());

        tx.commit().await.unwrap();
        assert!(store.get("note", "n1").await.is_some());
    }

    #[tokio::test]
    async fn rollback_discards_overlay() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut tx = store.begin(&actor).await.unwrap();
        tx.execute(WriteOp::upsert("note", "n1", &json!({ "v": 1 })).unwrap())
            .await
            .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(store.count("note").await, 0);
    }

    #[tokio::test]
    async fn row_policy_rejects_foreign_author() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut tx = store.begin(&actor).await.unwrap();
        let err = tx
            .execute(WriteOp::create("note", "n1", &json!({ "author_id": "user-2" })).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PermissionDenied { .. }));
    }

    #[tokio::test]
    async fn concurrent_create_loses_at_commit() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut first = store.begin(&actor).await.unwrap();
        let mut second = store.begin(&actor).await.unwrap();
        let op = WriteOp::create("note", "n1", &json!({ "v": 1 })).unwrap();
        first.execute(op.clone()).await.unwrap();
        second.execute(op).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, DbError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn merge_requires_existing_row() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut tx = store.begin(&actor).await.unwrap();
        let err = tx
            .execute(WriteOp::merge("note", "missing", json!({ "v": 2 })))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    async fn seeded_message(store: &InMemoryStore) {
        let author = ActorIdentity::with_user_id("user-1");
        let mut tx = store.begin(&author).await.unwrap();
        tx.execute(
            WriteOp::create(
                "room_message",
                "m1",
                &json!({ "author_id": "user-1", "body": "hello" }),
            )
            .unwrap(),
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_merge_and_delete_are_rejected() {
        let store = InMemoryStore::new();
        seeded_message(&store).await;
        let stranger = ActorIdentity::with_user_id("user-2");

        let mut tx = store.begin(&stranger).await.unwrap();
        let err = tx
            .execute(WriteOp::merge("room_message", "m1", json!({ "body": "defaced" })))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PermissionDenied { .. }));

        let mut tx = store.begin(&stranger).await.unwrap();
        let err = tx
            .execute(WriteOp::delete("room_message", "m1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PermissionDenied { .. }));

        assert_eq!(
            store.get("room_message", "m1").await,
            Some(json!({ "author_id": "user-1", "body": "hello" }))
        );
    }

    #[tokio::test]
    async fn ownership_is_checked_again_at_commit() {
        let store = InMemoryStore::new();
        let stranger = ActorIdentity::with_user_id("user-2");
        let mut late = store.begin(&stranger).await.unwrap();
        late.execute(WriteOp::upsert("room_message", "m1", &json!({ "body": "mine" })).unwrap())
            .await
            .unwrap();

        seeded_message(&store).await;
        let err = late.commit().await.unwrap_err();
        assert!(matches!(err, DbError::PermissionDenied { .. }));
        assert_eq!(
            store.get("room_message", "m1").await.unwrap()["author_id"],
            "user-1"
        );
    }

    #[tokio::test]
    async fn stale_revision_loses_at_commit() {
        let store = InMemoryStore::new();
        let actor = ActorIdentity::with_user_id("user-1");
        let mut seed = store.begin(&actor).await.unwrap();
        seed.execute(WriteOp::create("report", "r1", &json!({ "revision": 0 })).unwrap())
            .await
            .unwrap();
        seed.commit().await.unwrap();

        let bump = |status: &str| {
            WriteOp::merge("report", "r1", json!({ "status": status, "revision": 1 }))
                .expecting("revision", json!(0))
        };
        let mut first = store.begin(&actor).await.unwrap();
        let mut second = store.begin(&actor).await.unwrap();
        first.execute(bump("verified")).await.unwrap();
        second.execute(bump("rejected")).await.unwrap();

        first.commit().await.unwrap();
        let err = second.commit().await.unwrap_err();
        assert!(matches!(err, DbError::Conflict { .. }));
        assert_eq!(store.get("report", "r1").await.unwrap()["status"], "verified");
    }
}
