use std::sync::Arc;

use lapor_domain::DomainResult;
use lapor_domain::error::DomainError;
use lapor_domain::identity::ActorIdentity;
use lapor_domain::ports::BoxFuture;
use lapor_domain::ports::db::{
    DbError, OWNER_FIELDS, StoreTransaction, TransactionalStore, WriteAction, WriteOp,
};
use lapor_domain::ports::rooms::RoomDirectory;
use lapor_domain::rooms::{MEMBER_TABLE, MESSAGE_TABLE, ROOM_TABLE, Room, RoomMember, RoomMessage, member_key};
use serde::de::DeserializeOwned;
use serde_json::Value;
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::Client;

use super::{DbConfig, probe_endpoint};

const PRIVILEGED_ROLES: &str = "[\"admin\", \"system\"]";
const MODERATING_ROLES: &str = "[\"moderator\", \"admin\", \"system\"]";

/// SurrealDB-backed store. Writes are buffered per transaction and sent as a
/// single `BEGIN TRANSACTION ... COMMIT TRANSACTION` script on commit.
#[derive(Clone)]
pub struct SurrealStore {
    client: Arc<Surreal<Client>>,
    endpoint: String,
}

impl SurrealStore {
    pub fn with_client(client: Arc<Surreal<Client>>, config: &DbConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
        }
    }

    pub async fn connect(config: &DbConfig) -> anyhow::Result<Self> {
        let client = super::connect(config).await?;
        Ok(Self::with_client(Arc::new(client), config))
    }

    async fn select_rows<T: DeserializeOwned>(
        &self,
        query: &'static str,
        bindings: Vec<(&'static str, Value)>,
    ) -> DomainResult<Vec<T>> {
        let mut pending = self.client.query(query);
        for binding in bindings {
            pending = pending.bind(binding);
        }
        let mut response = pending
            .await
            .map_err(|err| DomainError::from(map_surreal_error(&err, &[])))?;
        let rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DomainError::Validation(format!("invalid query result: {err}")))?;
        rows.into_iter()
            .map(|row| {
                serde_json::from_value(row)
                    .map_err(|err| DomainError::Validation(format!("malformed row: {err}")))
            })
            .collect()
    }

    async fn select_record<T: DeserializeOwned>(
        &self,
        table: &str,
        record_id: &str,
    ) -> DomainResult<Option<T>> {
        let mut rows = self
            .select_rows(
                "SELECT * OMIT id FROM type::record($table, $record_id)",
                vec![
                    ("table", Value::from(table)),
                    ("record_id", Value::from(record_id)),
                ],
            )
            .await?;
        Ok(rows.pop())
    }
}

struct SurrealTransaction {
    actor: ActorIdentity,
    client: Arc<Surreal<Client>>,
    writes: Vec<WriteOp>,
}

impl SurrealTransaction {
    async fn read(&self, table: &str, record_id: &str) -> Result<Option<Value>, DbError> {
        let mut response = self
            .client
            .query("SELECT * OMIT id FROM type::record($table, $record_id)")
            .bind(("table", table.to_string()))
            .bind(("record_id", record_id.to_string()))
            .await
            .map_err(|err| map_surreal_error(&err, &[]))?;
        let mut rows: Vec<Value> = response
            .take(0)
            .map_err(|err| DbError::Operation(format!("invalid query result: {err}")))?;
        let mut current = rows.pop();
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

impl StoreTransaction for SurrealTransaction {
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
            if self.writes.is_empty() {
                return Ok(());
            }
            let script = CommitScript::build(&self.writes)?;
            let mut pending = self
                .client
                .query(script.text)
                .bind(("actor_id", self.actor.user_id.clone()))
                .bind(("actor_role", self.actor.role.as_str().to_string()));
            for binding in script.bindings {
                pending = pending.bind(binding);
            }
            let response = pending
                .await
                .map_err(|err| map_surreal_error(&err, &self.writes))?;
            response
                .check()
                .map_err(|err| map_surreal_error(&err, &self.writes))?;
            tracing::debug!(
                actor_id = %self.actor.user_id,
                writes = self.writes.len(),
                "surreal transaction committed"
            );
            Ok(())
        })
    }

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>> {
        // nothing was sent
        Box::pin(async move {
            drop(self);
            Ok(())
        })
    }
}

/// One transaction script with positional bindings `$t{n}`, `$i{n}`, `$c{n}`
/// and `$p{n}` for preconditions. `$b{n}` holds the row as the script finds it.
#[derive(Debug)]
struct CommitScript {
    text: String,
    bindings: Vec<(String, Value)>,
}

impl CommitScript {
    fn build(writes: &[WriteOp]) -> Result<Self, DbError> {
        let mut text = String::from("BEGIN TRANSACTION;\n");
        let mut bindings = Vec::with_capacity(writes.len() * 3);
        for (index, op) in writes.iter().enumerate() {
            let record = format!("type::record($t{index}, $i{index})");
            let key = format!("{}:{}", op.table, op.record_id);

            for field in OWNER_FIELDS {
                if op.content.get(*field).and_then(Value::as_str).is_some() {
                    text.push_str(&format!(
                        "IF $actor_role NOTINSIDE {PRIVILEGED_ROLES} AND $c{index}.{field} != $actor_id {{ THROW {}; }};\n",
                        quoted(&format!("row policy rejected write to {key}"))?
                    ));
                }
            }

            if op.action != WriteAction::Create {
                text.push_str(&format!("LET $b{index} = (SELECT * FROM {record})[0];\n"));
                for field in OWNER_FIELDS {
                    text.push_str(&format!(
                        "IF $actor_role NOTINSIDE {MODERATING_ROLES} AND $b{index}.{field} != NONE AND $b{index}.{field} != $actor_id {{ THROW {}; }};\n",
                        quoted(&format!("row policy rejected write to {key}"))?
                    ));
                }
            }
            if let Some(precondition) = &op.precondition {
                let field = field_name(&precondition.field)?;
                text.push_str(&format!(
                    "IF $b{index}.{field} != $p{index} {{ THROW {}; }};\n",
                    quoted(&format!("write conflict on {key}"))?
                ));
                bindings.push((format!("p{index}"), precondition.expected.clone()));
            }

            let statement = match op.action {
                WriteAction::Create => format!("CREATE {record} CONTENT $c{index};\n"),
                WriteAction::Upsert => format!("UPSERT {record} CONTENT $c{index};\n"),
                WriteAction::Merge => format!(
                    "IF !record::exists({record}) {{ THROW {}; }};\nUPDATE {record} MERGE $c{index};\n",
                    quoted(&format!("record not found: {key}"))?
                ),
                WriteAction::Delete => format!("DELETE {record};\n"),
            };
            text.push_str(&statement);

            bindings.push((format!("t{index}"), Value::from(op.table.as_str())));
            bindings.push((format!("i{index}"), Value::from(op.record_id.as_str())));
            bindings.push((format!("c{index}"), op.content.clone()));
        }
        text.push_str("COMMIT TRANSACTION;");
        Ok(Self { text, bindings })
    }
}

/// Field names are spliced into the script, so only plain identifiers pass.
fn field_name(field: &str) -> Result<&str, DbError> {
    let valid = !field.is_empty()
        && field
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_');
    if valid {
        Ok(field)
    } else {
        Err(DbError::Operation(format!("invalid precondition field '{field}'")))
    }
}

fn quoted(message: &str) -> Result<String, DbError> {
    serde_json::to_string(message).map_err(|err| DbError::Operation(err.to_string()))
}

fn map_surreal_error(err: &surrealdb::Error, writes: &[WriteOp]) -> DbError {
    let message = err.to_string();
    let lowered = message.to_lowercase();
    let target = writes
        .iter()
        .find(|op| message.contains(&format!("{}:{}", op.table, op.record_id)));
    let (table, record_id) = target
        .map(|op| (op.table.clone(), op.record_id.clone()))
        .unwrap_or_default();

    if lowered.contains("row policy rejected") {
        return DbError::PermissionDenied { table, record_id };
    }
    if lowered.contains("write conflict") {
        return DbError::Conflict { table, record_id };
    }
    if lowered.contains("already exists") || lowered.contains("duplicate") {
        return DbError::AlreadyExists { table, record_id };
    }
    if lowered.contains("record not found") {
        return DbError::NotFound { table, record_id };
    }
    if lowered.contains("connection") || lowered.contains("websocket") {
        return DbError::Unavailable(message);
    }
    DbError::Operation(message)
}

impl TransactionalStore for SurrealStore {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn begin(
        &self,
        actor: &ActorIdentity,
    ) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, DbError>> {
        let actor = actor.clone();
        let client = self.client.clone();
        Box::pin(async move {
            let tx: Box<dyn StoreTransaction> = Box::new(SurrealTransaction {
                actor,
                client,
                writes: Vec::new(),
            });
            Ok(tx)
        })
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move { probe_endpoint(&self.endpoint).await })
    }
}

impl RoomDirectory for SurrealStore {
    fn get_room(&self, room_id: &str) -> BoxFuture<'_, DomainResult<Option<Room>>> {
        let room_id = room_id.to_string();
        Box::pin(async move { self.select_record(ROOM_TABLE, &room_id).await })
    }

    fn get_member(
        &self,
        room_id: &str,
        user_id: &str,
    ) -> BoxFuture<'_, DomainResult<Option<RoomMember>>> {
        let key = member_key(room_id, user_id);
        Box::pin(async move { self.select_record(MEMBER_TABLE, &key).await })
    }

    fn list_active_rooms(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<String>>> {
        let user_id = user_id.to_string();
        Box::pin(async move {
            let mut room_ids: Vec<String> = self
                .select_rows(
                    "SELECT VALUE room_id FROM room_member \
                     WHERE user_id = $user_id AND (left_at_ms = NONE OR left_at_ms = NULL)",
                    vec![("user_id", Value::from(user_id))],
                )
                .await?;
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
        let room_ids: Vec<Value> = room_ids.iter().map(|id| Value::from(id.as_str())).collect();
        Box::pin(async move {
            if room_ids.is_empty() {
                return Ok(Vec::new());
            }
            self.select_rows(
                "SELECT * OMIT id FROM room_message \
                 WHERE room_id INSIDE $room_ids AND created_at_ms > $since_ms \
                 ORDER BY created_at_ms ASC, message_id ASC LIMIT $limit",
                vec![
                    ("room_ids", Value::Array(room_ids)),
                    ("since_ms", Value::from(since_ms)),
                    ("limit", Value::from(limit as u64)),
                ],
            )
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commit_script_wraps_every_write_in_one_transaction() {
        let writes = vec![
            WriteOp::create(
                MESSAGE_TABLE,
                "msg_1",
                &json!({ "author_id": "user-1", "body": "hi" }),
            )
            .unwrap(),
            WriteOp::merge(ROOM_TABLE, "room_1", json!({ "privacy_level": "public" })),
        ];

        let script = CommitScript::build(&writes).unwrap();
        assert!(script.text.starts_with("BEGIN TRANSACTION;"));
        assert!(script.text.ends_with("COMMIT TRANSACTION;"));
        assert!(script.text.contains("CREATE type::record($t0, $i0) CONTENT $c0;"));
        assert!(script.text.contains("$c0.author_id != $actor_id"));
        assert!(script.text.contains("UPDATE type::record($t1, $i1) MERGE $c1;"));
        assert!(!script.text.contains("$c1.author_id"));
        assert_eq!(script.bindings.len(), 6);
        assert_eq!(script.bindings[1], ("i0".to_string(), json!("msg_1")));
    }

    #[test]
    fn throw_messages_are_valid_string_literals() {
        let writes = vec![WriteOp::merge("report", "rpt_\"x\"", json!({}))];
        let script = CommitScript::build(&writes).unwrap();
        assert!(script.text.contains(r#"THROW "record not found: report:rpt_\"x\"";"#));
    }

    #[test]
    fn updates_and_deletes_check_the_stored_owner() {
        let writes = vec![
            WriteOp::merge(MESSAGE_TABLE, "msg_1", json!({ "body": "edited" })),
            WriteOp::delete(MESSAGE_TABLE, "msg_2"),
        ];
        let script = CommitScript::build(&writes).unwrap();
        for index in 0..2 {
            assert!(script.text.contains(&format!(
                "LET $b{index} = (SELECT * FROM type::record($t{index}, $i{index}))[0];"
            )));
            assert!(script.text.contains(&format!(
                "$b{index}.author_id != NONE AND $b{index}.author_id != $actor_id"
            )));
        }
        assert!(script.text.contains(MODERATING_ROLES));
    }

    #[test]
    fn precondition_guards_the_stored_value() {
        let writes = vec![
            WriteOp::merge("report", "rpt_1", json!({ "revision": 3 }))
                .expecting("revision", json!(2)),
        ];
        let script = CommitScript::build(&writes).unwrap();
        assert!(script.text.contains(
            r#"IF $b0.revision != $p0 { THROW "write conflict on report:rpt_1"; };"#
        ));
        assert!(script.bindings.contains(&("p0".to_string(), json!(2))));

        let spliced = vec![
            WriteOp::merge("report", "rpt_1", json!({})).expecting("revision; DELETE report", json!(0)),
        ];
        assert!(matches!(
            CommitScript::build(&spliced),
            Err(DbError::Operation(_))
        ));
    }
}
