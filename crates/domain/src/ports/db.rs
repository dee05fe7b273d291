use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

use super::BoxFuture;
use crate::identity::ActorIdentity;

/// Content fields that name the actor a row belongs to.
pub const OWNER_FIELDS: &[&str] = &["author_id", "reporter_id", "user_id"];

#[derive(Debug, Error)]
pub enum DbError {
    #[error("db unavailable: {0}")]
    Unavailable(String),
    #[error("db operation failed: {0}")]
    Operation(String),
    #[error("record not found: {table}:{record_id}")]
    NotFound { table: String, record_id: String },
    #[error("record already exists: {table}:{record_id}")]
    AlreadyExists { table: String, record_id: String },
    #[error("row policy rejected write to {table}:{record_id}")]
    PermissionDenied { table: String, record_id: String },
    #[error("write conflict on {table}:{record_id}")]
    Conflict { table: String, record_id: String },
    #[error("transaction already finished")]
    Finished,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteAction {
    /// Fails when the record exists.
    Create,
    /// Replaces the record, creating it when missing.
    Upsert,
    /// Shallow-merges object fields into an existing record.
    Merge,
    Delete,
}

impl WriteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteAction::Create => "create",
            WriteAction::Upsert => "upsert",
            WriteAction::Merge => "merge",
            WriteAction::Delete => "delete",
        }
    }
}

/// A field value the stored row must hold for the write to apply.
#[derive(Clone, Debug, PartialEq)]
pub struct Precondition {
    pub field: String,
    pub expected: Value,
}

impl Precondition {
    pub fn holds(&self, row: &Value) -> bool {
        row.get(&self.field) == Some(&self.expected)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct WriteOp {
    pub table: String,
    pub record_id: String,
    pub action: WriteAction,
    pub content: Value,
    pub precondition: Option<Precondition>,
}

impl WriteOp {
    pub fn create<T: Serialize>(table: &str, record_id: &str, content: &T) -> Result<Self, DbError> {
        Self::with_content(table, record_id, WriteAction::Create, content)
    }

    pub fn upsert<T: Serialize>(table: &str, record_id: &str, content: &T) -> Result<Self, DbError> {
        Self::with_content(table, record_id, WriteAction::Upsert, content)
    }

    pub fn merge(table: &str, record_id: &str, patch: Value) -> Self {
        Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            action: WriteAction::Merge,
            content: patch,
            precondition: None,
        }
    }

    pub fn delete(table: &str, record_id: &str) -> Self {
        Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            action: WriteAction::Delete,
            content: Value::Null,
            precondition: None,
        }
    }

    fn with_content<T: Serialize>(
        table: &str,
        record_id: &str,
        action: WriteAction,
        content: &T,
    ) -> Result<Self, DbError> {
        let content = serde_json::to_value(content)
            .map_err(|err| DbError::Operation(format!("failed to encode {table}: {err}")))?;
        if !content.is_object() {
            return Err(DbError::Operation(format!(
                "{table}:{record_id} content must be an object"
            )));
        }
        Ok(Self {
            table: table.to_string(),
            record_id: record_id.to_string(),
            action,
            content,
            precondition: None,
        })
    }

    /// Compare-and-set: the write fails with `Conflict` unless the stored row
    /// still holds `expected` in `field` when it is applied.
    pub fn expecting(mut self, field: &str, expected: Value) -> Self {
        self.precondition = Some(Precondition {
            field: field.to_string(),
            expected,
        });
        self
    }

    /// Row-level check: owner fields written by this op must name the bound actor
    /// unless the actor holds an administrative role.
    pub fn permits(&self, actor: &ActorIdentity) -> bool {
        if actor.is_admin() {
            return true;
        }
        OWNER_FIELDS.iter().all(|field| {
            match self.content.get(*field).and_then(Value::as_str) {
                Some(owner) => owner == actor.user_id,
                None => true,
            }
        })
    }

    /// Row-level check against the stored row: a row owned by another actor
    /// may only be changed or deleted by a moderating role.
    pub fn permits_existing(&self, actor: &ActorIdentity, current: Option<&Value>) -> bool {
        if self.action == WriteAction::Create || actor.can_moderate() {
            return true;
        }
        let Some(row) = current else {
            return true;
        };
        OWNER_FIELDS.iter().all(|field| {
            match row.get(*field).and_then(Value::as_str) {
                Some(owner) => owner == actor.user_id,
                None => true,
            }
        })
    }

    /// Result of applying this op to the record as it currently reads.
    pub fn apply(&self, current: Option<Value>) -> Result<Option<Value>, DbError> {
        if let Some(precondition) = &self.precondition {
            match &current {
                Some(row) if !precondition.holds(row) => return Err(self.conflict()),
                None if self.action != WriteAction::Merge => return Err(self.conflict()),
                _ => {}
            }
        }
        match self.action {
            WriteAction::Create => {
                if current.is_some() {
                    return Err(DbError::AlreadyExists {
                        table: self.table.clone(),
                        record_id: self.record_id.clone(),
                    });
                }
                Ok(Some(self.content.clone()))
            }
            WriteAction::Upsert => Ok(Some(self.content.clone())),
            WriteAction::Merge => {
                let Some(Value::Object(mut row)) = current else {
                    return Err(DbError::NotFound {
                        table: self.table.clone(),
                        record_id: self.record_id.clone(),
                    });
                };
                if let Value::Object(patch) = &self.content {
                    for (key, value) in patch {
                        row.insert(key.clone(), value.clone());
                    }
                }
                Ok(Some(Value::Object(row)))
            }
            WriteAction::Delete => Ok(None),
        }
    }

    pub fn conflict(&self) -> DbError {
        DbError::Conflict {
            table: self.table.clone(),
            record_id: self.record_id.clone(),
        }
    }

    pub fn permission_denied(&self) -> DbError {
        DbError::PermissionDenied {
            table: self.table.clone(),
            record_id: self.record_id.clone(),
        }
    }
}

/// One open transaction with an identity bound at `begin`.
pub trait StoreTransaction: Send {
    fn actor(&self) -> &ActorIdentity;

    /// Applies a write and returns the record as it reads inside the transaction.
    fn execute(&mut self, op: WriteOp) -> BoxFuture<'_, Result<Option<Value>, DbError>>;

    fn fetch(
        &mut self,
        table: &str,
        record_id: &str,
    ) -> BoxFuture<'_, Result<Option<Value>, DbError>>;

    fn commit(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>>;

    fn rollback(self: Box<Self>) -> BoxFuture<'static, Result<(), DbError>>;
}

pub trait TransactionalStore: Send + Sync {
    fn name(&self) -> &'static str;

    fn begin(
        &self,
        actor: &ActorIdentity,
    ) -> BoxFuture<'_, Result<Box<dyn StoreTransaction>, DbError>>;

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use serde_json::json;

    #[test]
    fn permits_only_matching_owner_fields() {
        let actor = ActorIdentity::with_user_id("user-1");
        let own = WriteOp::create("room_message", "m1", &json!({ "author_id": "user-1" })).unwrap();
        let foreign =
            WriteOp::create("room_message", "m2", &json!({ "author_id": "user-2" })).unwrap();
        let unowned = WriteOp::merge("report", "r1", json!({ "status": "resolved" }));

        assert!(own.permits(&actor));
        assert!(!foreign.permits(&actor));
        assert!(unowned.permits(&actor));
        assert!(foreign.permits(&actor.with_role(Role::System)));
    }

    #[test]
    fn merge_requires_an_existing_object() {
        let merge = WriteOp::merge("report", "r1", json!({ "status": "resolved" }));
        assert!(matches!(merge.apply(None), Err(DbError::NotFound { .. })));

        let merged = merge
            .apply(Some(json!({ "status": "open", "revision": 0 })))
            .unwrap();
        assert_eq!(merged, Some(json!({ "status": "resolved", "revision": 0 })));
    }

    #[test]
    fn existing_rows_are_guarded_by_their_owner() {
        let owner = ActorIdentity::with_user_id("user-1");
        let stranger = ActorIdentity::with_user_id("user-2");
        let row = json!({ "author_id": "user-1", "body": "hello" });
        let deface = WriteOp::merge("room_message", "m1", json!({ "body": "defaced" }));
        let delete = WriteOp::delete("room_message", "m1");

        assert!(deface.permits_existing(&owner, Some(&row)));
        assert!(!deface.permits_existing(&stranger, Some(&row)));
        assert!(!delete.permits_existing(&stranger, Some(&row)));
        assert!(delete.permits_existing(&stranger, None));
        assert!(deface.permits_existing(&stranger.with_role(Role::Moderator), Some(&row)));
    }

    #[test]
    fn stale_precondition_is_a_conflict() {
        let bump = WriteOp::merge("report", "r1", json!({ "revision": 1 }))
            .expecting("revision", json!(0));

        assert_eq!(
            bump.apply(Some(json!({ "revision": 0 }))).unwrap(),
            Some(json!({ "revision": 1 }))
        );
        assert!(matches!(
            bump.apply(Some(json!({ "revision": 1 }))),
            Err(DbError::Conflict { .. })
        ));
    }

    #[test]
    fn rejects_non_object_content() {
        let err = WriteOp::create("room", "r1", &"plain").unwrap_err();
        assert!(matches!(err, DbError::Operation(_)));
    }
}
