use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::channel::Channel;
use super::event::PendingEvent;
use super::flusher::{FlushReport, OutboxFlusher};
use super::metrics;
use super::outbox::Outbox;
use crate::DomainResult;
use crate::error::DomainError;
use crate::identity::ActorIdentity;
use crate::ports::BoxFuture;
use crate::ports::db::{DbError, StoreTransaction, TransactionalStore, WriteOp};

/// Result of a successful commit. The flush runs detached; awaiting it is optional.
#[derive(Debug)]
pub struct CommitReceipt {
    pub staged_events: usize,
    flush: Option<JoinHandle<FlushReport>>,
}

impl CommitReceipt {
    pub async fn wait_flushed(self) -> FlushReport {
        match self.flush {
            Some(handle) => handle.await.unwrap_or_default(),
            None => FlushReport::default(),
        }
    }
}

#[derive(Debug)]
pub struct Committed<T> {
    pub value: T,
    pub receipt: CommitReceipt,
}

impl<T> Committed<T> {
    pub fn into_value(self) -> T {
        self.value
    }

    /// Waits for the post-commit fan-out before handing back the value.
    pub async fn flushed(self) -> T {
        self.receipt.wait_flushed().await;
        self.value
    }
}

/// One database transaction bound to one actor, plus the events it will emit
/// if and only if it commits.
pub struct TransactionalUnit {
    actor: ActorIdentity,
    tx: Option<Box<dyn StoreTransaction>>,
    outbox: Outbox,
    flusher: OutboxFlusher,
    poisoned: Option<String>,
}

impl TransactionalUnit {
    pub fn actor(&self) -> &ActorIdentity {
        &self.actor
    }

    pub fn staged_len(&self) -> usize {
        self.outbox.len()
    }

    pub async fn execute(&mut self, op: WriteOp) -> DomainResult<Option<Value>> {
        let result = match self.tx.as_mut() {
            Some(tx) => tx.execute(op).await,
            None => return Err(self.closed_error()),
        };
        match result {
            Ok(record) => Ok(record),
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn fetch(&mut self, table: &str, record_id: &str) -> DomainResult<Option<Value>> {
        let result = match self.tx.as_mut() {
            Some(tx) => tx.fetch(table, record_id).await,
            None => return Err(self.closed_error()),
        };
        match result {
            Ok(record) => Ok(record),
            Err(err) => Err(self.fail(err).await),
        }
    }

    pub async fn fetch_as<T: DeserializeOwned>(
        &mut self,
        table: &str,
        record_id: &str,
    ) -> DomainResult<Option<T>> {
        let Some(record) = self.fetch(table, record_id).await? else {
            return Ok(None);
        };
        match serde_json::from_value(record) {
            Ok(value) => Ok(Some(value)),
            Err(err) => Err(self
                .fail(DbError::Operation(format!(
                    "failed to decode {table}:{record_id}: {err}"
                )))
                .await),
        }
    }

    /// Pure in-memory append; nothing leaves the unit before commit.
    pub fn stage_event(&mut self, event: PendingEvent, channels: Vec<Channel>) -> DomainResult<()> {
        if self.tx.is_none() {
            return Err(self.closed_error());
        }
        self.outbox.stage(event, channels).map(|_| ())
    }

    pub async fn commit(mut self) -> DomainResult<CommitReceipt> {
        let Some(tx) = self.tx.take() else {
            return Err(self.closed_error());
        };
        let outbox = std::mem::take(&mut self.outbox);
        if let Err(err) = tx.commit().await {
            warn!(
                actor_id = %self.actor.user_id,
                dropped_events = outbox.len(),
                error = %err,
                "commit failed; outbox discarded"
            );
            metrics::record_unit_outcome("commit_failed");
            return Err(into_transaction_error(err));
        }

        let staged_events = outbox.len();
        metrics::record_unit_outcome("committed");
        debug!(actor_id = %self.actor.user_id, staged_events, "unit committed");
        Ok(CommitReceipt {
            staged_events,
            flush: self.flusher.flush(outbox.drain()),
        })
    }

    pub async fn rollback(mut self) {
        let dropped = self.outbox.discard();
        if let Some(tx) = self.tx.take() {
            if let Err(err) = tx.rollback().await {
                warn!(actor_id = %self.actor.user_id, error = %err, "rollback failed");
            }
            metrics::record_unit_outcome("rolled_back");
            debug!(actor_id = %self.actor.user_id, dropped_events = dropped, "unit rolled back");
        }
    }

    /// Rolls back, poisons the unit and maps the store error.
    async fn fail(&mut self, err: DbError) -> DomainError {
        let dropped = self.outbox.discard();
        if let Some(tx) = self.tx.take() {
            if let Err(rollback_err) = tx.rollback().await {
                warn!(error = %rollback_err, "rollback after failed write also failed");
            }
        }
        warn!(
            actor_id = %self.actor.user_id,
            dropped_events = dropped,
            error = %err,
            "transaction aborted"
        );
        metrics::record_unit_outcome("aborted");
        self.poisoned = Some(err.to_string());
        DomainError::from(err)
    }

    fn closed_error(&self) -> DomainError {
        let reason = self
            .poisoned
            .clone()
            .unwrap_or_else(|| "transaction already finished".to_string());
        DomainError::TransactionFailed(reason)
    }
}

impl Drop for TransactionalUnit {
    fn drop(&mut self) {
        if self.tx.is_some() {
            let dropped = self.outbox.discard();
            metrics::record_unit_outcome("dropped");
            warn!(
                actor_id = %self.actor.user_id,
                dropped_events = dropped,
                "transactional unit dropped while open; discarding"
            );
        }
    }
}

fn into_transaction_error(err: DbError) -> DomainError {
    match DomainError::from(err) {
        DomainError::Conflict => DomainError::TransactionFailed("write conflict".into()),
        other => other,
    }
}

/// Entry point for mutations: opens units bound to an actor and flushes their
/// outbox after commit.
#[derive(Clone)]
pub struct MutationPipeline {
    store: Arc<dyn TransactionalStore>,
    flusher: OutboxFlusher,
}

impl MutationPipeline {
    pub fn new(store: Arc<dyn TransactionalStore>, flusher: OutboxFlusher) -> Self {
        Self { store, flusher }
    }

    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.store
    }

    pub async fn begin(&self, actor: &ActorIdentity) -> DomainResult<TransactionalUnit> {
        if actor.user_id.trim().is_empty() {
            return Err(DomainError::AuthenticationRequired);
        }
        let tx = self
            .store
            .begin(actor)
            .await
            .map_err(|err| DomainError::TransactionFailed(err.to_string()))?;
        Ok(TransactionalUnit {
            actor: actor.clone(),
            tx: Some(tx),
            outbox: Outbox::default(),
            flusher: self.flusher.clone(),
            poisoned: None,
        })
    }

    /// Runs `work` in a fresh unit. `Ok` commits and flushes; `Err` rolls back
    /// and propagates the error unchanged.
    pub async fn mutate<T, F>(&self, actor: &ActorIdentity, work: F) -> DomainResult<Committed<T>>
    where
        T: Send,
        F: Send + for<'u> FnOnce(&'u mut TransactionalUnit) -> BoxFuture<'u, DomainResult<T>>,
    {
        let mut unit = self.begin(actor).await?;
        let outcome = work(&mut unit).await;
        match outcome {
            Ok(value) => {
                let receipt = unit.commit().await?;
                Ok(Committed { value, receipt })
            }
            Err(err) => {
                unit.rollback().await;
                Err(err)
            }
        }
    }
}
