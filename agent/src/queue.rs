//! Durable pending-operation queue.
//!
//! Wraps the engine's [`PendingQueue`] and persists it under one storage
//! key after every change. The queue is loaded lazily; entries left
//! `syncing` by an interrupted run go back to pending on load.

use std::collections::HashSet;

use chrono::Utc;
use serde_json::Value;
use stockroom_engine::{
    FailureOutcome, OpKind, OpStatus, OperationId, PendingOp, PendingQueue, RecordId, RetryPolicy,
    Timestamp,
};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::StoreError;
use crate::storage::SharedStorage;

type Result<T> = std::result::Result<T, StoreError>;

/// Storage key of the persisted queue.
pub const QUEUE_KEY: &str = "sync_queue";

pub struct OperationQueue {
    storage: SharedStorage,
    state: Mutex<Option<PendingQueue>>,
}

impl OperationQueue {
    pub fn new(storage: SharedStorage) -> Self {
        Self {
            storage,
            state: Mutex::new(None),
        }
    }

    async fn lock(&self) -> Result<MutexGuard<'_, Option<PendingQueue>>> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            let mut queue: PendingQueue = match self.storage.get(QUEUE_KEY).await? {
                Some(raw) => serde_json::from_str(&raw)?,
                None => PendingQueue::new(),
            };
            let requeued = queue.requeue_in_flight();
            if requeued > 0 {
                tracing::info!(requeued, "Requeued operations left in flight");
            }
            *state = Some(queue);
        }
        Ok(state)
    }

    /// Apply `f` to the queue and persist the result.
    ///
    /// The change only sticks in memory if it was persisted.
    async fn mutate<T>(&self, f: impl FnOnce(&mut PendingQueue) -> T) -> Result<T> {
        let mut state = self.lock().await?;
        let Some(current) = state.as_ref() else {
            return Err(StoreError::Storage("queue not loaded".into()));
        };

        let mut next = current.clone();
        let out = f(&mut next);
        self.storage
            .set(QUEUE_KEY, serde_json::to_string(&next)?)
            .await?;
        *state = Some(next);
        Ok(out)
    }

    async fn read<T>(&self, f: impl FnOnce(&PendingQueue) -> T) -> Result<T> {
        let state = self.lock().await?;
        match state.as_ref() {
            Some(queue) => Ok(f(queue)),
            None => Err(StoreError::Storage("queue not loaded".into())),
        }
    }

    /// Queue a mutation and return the entry id.
    pub async fn enqueue(
        &self,
        collection: &str,
        record_id: &str,
        operation: OpKind,
        payload: Value,
        priority: i32,
    ) -> Result<OperationId> {
        let op = PendingOp::new(
            uuid::Uuid::new_v4().to_string(),
            collection,
            record_id,
            operation,
            payload,
            Utc::now(),
        )
        .with_priority(priority);

        let id = self.mutate(|queue| queue.enqueue(op)).await?;
        tracing::debug!(
            collection = %collection,
            record_id = %record_id,
            operation = ?operation,
            op_id = %id,
            "Queued operation"
        );
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Result<Option<PendingOp>> {
        self.read(|queue| queue.get(id).cloned()).await
    }

    /// Pending entries in drain order.
    pub async fn dequeue_pending(&self) -> Result<Vec<PendingOp>> {
        self.read(PendingQueue::dequeue_pending).await
    }

    /// Pending entries eligible for an attempt at `now`.
    pub async fn ready(&self, now: Timestamp, policy: &RetryPolicy) -> Result<Vec<PendingOp>> {
        self.read(|queue| queue.ready(now, policy)).await
    }

    pub async fn mark_syncing(&self, id: &str) -> Result<()> {
        let now = Utc::now();
        Ok(self.mutate(|queue| queue.mark_syncing(id, now)).await??)
    }

    pub async fn mark_synced(&self, id: &str) -> Result<()> {
        Ok(self.mutate(|queue| queue.mark_synced(id)).await??)
    }

    pub async fn mark_error(&self, id: &str, message: &str) -> Result<()> {
        Ok(self.mutate(|queue| queue.mark_error(id, message)).await??)
    }

    pub async fn increment_retry(&self, id: &str) -> Result<u32> {
        Ok(self.mutate(|queue| queue.increment_retry(id)).await??)
    }

    pub async fn record_failure(
        &self,
        id: &str,
        retryable: bool,
        message: &str,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        Ok(self
            .mutate(|queue| queue.record_failure(id, retryable, message, policy))
            .await??)
    }

    pub async fn has_open_for(&self, collection: &str, record_id: &str) -> Result<bool> {
        self.read(|queue| queue.has_open_for(collection, record_id)).await
    }

    pub async fn has_other_open_for(&self, collection: &str, record_id: &str, except: &str) -> Result<bool> {
        self.read(|queue| queue.has_other_open_for(collection, record_id, except))
            .await
    }

    /// Local and remote ids targeted by deletes of `collection` that the
    /// remote store has not confirmed.
    pub async fn delete_targets(&self, collection: &str) -> Result<HashSet<RecordId>> {
        self.read(|queue| {
            let mut ids = HashSet::new();
            for op in queue.entries().iter().filter(|e| {
                e.collection == collection
                    && e.operation == OpKind::Delete
                    && e.status != OpStatus::Synced
            }) {
                ids.insert(op.record_id.clone());
                if let Some(remote_id) = op.payload.get("remote_id").and_then(Value::as_str) {
                    ids.insert(remote_id.to_string());
                }
            }
            ids
        })
        .await
    }

    pub async fn discard_record(&self, collection: &str, record_id: &str) -> Result<usize> {
        self.mutate(|queue| queue.discard_record(collection, record_id))
            .await
    }

    pub async fn compact(&self) -> Result<usize> {
        self.mutate(PendingQueue::compact).await
    }

    pub async fn reset_errors(&self, keep: impl FnMut(&PendingOp) -> bool) -> Result<(usize, usize)> {
        self.mutate(|queue| queue.reset_errors(keep)).await
    }

    pub async fn clear_errors(&self) -> Result<usize> {
        self.mutate(PendingQueue::clear_errors).await
    }

    pub async fn count(&self, status: OpStatus) -> Result<usize> {
        self.read(|queue| queue.count(status)).await
    }

    /// Copy of every entry.
    pub async fn snapshot(&self) -> Result<Vec<PendingOp>> {
        self.read(|queue| queue.entries().to_vec()).await
    }
}
