//! Pending operations: mutations not yet confirmed by the remote store.
//!
//! The queue is plain data. The agent persists it after every change and
//! the sync cycle drains it. Ordering rules:
//!
//! - pending entries drain by `priority` ascending, then `created_at`,
//!   then enqueue sequence;
//! - entries for the same record always drain in enqueue order, whatever
//!   their priorities;
//! - enqueuing a delete supersedes every earlier unsynced entry of the same
//!   record.

use crate::{error::Result, CollectionName, Error, OperationId, RecordId, Timestamp};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};

/// Default priority for queued operations. Lower drains first.
pub const DEFAULT_PRIORITY: i32 = 1;

/// Message recorded on entries made moot by a later delete.
pub const SUPERSEDED: &str = "superseded by delete";

/// Kind of remote mutation to replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    /// Picked up by a running push
    Syncing,
    Synced,
    /// Retries exhausted; needs a manual reset
    Error,
}

/// A queued mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOp {
    pub id: OperationId,
    pub collection: CollectionName,
    pub record_id: RecordId,
    pub operation: OpKind,
    /// Snapshot of the record (or patch) at enqueue time
    pub payload: Value,
    pub priority: i32,
    pub retry_count: u32,
    pub status: OpStatus,
    pub created_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    /// Enqueue sequence, assigned by the queue
    #[serde(default)]
    pub seq: u64,
}

impl PendingOp {
    /// A new pending entry with default priority.
    pub fn new(
        id: impl Into<OperationId>,
        collection: impl Into<CollectionName>,
        record_id: impl Into<RecordId>,
        operation: OpKind,
        payload: Value,
        now: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            collection: collection.into(),
            record_id: record_id.into(),
            operation,
            payload,
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
            status: OpStatus::Pending,
            created_at: now,
            error_message: None,
            last_attempt_at: None,
            seq: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Whether the entry targets the given record.
    pub fn targets(&self, collection: &str, record_id: &str) -> bool {
        self.collection == collection && self.record_id == record_id
    }

    /// Not yet confirmed and not given up on.
    pub fn is_open(&self) -> bool {
        matches!(self.status, OpStatus::Pending | OpStatus::Syncing)
    }
}

/// When failed entries become eligible again and when to give up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Delay after the first failure
    pub base_delay_ms: u64,
    /// Upper bound for the doubling delay
    pub max_delay_ms: u64,
    /// Non-retryable failures allowed before an entry is marked error
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    /// A policy with no waiting between attempts.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            base_delay_ms: 0,
            max_delay_ms: 0,
            max_retries,
        }
    }

    /// Delay before attempt number `retry_count + 1`.
    pub fn delay_for(&self, retry_count: u32) -> TimeDelta {
        if retry_count == 0 {
            return TimeDelta::zero();
        }
        let factor = 1u64 << (retry_count - 1).min(20);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        TimeDelta::milliseconds(delay as i64)
    }

    /// Whether `op` may be attempted at `now`.
    pub fn is_ready(&self, op: &PendingOp, now: Timestamp) -> bool {
        match op.last_attempt_at {
            Some(last) if op.retry_count > 0 => now - last >= self.delay_for(op.retry_count),
            _ => true,
        }
    }
}

/// What happened to an entry after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum FailureOutcome {
    /// Back to pending, will be retried
    Retrying { retry_count: u32 },
    /// Marked error, no more automatic retries
    Exhausted { retry_count: u32 },
    /// A delete made the entry moot while it was in flight
    Superseded,
}

/// The persisted queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PendingQueue {
    entries: Vec<PendingOp>,
    #[serde(default)]
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry as pending and return its id.
    ///
    /// A delete supersedes earlier unsynced entries of the same record.
    pub fn enqueue(&mut self, mut op: PendingOp) -> OperationId {
        self.next_seq += 1;
        op.seq = self.next_seq;
        op.status = OpStatus::Pending;
        op.retry_count = 0;

        if op.operation == OpKind::Delete {
            for earlier in self
                .entries
                .iter_mut()
                .filter(|e| e.targets(&op.collection, &op.record_id) && e.status != OpStatus::Synced)
            {
                earlier.status = OpStatus::Synced;
                earlier.error_message = Some(SUPERSEDED.to_string());
            }
        }

        let id = op.id.clone();
        self.entries.push(op);
        id
    }

    pub fn get(&self, id: &str) -> Option<&PendingOp> {
        self.entries.iter().find(|e| e.id == id)
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut PendingOp> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::OperationNotFound(id.to_string()))
    }

    /// All pending entries in drain order.
    pub fn dequeue_pending(&self) -> Vec<PendingOp> {
        let pending: Vec<&PendingOp> = self
            .entries
            .iter()
            .filter(|e| e.status == OpStatus::Pending)
            .collect();
        drain_order(pending).into_iter().cloned().collect()
    }

    /// Pending entries that `policy` allows attempting at `now`.
    ///
    /// An entry still backing off also holds back the later entries of its
    /// record.
    pub fn ready(&self, now: Timestamp, policy: &RetryPolicy) -> Vec<PendingOp> {
        let mut blocked: HashSet<(&str, &str)> = HashSet::new();
        let mut ready = Vec::new();
        let pending: Vec<&PendingOp> = self
            .entries
            .iter()
            .filter(|e| e.status == OpStatus::Pending)
            .collect();
        for op in drain_order(pending) {
            let key = (op.collection.as_str(), op.record_id.as_str());
            if blocked.contains(&key) {
                continue;
            }
            if policy.is_ready(op, now) {
                ready.push(op.clone());
            } else {
                blocked.insert(key);
            }
        }
        ready
    }

    /// Mark an entry as in flight.
    pub fn mark_syncing(&mut self, id: &str, now: Timestamp) -> Result<()> {
        let op = self.get_mut(id)?;
        op.status = OpStatus::Syncing;
        op.last_attempt_at = Some(now);
        Ok(())
    }

    pub fn mark_synced(&mut self, id: &str) -> Result<()> {
        let op = self.get_mut(id)?;
        op.status = OpStatus::Synced;
        op.error_message = None;
        Ok(())
    }

    pub fn mark_error(&mut self, id: &str, message: impl Into<String>) -> Result<()> {
        let op = self.get_mut(id)?;
        op.status = OpStatus::Error;
        op.error_message = Some(message.into());
        Ok(())
    }

    /// Bump the retry count and put the entry back to pending.
    pub fn increment_retry(&mut self, id: &str) -> Result<u32> {
        let op = self.get_mut(id)?;
        op.retry_count += 1;
        op.status = OpStatus::Pending;
        Ok(op.retry_count)
    }

    /// Record a failed attempt.
    ///
    /// Retryable failures always go back to pending. Other failures count
    /// towards `policy.max_retries`; reaching it marks the entry error.
    pub fn record_failure(
        &mut self,
        id: &str,
        retryable: bool,
        message: impl Into<String>,
        policy: &RetryPolicy,
    ) -> Result<FailureOutcome> {
        if self.get_mut(id)?.status == OpStatus::Synced {
            return Ok(FailureOutcome::Superseded);
        }
        let retry_count = self.increment_retry(id)?;
        let message = message.into();
        if !retryable && retry_count >= policy.max_retries {
            self.mark_error(id, message)?;
            return Ok(FailureOutcome::Exhausted { retry_count });
        }
        self.get_mut(id)?.error_message = Some(message);
        Ok(FailureOutcome::Retrying { retry_count })
    }

    /// Whether the record has entries waiting or in flight.
    pub fn has_open_for(&self, collection: &str, record_id: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.targets(collection, record_id) && e.is_open())
    }

    /// Whether the record has open entries other than `except`.
    pub fn has_other_open_for(&self, collection: &str, record_id: &str, except: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.id != except && e.targets(collection, record_id) && e.is_open())
    }

    /// Drop every unsynced entry of a record. Returns how many were dropped.
    pub fn discard_record(&mut self, collection: &str, record_id: &str) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|e| !(e.targets(collection, record_id) && e.status != OpStatus::Synced));
        before - self.entries.len()
    }

    /// Remove synced entries.
    pub fn compact(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.status != OpStatus::Synced);
        before - self.entries.len()
    }

    /// Give error entries another chance.
    ///
    /// Entries for which `keep` returns false are removed instead.
    /// Returns `(reset, removed)`.
    pub fn reset_errors(&mut self, mut keep: impl FnMut(&PendingOp) -> bool) -> (usize, usize) {
        let mut reset = 0;
        let mut removed = 0;
        self.entries.retain_mut(|e| {
            if e.status != OpStatus::Error {
                return true;
            }
            if keep(e) {
                e.status = OpStatus::Pending;
                e.retry_count = 0;
                e.error_message = None;
                e.last_attempt_at = None;
                reset += 1;
                true
            } else {
                removed += 1;
                false
            }
        });
        (reset, removed)
    }

    /// Remove all error entries.
    pub fn clear_errors(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.status != OpStatus::Error);
        before - self.entries.len()
    }

    /// Put entries left in flight by an interrupted push back to pending.
    pub fn requeue_in_flight(&mut self) -> usize {
        let mut count = 0;
        for op in self.entries.iter_mut().filter(|e| e.status == OpStatus::Syncing) {
            op.status = OpStatus::Pending;
            count += 1;
        }
        count
    }

    pub fn count(&self, status: OpStatus) -> usize {
        self.entries.iter().filter(|e| e.status == status).count()
    }

    pub fn entries(&self) -> &[PendingOp] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Sort by (priority, created_at, seq), then hand each record's slots to its
/// own entries in enqueue order.
fn drain_order(mut ops: Vec<&PendingOp>) -> Vec<&PendingOp> {
    ops.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
    });

    let mut per_record: HashMap<(&str, &str), VecDeque<&PendingOp>> = HashMap::new();
    for op in ops.iter().copied() {
        per_record
            .entry((op.collection.as_str(), op.record_id.as_str()))
            .or_default()
            .push_back(op);
    }
    for queue in per_record.values_mut() {
        queue.make_contiguous().sort_by_key(|op| op.seq);
    }

    ops.into_iter()
        .filter_map(|slot| {
            per_record
                .get_mut(&(slot.collection.as_str(), slot.record_id.as_str()))
                .and_then(VecDeque::pop_front)
        })
        .collect()
}
