//! The sync cycle: pull, reconcile, push.
//!
//! At most one cycle runs at a time. A cycle pulls every synced collection
//! for the signed-in owner, merges the documents into the local store,
//! reconciles what it pulled into and finally drains the pending queue.
//! Failures inside a cycle are collected into its [`SyncReport`]; nothing
//! here propagates an error to the trigger that started the cycle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use stockroom_engine::{
    is_remote_shaped, Catalog, CollectionName, CollectionSpec, FailureOutcome, OpKind, OpStatus,
    PendingOp, Record, RecordId, ReconcileSummary, RetryPolicy, SyncStatus, Timestamp,
};
use tokio::sync::{watch, Mutex};

use crate::auth::Authenticator;
use crate::error::{StoreError, SyncError};
use crate::local::LocalStore;
use crate::mapper::IdMapper;
use crate::queue::OperationQueue;
use crate::reconciler::Reconciler;
use crate::remote::{self, record_fields, RemoteAdapter, RemoteDocument};
use crate::writer::status_patch;

/// What the orchestrator is doing right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Idle,
    Pulling,
    Reconciling,
    Pushing,
}

/// Why a requested cycle did not run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyRunning,
    NoUser,
    Offline,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    Skipped { reason: SkipReason },
    Completed(SyncReport),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Skipped { .. } => None,
        }
    }
}

/// Counters and errors of one completed cycle.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: Timestamp,
    pub finished_at: Timestamp,
    /// Remote documents inserted locally
    pub pulled: usize,
    /// Local records overwritten by a newer remote version
    pub updated: usize,
    /// Local records that learned their remote id
    pub linked: usize,
    /// Local records removed because their remote document is gone
    pub removed_remote_deleted: usize,
    /// Collections skipped because local and remote already agreed
    pub unchanged_collections: Vec<CollectionName>,
    pub failed_collections: Vec<CollectionName>,
    /// Reconciliation passes that removed something
    pub reconciled: Vec<ReconcileSummary>,
    pub pushed: usize,
    pub retried: usize,
    pub failed: usize,
    pub superseded: usize,
    pub errors: Vec<String>,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub phase: SyncPhase,
    pub running: bool,
    pub remote_enabled: bool,
    pub offline: bool,
    pub pending: usize,
    pub errors: usize,
    pub last_finished_at: Option<Timestamp>,
    pub last_report: Option<SyncReport>,
}

/// Clears the running flag and resets the phase when a cycle ends,
/// however it ends.
struct CycleGuard<'a> {
    running: &'a AtomicBool,
    phase: &'a watch::Sender<SyncPhase>,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.phase.send_replace(SyncPhase::Idle);
        self.running.store(false, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator {
    local: Arc<LocalStore>,
    remote: Arc<RemoteAdapter>,
    queue: Arc<OperationQueue>,
    mapper: Arc<IdMapper>,
    reconciler: Arc<Reconciler>,
    auth: Arc<dyn Authenticator>,
    catalog: Arc<Catalog>,
    retry: RetryPolicy,
    running: AtomicBool,
    phase: watch::Sender<SyncPhase>,
    last_report: Mutex<Option<SyncReport>>,
}

impl SyncOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<RemoteAdapter>,
        queue: Arc<OperationQueue>,
        mapper: Arc<IdMapper>,
        reconciler: Arc<Reconciler>,
        auth: Arc<dyn Authenticator>,
        catalog: Arc<Catalog>,
        retry: RetryPolicy,
    ) -> Self {
        let (phase, _) = watch::channel(SyncPhase::Idle);
        Self {
            local,
            remote,
            queue,
            mapper,
            reconciler,
            auth,
            catalog,
            retry,
            running: AtomicBool::new(false),
            phase,
            last_report: Mutex::new(None),
        }
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SyncPhase> {
        self.phase.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().await.clone()
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.send_replace(phase);
    }

    /// Run one cycle unless one is already running, nobody is signed in or
    /// the remote store is switched off.
    pub async fn start_sync(&self) -> SyncOutcome {
        let Some(user) = self.auth.current_user() else {
            tracing::debug!("No signed-in user, sync skipped");
            return SyncOutcome::Skipped {
                reason: SkipReason::NoUser,
            };
        };
        if !self.remote.is_available() {
            tracing::debug!("Remote store unavailable, sync skipped");
            return SyncOutcome::Skipped {
                reason: SkipReason::Offline,
            };
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Sync already running");
            return SyncOutcome::Skipped {
                reason: SkipReason::AlreadyRunning,
            };
        }
        let _guard = CycleGuard {
            running: &self.running,
            phase: &self.phase,
        };

        let mut report = SyncReport {
            started_at: Utc::now(),
            ..SyncReport::default()
        };
        tracing::info!(owner = %user.id, "Sync cycle started");

        self.set_phase(SyncPhase::Pulling);
        let pulled = self.pull(&user.id, &mut report).await;

        self.set_phase(SyncPhase::Reconciling);
        for collection in &pulled {
            // A parent that failed to pull may be incomplete locally, so
            // missing parents prove nothing this cycle.
            let parent_failed = self.catalog.get(collection).is_some_and(|spec| {
                spec.parents()
                    .into_iter()
                    .any(|parent| report.failed_collections.iter().any(|f| f == parent))
            });
            let result = if parent_failed {
                tracing::debug!(collection = %collection, "Parent pull failed, orphan pass skipped");
                self.reconciler.reconcile_duplicates(collection).await
            } else {
                self.reconciler.reconcile(collection).await
            };
            match result {
                Ok(summary) if summary.total_removed() > 0 => report.reconciled.push(summary),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(collection = %collection, "Reconcile failed: {}", e);
                    report.errors.push(format!("reconcile {collection}: {e}"));
                }
            }
        }

        self.set_phase(SyncPhase::Pushing);
        self.push(&mut report).await;

        report.finished_at = Utc::now();
        tracing::info!(
            pulled = report.pulled,
            updated = report.updated,
            pushed = report.pushed,
            retried = report.retried,
            failed = report.failed,
            errors = report.errors.len(),
            "Sync cycle finished"
        );
        *self.last_report.lock().await = Some(report.clone());
        SyncOutcome::Completed(report)
    }

    /// Give errored entries another chance, then run a cycle.
    ///
    /// Entries whose record no longer exists locally are dropped instead,
    /// except deletes, which never have a local record.
    pub async fn force_sync(&self) -> Result<SyncOutcome, StoreError> {
        let mut keep: HashSet<String> = HashSet::new();
        for op in self.queue.snapshot().await? {
            if op.status != OpStatus::Error {
                continue;
            }
            if op.operation == OpKind::Delete {
                keep.insert(op.id);
                continue;
            }
            let Some(record) = self.local.get_by_id(&op.collection, &op.record_id).await? else {
                continue;
            };
            if record.meta.sync_status == SyncStatus::Error {
                self.local
                    .update(&op.collection, &op.record_id, status_patch(SyncStatus::Pending))
                    .await?;
            }
            keep.insert(op.id);
        }

        let (reset, removed) = self.queue.reset_errors(|op| keep.contains(&op.id)).await?;
        tracing::info!(reset, removed, "Forced sync");
        Ok(self.start_sync().await)
    }

    /// Drop every errored entry. Returns how many were dropped.
    pub async fn clear_errors(&self) -> Result<usize, StoreError> {
        let cleared = self.queue.clear_errors().await?;
        tracing::info!(cleared, "Cleared errored operations");
        Ok(cleared)
    }

    pub async fn status(&self) -> Result<SyncState, StoreError> {
        let last_report = self.last_report().await;
        Ok(SyncState {
            phase: self.phase(),
            running: self.is_running(),
            remote_enabled: self.remote.is_enabled(),
            offline: self.remote.is_offline(),
            pending: self.queue.count(OpStatus::Pending).await?,
            errors: self.queue.count(OpStatus::Error).await?,
            last_finished_at: last_report.as_ref().map(|r| r.finished_at),
            last_report,
        })
    }

    // ---- pull ----

    /// Fetch every synced collection concurrently and merge the results.
    /// Returns the collections that were fetched and merged.
    async fn pull(&self, owner: &str, report: &mut SyncReport) -> Vec<CollectionName> {
        let specs: Vec<&CollectionSpec> = self.catalog.synced().collect();
        let fetched_at = Utc::now();
        let fetched = futures::future::join_all(
            specs
                .iter()
                .map(|spec| self.remote.query_owned(&spec.name, owner)),
        )
        .await;

        let mut pulled = Vec::new();
        for (spec, result) in specs.into_iter().zip(fetched) {
            let outcome = match result {
                Ok(docs) => self.merge(spec, owner, docs, fetched_at, report).await,
                Err(e) => Err(SyncError::from(e)),
            };
            match outcome {
                Ok(()) => pulled.push(spec.name.clone()),
                Err(e) => {
                    if e.is_retryable() {
                        tracing::debug!(collection = %spec.name, "Pull failed: {}", e);
                    } else {
                        tracing::warn!(collection = %spec.name, "Pull failed: {}", e);
                    }
                    report.failed_collections.push(spec.name.clone());
                    report.errors.push(format!("pull {}: {e}", spec.name));
                }
            }
        }
        pulled
    }

    /// Merge fetched documents into the local store.
    ///
    /// Decisions are made against a snapshot and applied under the store's
    /// write lock, where each one is re-checked against the current record.
    async fn merge(
        &self,
        spec: &CollectionSpec,
        owner: &str,
        docs: Vec<RemoteDocument>,
        fetched_at: Timestamp,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let collection = spec.name.as_str();
        let local = self.local.get_all_by_owner(collection, owner).await?;
        // Documents this device is about to delete must not come back.
        let doomed = self.queue.delete_targets(collection).await?;
        let incoming: Vec<Record> = docs
            .into_iter()
            .map(remote::to_record)
            .filter(|r| !doomed.contains(r.id()))
            .collect();

        if in_step(&local, &incoming) {
            report.unchanged_collections.push(spec.name.clone());
            return Ok(());
        }

        let mut batch = MergeBatch::default();
        let mut matched: HashSet<&str> = HashSet::new();

        for doc in &incoming {
            let remote_id = doc.id();
            let Some(existing) = find_counterpart(spec, &local, doc) else {
                batch.inserts.push(doc.clone());
                continue;
            };
            matched.insert(existing.id());

            let unlinked = existing.remote_id().is_none();
            let busy = existing.meta.sync_status != SyncStatus::Synced
                || self.queue.has_open_for(collection, existing.id()).await?;
            if busy || doc.meta.updated_at <= existing.meta.updated_at {
                // Local work wins until it is pushed; only learn the link.
                if unlinked {
                    batch.links.push((existing.meta.id.clone(), remote_id.to_string()));
                }
                continue;
            }

            let mut merged = doc.clone();
            merged.meta.id = existing.meta.id.clone();
            merged.meta.created_at = existing.meta.created_at;
            if merged.meta.owner_id.is_none() {
                merged.meta.owner_id = existing.meta.owner_id.clone();
            }
            batch.replacements.push((merged, existing.meta.updated_at));
        }

        let remote_ids: HashSet<&str> = incoming.iter().map(Record::id).collect();
        for record in &local {
            let Some(remote_id) = record.remote_id() else {
                continue;
            };
            if remote_ids.contains(remote_id)
                || matched.contains(record.id())
                || record.meta.sync_status != SyncStatus::Synced
                || record.meta.owner_id.as_deref() != Some(owner)
            {
                continue;
            }
            if self.queue.has_open_for(collection, record.id()).await? {
                continue;
            }
            batch.vanished.insert(record.meta.id.clone());
        }

        let applied = self
            .local
            .modify(collection, |records| {
                let applied = batch.apply(records, fetched_at, Utc::now());
                let changed = applied.changed();
                (applied, changed)
            })
            .await?;

        report.pulled += applied.inserted;
        report.updated += applied.updated;
        report.linked += applied.linked;
        if applied.removed > 0 {
            tracing::info!(collection = %collection, removed = applied.removed, "Removed records deleted remotely");
            report.removed_remote_deleted += applied.removed;
        }
        if applied.skipped > 0 {
            tracing::debug!(collection = %collection, skipped = applied.skipped, "Records changed during pull kept");
        }

        tracing::debug!(collection = %collection, documents = incoming.len(), "Merged remote documents");
        Ok(())
    }

    // ---- push ----

    async fn push(&self, report: &mut SyncReport) {
        let ready = match self.queue.ready(Utc::now(), &self.retry).await {
            Ok(ready) => ready,
            Err(e) => {
                tracing::error!("Failed to read pending queue: {}", e);
                report.errors.push(format!("queue: {e}"));
                return;
            }
        };

        // A failed entry blocks later entries for the same record this cycle.
        let mut blocked: HashSet<(CollectionName, RecordId)> = HashSet::new();
        for op in ready {
            let key = (op.collection.clone(), op.record_id.clone());
            if blocked.contains(&key) {
                continue;
            }
            match self.queue.get(&op.id).await {
                Ok(Some(current)) if current.status == OpStatus::Pending => {}
                Ok(_) => continue,
                Err(e) => {
                    report.errors.push(format!("queue: {e}"));
                    continue;
                }
            }
            if let Err(e) = self.queue.mark_syncing(&op.id).await {
                tracing::error!(op_id = %op.id, "Failed to mark operation syncing: {}", e);
                report.errors.push(format!("queue: {e}"));
                blocked.insert(key);
                continue;
            }

            match self.replay(&op).await {
                Ok(()) => self.complete(&op, report).await,
                Err(err) => {
                    blocked.insert(key);
                    self.fail(&op, err, report).await;
                }
            }
        }

        match self.queue.compact().await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Compacted pending queue"),
            Err(e) => report.errors.push(format!("queue: {e}")),
        }
    }

    async fn replay(&self, op: &PendingOp) -> Result<(), SyncError> {
        match op.operation {
            OpKind::Create | OpKind::Update => {
                let Some(current) = self.local.get_by_id(&op.collection, &op.record_id).await?
                else {
                    tracing::debug!(
                        collection = %op.collection,
                        record_id = %op.record_id,
                        "Record gone locally, nothing to send"
                    );
                    return Ok(());
                };

                let snapshot = queued_snapshot(op, &current);
                let remote_id = match current.meta.remote_id.clone() {
                    Some(remote_id) => Some(remote_id),
                    None if op.operation == OpKind::Update => {
                        self.mapper
                            .resolve_remote_id(&op.collection, &op.record_id)
                            .await?
                    }
                    None => None,
                };
                match remote_id {
                    Some(remote_id) => self.send_update(&op.collection, &snapshot, &remote_id).await,
                    None => self.send_create(&op.collection, &snapshot).await,
                }
            }
            OpKind::Delete => self.send_delete(op).await,
        }
    }

    async fn outgoing(&self, collection: &str, record: &Record) -> Result<Map<String, Value>, SyncError> {
        let mut fields = record_fields(record);
        self.mapper.translate_references(collection, &mut fields).await?;
        Ok(fields)
    }

    async fn send_create(&self, collection: &str, record: &Record) -> Result<(), SyncError> {
        let fields = self.outgoing(collection, record).await?;
        let remote_id = self.remote.create(collection, &fields).await?;

        let mut patch = Map::new();
        patch.insert("remote_id".into(), Value::String(remote_id.clone()));
        match self.local.update(collection, record.id(), patch).await {
            Ok(_) => Ok(()),
            Err(StoreError::NotFound { .. }) => {
                // Deleted locally while the create was in flight.
                tracing::info!(
                    collection = %collection,
                    remote_id = %remote_id,
                    "Record deleted during create, removing remote copy"
                );
                self.remote.delete(collection, &remote_id).await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn send_update(&self, collection: &str, record: &Record, remote_id: &str) -> Result<(), SyncError> {
        let fields = self.outgoing(collection, record).await?;
        self.remote.update(collection, remote_id, &fields).await?;
        Ok(())
    }

    async fn send_delete(&self, op: &PendingOp) -> Result<(), SyncError> {
        let mut target = op
            .payload
            .get("remote_id")
            .and_then(Value::as_str)
            .map(str::to_string);
        if target.is_none() {
            target = self
                .mapper
                .resolve_remote_id(&op.collection, &op.record_id)
                .await?;
        }
        if target.is_none() && is_remote_shaped(&op.record_id) {
            target = Some(op.record_id.clone());
        }

        match target {
            Some(remote_id) => Ok(self.remote.delete(&op.collection, &remote_id).await?),
            None => {
                tracing::debug!(
                    collection = %op.collection,
                    record_id = %op.record_id,
                    "Delete has no remote target"
                );
                Ok(())
            }
        }
    }

    async fn complete(&self, op: &PendingOp, report: &mut SyncReport) {
        match self.queue.mark_synced(&op.id).await {
            Ok(()) => {}
            Err(StoreError::Engine(stockroom_engine::Error::OperationNotFound(_))) => {
                tracing::debug!(op_id = %op.id, "Operation dropped while in flight");
            }
            Err(e) => {
                report.errors.push(format!("queue: {e}"));
                return;
            }
        }
        report.pushed += 1;

        if op.operation == OpKind::Delete {
            return;
        }
        let result = self.settle_record(op, SyncStatus::Synced).await;
        if let Err(e) = result {
            report.errors.push(format!("{}/{}: {e}", op.collection, op.record_id));
        }
    }

    async fn fail(&self, op: &PendingOp, err: SyncError, report: &mut SyncReport) {
        let message = err.to_string();
        let outcome = self
            .queue
            .record_failure(&op.id, err.is_retryable(), &message, &self.retry)
            .await;

        match outcome {
            Ok(FailureOutcome::Retrying { retry_count }) => {
                report.retried += 1;
                if err.is_retryable() {
                    tracing::debug!(op_id = %op.id, retry_count, "Push deferred: {}", message);
                } else {
                    tracing::warn!(op_id = %op.id, retry_count, "Push rejected: {}", message);
                }
            }
            Ok(FailureOutcome::Exhausted { retry_count }) => {
                report.failed += 1;
                tracing::error!(
                    op_id = %op.id,
                    collection = %op.collection,
                    record_id = %op.record_id,
                    retry_count,
                    "Push failed permanently: {}",
                    message
                );
                report
                    .errors
                    .push(format!("{}/{}: {message}", op.collection, op.record_id));
                if op.operation != OpKind::Delete {
                    if let Err(e) = self.settle_record(op, SyncStatus::Error).await {
                        report.errors.push(format!("{}/{}: {e}", op.collection, op.record_id));
                    }
                }
            }
            Ok(FailureOutcome::Superseded)
            | Err(StoreError::Engine(stockroom_engine::Error::OperationNotFound(_))) => {
                report.superseded += 1;
            }
            Err(e) => report.errors.push(format!("queue: {e}")),
        }
    }

    /// Set the record's status once no other queued work is left for it.
    async fn settle_record(&self, op: &PendingOp, status: SyncStatus) -> Result<(), StoreError> {
        if status == SyncStatus::Synced
            && self
                .queue
                .has_other_open_for(&op.collection, &op.record_id, &op.id)
                .await?
        {
            return Ok(());
        }
        let Some(record) = self.local.get_by_id(&op.collection, &op.record_id).await? else {
            return Ok(());
        };
        if record.meta.sync_status == status {
            return Ok(());
        }
        match self
            .local
            .update(&op.collection, &op.record_id, status_patch(status))
            .await
        {
            Ok(_) | Err(StoreError::NotFound { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Record state captured when the entry was queued, falling back to the
/// current record for entries without a usable snapshot.
fn queued_snapshot(op: &PendingOp, current: &Record) -> Record {
    match Record::from_value(op.payload.clone()) {
        Ok(snapshot) if snapshot.id() == current.id() => snapshot,
        _ => current.clone(),
    }
}

/// Pull decisions for one collection, applied against the records as they
/// are when the write lock is held.
#[derive(Default)]
struct MergeBatch {
    inserts: Vec<Record>,
    /// Newer remote versions, with the `updated_at` the local copy had
    replacements: Vec<(Record, Timestamp)>,
    links: Vec<(RecordId, RecordId)>,
    vanished: HashSet<RecordId>,
}

#[derive(Debug, Default, PartialEq, Eq)]
struct MergeApplied {
    inserted: usize,
    updated: usize,
    linked: usize,
    removed: usize,
    /// Decisions dropped because the record changed after the snapshot
    skipped: usize,
}

impl MergeApplied {
    fn changed(&self) -> bool {
        self.inserted + self.updated + self.linked + self.removed > 0
    }
}

impl MergeBatch {
    fn apply(self, records: &mut Vec<Record>, fetched_at: Timestamp, now: Timestamp) -> MergeApplied {
        let mut applied = MergeApplied::default();

        for (incoming, seen_at) in self.replacements {
            match records.iter_mut().find(|r| r.id() == incoming.id()) {
                Some(current)
                    if current.meta.updated_at == seen_at
                        && current.meta.sync_status == SyncStatus::Synced =>
                {
                    *current = incoming;
                    applied.updated += 1;
                }
                _ => applied.skipped += 1,
            }
        }

        for (id, remote_id) in self.links {
            match records.iter_mut().find(|r| r.id() == id) {
                Some(current) if current.meta.remote_id.is_none() => {
                    current.meta.remote_id = Some(remote_id);
                    current.meta.updated_at = now;
                    applied.linked += 1;
                }
                _ => applied.skipped += 1,
            }
        }

        for doc in self.inserts {
            if records.iter().any(|r| r.meta.answers_to(doc.id())) {
                applied.skipped += 1;
                continue;
            }
            records.push(doc);
            applied.inserted += 1;
        }

        // Only records untouched since the fetch began can have vanished.
        let before = records.len();
        records.retain(|r| {
            !(self.vanished.contains(r.id())
                && r.meta.sync_status == SyncStatus::Synced
                && r.meta.updated_at < fetched_at)
        });
        applied.removed = before - records.len();
        applied.skipped += self.vanished.len().saturating_sub(applied.removed);

        applied
    }
}

/// The local record a remote document corresponds to: by remote id, then
/// by id, then by business key among records not yet linked.
fn find_counterpart<'a>(spec: &CollectionSpec, local: &'a [Record], doc: &Record) -> Option<&'a Record> {
    let remote_id = doc.id();
    local
        .iter()
        .find(|r| r.remote_id() == Some(remote_id))
        .or_else(|| local.iter().find(|r| r.id() == remote_id))
        .or_else(|| {
            let (key, value) = spec.identity_of(doc)?;
            local
                .iter()
                .find(|r| r.remote_id().is_none() && key.value_of(r).as_deref() == Some(value.as_str()))
        })
}

/// Whether the local records already mirror the remote documents: same
/// count, every document known locally, synced and at least as fresh.
fn in_step(local: &[Record], incoming: &[Record]) -> bool {
    if local.len() != incoming.len() {
        return false;
    }
    let mut known: HashMap<&str, &Record> = HashMap::new();
    for record in local {
        known.insert(record.id(), record);
        if let Some(remote_id) = record.remote_id() {
            known.insert(remote_id, record);
        }
    }
    incoming.iter().all(|doc| {
        known.get(doc.id()).is_some_and(|r| {
            r.meta.sync_status == SyncStatus::Synced && r.meta.updated_at >= doc.meta.updated_at
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    #[test]
    fn in_step_requires_every_document_known_and_fresh() {
        let local = vec![record(json!({
            "id": "id-1", "remote_id": "RemoteDoc0001", "sync_status": "synced",
            "updated_at": "2024-02-01T00:00:00Z",
        }))];
        let mut doc = record(json!({"id": "RemoteDoc0001", "updated_at": "2024-01-01T00:00:00Z"}));
        assert!(in_step(&local, std::slice::from_ref(&doc)));

        doc.meta.updated_at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        assert!(!in_step(&local, std::slice::from_ref(&doc)));

        let other = record(json!({"id": "RemoteDoc0002"}));
        assert!(!in_step(&local, &[other]));
        assert!(!in_step(&local, &[]));
    }

    #[test]
    fn merge_batch_rechecks_current_records() {
        let at = |month, day, hour| Utc.with_ymd_and_hms(2024, month, day, hour, 0, 0).unwrap();
        let mut records = vec![
            record(json!({
                "id": "id-edited", "remote_id": "RemoteDoc0001", "sync_status": "pending",
                "name": "Local", "updated_at": "2024-06-01T12:00:00Z",
            })),
            record(json!({
                "id": "id-fresh", "remote_id": "RemoteDoc0002", "sync_status": "synced",
                "updated_at": "2024-06-01T12:00:00Z",
            })),
            record(json!({
                "id": "id-gone", "remote_id": "RemoteDoc0003", "sync_status": "synced",
                "updated_at": "2024-05-01T00:00:00Z",
            })),
            record(json!({
                "id": "id-linked", "remote_id": "RemoteDoc0004", "sync_status": "synced",
                "updated_at": "2024-05-01T00:00:00Z",
            })),
        ];

        let mut batch = MergeBatch::default();
        batch.replacements.push((
            record(json!({"id": "id-edited", "name": "Remote", "sync_status": "synced"})),
            at(5, 1, 0),
        ));
        batch.links.push(("id-linked".into(), "RemoteDoc0009".into()));
        batch.inserts.push(record(json!({"id": "RemoteDoc0004"})));
        batch.inserts.push(record(json!({"id": "RemoteDoc0005"})));
        batch.vanished.extend(["id-fresh".to_string(), "id-gone".to_string()]);

        let applied = batch.apply(&mut records, at(6, 1, 0), at(6, 2, 0));
        assert_eq!(
            applied,
            MergeApplied {
                inserted: 1,
                updated: 0,
                linked: 0,
                removed: 1,
                skipped: 4,
            }
        );
        let ids: Vec<_> = records.iter().map(Record::id).collect();
        assert_eq!(ids, vec!["id-edited", "id-fresh", "id-linked", "RemoteDoc0005"]);
        assert_eq!(records[0].text("name").as_deref(), Some("Local"));
        assert_eq!(records[2].remote_id(), Some("RemoteDoc0004"));
    }

    #[test]
    fn merge_batch_applies_unchanged_records() {
        let now = Utc.with_ymd_and_hms(2024, 6, 2, 0, 0, 0).unwrap();
        let mut records = vec![
            record(json!({
                "id": "id-a", "remote_id": "RemoteDoc0001", "sync_status": "synced",
                "name": "Old", "updated_at": "2024-05-01T00:00:00Z",
            })),
            record(json!({"id": "id-b", "sync_status": "pending", "updated_at": "2024-05-01T00:00:00Z"})),
        ];
        let seen = records[0].meta.updated_at;

        let mut batch = MergeBatch::default();
        let mut newer = records[0].clone();
        newer.fields.insert("name".into(), json!("New"));
        batch.replacements.push((newer, seen));
        batch.links.push(("id-b".into(), "RemoteDoc0002".into()));

        let applied = batch.apply(&mut records, now, now);
        assert_eq!(applied.updated, 1);
        assert_eq!(applied.linked, 1);
        assert!(applied.changed());
        assert_eq!(records[0].text("name").as_deref(), Some("New"));
        assert_eq!(records[1].remote_id(), Some("RemoteDoc0002"));
        assert_eq!(records[1].meta.updated_at, now);
    }

    #[test]
    fn counterpart_falls_back_to_business_key() {
        let catalog = Catalog::inventory();
        let spec = catalog.require("products").unwrap();
        let local = vec![
            record(json!({"id": "id-a", "sku": "A1"})),
            record(json!({"id": "id-b", "sku": "B2", "remote_id": "RemoteDoc0009"})),
        ];

        let by_key = record(json!({"id": "RemoteDoc0001", "sku": "A1"}));
        assert_eq!(find_counterpart(spec, &local, &by_key).map(Record::id), Some("id-a"));

        let by_remote = record(json!({"id": "RemoteDoc0009", "sku": "zz"}));
        assert_eq!(find_counterpart(spec, &local, &by_remote).map(Record::id), Some("id-b"));

        // Already linked elsewhere; a second remote copy stays separate.
        let linked_key = record(json!({"id": "RemoteDoc0003", "sku": "B2"}));
        assert!(find_counterpart(spec, &local, &linked_key).is_none());
    }
}
