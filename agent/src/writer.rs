//! Optimistic write path.
//!
//! Every mutation is applied to the local store first and returned to the
//! caller as a success. The remote call is attempted once afterwards; any
//! failure is parked in the pending queue for the sync cycle to replay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::{Map, Value};
use stockroom_engine::{
    entity, is_remote_shaped, Catalog, OpKind, Record, SyncStatus, DEFAULT_PRIORITY,
};
use tokio::sync::mpsc;

use crate::auth::Authenticator;
use crate::error::{RemoteError, StoreError};
use crate::local::LocalStore;
use crate::mapper::IdMapper;
use crate::queue::OperationQueue;
use crate::remote::{record_fields, RemoteAdapter, OWNER_FIELD};
use crate::sync::Trigger;

type Result<T> = std::result::Result<T, StoreError>;

/// Priority of deletes for records marked synced but without a known
/// remote id; they drain after ordinary entries.
pub const UNLINKED_DELETE_PRIORITY: i32 = 2;

pub struct OptimisticWriter {
    local: Arc<LocalStore>,
    remote: Arc<RemoteAdapter>,
    queue: Arc<OperationQueue>,
    mapper: Arc<IdMapper>,
    auth: Arc<dyn Authenticator>,
    catalog: Arc<Catalog>,
    triggers: mpsc::Sender<Trigger>,
    /// Set when a remote call failed as unreachable; cleared by the next success
    saw_unavailable: AtomicBool,
}

pub(crate) fn status_patch(status: SyncStatus) -> Map<String, Value> {
    let mut patch = Map::new();
    patch.insert("sync_status".into(), serde_json::to_value(status).unwrap_or_default());
    patch
}

impl OptimisticWriter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: Arc<LocalStore>,
        remote: Arc<RemoteAdapter>,
        queue: Arc<OperationQueue>,
        mapper: Arc<IdMapper>,
        auth: Arc<dyn Authenticator>,
        catalog: Arc<Catalog>,
        triggers: mpsc::Sender<Trigger>,
    ) -> Self {
        Self {
            local,
            remote,
            queue,
            mapper,
            auth,
            catalog,
            triggers,
            saw_unavailable: AtomicBool::new(false),
        }
    }

    /// Create a record for the current user.
    pub async fn create(&self, collection: &str, mut data: Map<String, Value>) -> Result<Record> {
        let spec = self.catalog.require(collection)?;
        entity::validate(collection, &data)?;

        if let Some(user) = self.auth.current_user() {
            data.insert(OWNER_FIELD.into(), Value::String(user.id));
        }
        data.remove("remote_id");
        data.extend(status_patch(SyncStatus::Pending));

        let id = self.local.insert(collection, data).await?;
        let record = self.require(collection, &id).await?;
        if !spec.remote_sync {
            return Ok(record);
        }

        let mut fields = record_fields(&record);
        self.mapper.translate_references(collection, &mut fields).await?;

        match self.remote.create(collection, &fields).await {
            Ok(remote_id) => {
                self.remote_succeeded();
                let mut patch = status_patch(SyncStatus::Synced);
                patch.insert("remote_id".into(), Value::String(remote_id));
                self.local.update(collection, &id, patch).await
            }
            Err(err) => {
                self.remote_failed(&err, collection, &id, OpKind::Create);
                self.queue
                    .enqueue(collection, &id, OpKind::Create, record.to_value(), DEFAULT_PRIORITY)
                    .await?;
                Ok(record)
            }
        }
    }

    /// Merge `patch` into a record. Records the current user cannot see
    /// are not found.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        mut patch: Map<String, Value>,
    ) -> Result<Record> {
        let spec = self.catalog.require(collection)?;
        for key in ["id", "remote_id", OWNER_FIELD, "created_at", "updated_at"] {
            patch.remove(key);
        }

        let mut preview = self.require(collection, id).await?;
        preview.apply_patch(patch.clone(), chrono::Utc::now())?;
        entity::validate(collection, &preview.fields)?;

        patch.extend(status_patch(SyncStatus::Pending));
        let record = self.local.update(collection, id, patch).await?;
        if !spec.remote_sync {
            return Ok(record);
        }

        // Earlier queued work for the record must reach the remote store first.
        if self.queue.has_open_for(collection, id).await? {
            self.queue
                .enqueue(collection, id, OpKind::Update, record.to_value(), DEFAULT_PRIORITY)
                .await?;
            return Ok(record);
        }

        let remote_id = match record.meta.remote_id.clone() {
            Some(remote_id) => Some(remote_id),
            None => self.mapper.resolve_remote_id(collection, id).await?,
        };
        let Some(remote_id) = remote_id else {
            self.queue
                .enqueue(collection, id, OpKind::Update, record.to_value(), DEFAULT_PRIORITY)
                .await?;
            return Ok(record);
        };

        let mut fields = record_fields(&record);
        self.mapper.translate_references(collection, &mut fields).await?;

        match self.remote.update(collection, &remote_id, &fields).await {
            Ok(()) => {
                self.remote_succeeded();
                self.local
                    .update(collection, id, status_patch(SyncStatus::Synced))
                    .await
            }
            Err(err) => {
                self.remote_failed(&err, collection, id, OpKind::Update);
                self.queue
                    .enqueue(collection, id, OpKind::Update, record.to_value(), DEFAULT_PRIORITY)
                    .await?;
                Ok(record)
            }
        }
    }

    /// Delete a record. Returns false when it did not exist or belongs to
    /// another user.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        let spec = self.catalog.require(collection)?;
        let Some(snapshot) = self.find_visible(collection, id).await? else {
            return Ok(false);
        };
        self.local.delete(collection, id).await?;
        if !spec.remote_sync {
            self.queue.discard_record(collection, id).await?;
            return Ok(true);
        }

        let target = snapshot
            .meta
            .remote_id
            .clone()
            .or_else(|| is_remote_shaped(id).then(|| id.to_string()));
        let has_open = self.queue.has_open_for(collection, id).await?;

        let Some(remote_id) = target else {
            if has_open || snapshot.meta.sync_status == SyncStatus::Synced {
                let priority = if has_open {
                    DEFAULT_PRIORITY
                } else {
                    UNLINKED_DELETE_PRIORITY
                };
                self.queue
                    .enqueue(collection, id, OpKind::Delete, snapshot.to_value(), priority)
                    .await?;
            } else {
                self.queue.discard_record(collection, id).await?;
            }
            return Ok(true);
        };

        if has_open {
            self.queue
                .enqueue(collection, id, OpKind::Delete, snapshot.to_value(), DEFAULT_PRIORITY)
                .await?;
            return Ok(true);
        }

        match self.remote.delete(collection, &remote_id).await {
            Ok(()) => self.remote_succeeded(),
            Err(err) => {
                self.remote_failed(&err, collection, id, OpKind::Delete);
                self.queue
                    .enqueue(collection, id, OpKind::Delete, snapshot.to_value(), DEFAULT_PRIORITY)
                    .await?;
            }
        }
        Ok(true)
    }

    async fn require(&self, collection: &str, id: &str) -> Result<Record> {
        self.find_visible(collection, id)
            .await?
            .ok_or_else(|| StoreError::not_found(collection, id))
    }

    /// The record, if the current user may see it. Without a signed-in
    /// user only records without an owner are visible.
    async fn find_visible(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let user = self.auth.current_user();
        Ok(self
            .local
            .get_by_id(collection, id)
            .await?
            .filter(|r| match &user {
                Some(user) => r.meta.is_visible_to(&user.id),
                None => r.meta.owner_id.is_none(),
            }))
    }

    fn remote_succeeded(&self) {
        if self.saw_unavailable.swap(false, Ordering::SeqCst) {
            tracing::info!("Remote store reachable again, requesting sync");
            if self.triggers.try_send(Trigger::Mutation).is_err() {
                tracing::debug!("Sync trigger dropped");
            }
        }
    }

    fn remote_failed(&self, err: &RemoteError, collection: &str, id: &str, operation: OpKind) {
        if err.is_retryable() {
            self.saw_unavailable.store(true, Ordering::SeqCst);
        }
        match err {
            RemoteError::Unavailable(_) => tracing::debug!(
                collection = %collection,
                id = %id,
                operation = ?operation,
                "Remote unavailable, operation queued"
            ),
            _ => tracing::warn!(
                collection = %collection,
                id = %id,
                operation = ?operation,
                error = %err,
                "Remote write failed, operation queued"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{SessionAuth, User};
    use crate::config::SyncSettings;
    use crate::context::SyncContext;
    use crate::remote::{CallKind, MemoryRemoteStore};
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use stockroom_engine::OpStatus;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn context() -> (SyncContext, Arc<MemoryRemoteStore>) {
        let remote = Arc::new(MemoryRemoteStore::new());
        let ctx = SyncContext::new(
            Arc::new(MemoryStorage::new()),
            Some(remote.clone()),
            Arc::new(SessionAuth::signed_in(User::new("u1"))),
            SyncSettings::default(),
        );
        (ctx, remote)
    }

    #[tokio::test]
    async fn online_create_is_synced_with_remote_id() {
        let (ctx, remote) = context();
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget", "sku": "A1"})))
            .await
            .unwrap();

        assert!(stockroom_engine::is_local_shaped(&record.meta.id));
        assert_eq!(record.meta.sync_status, SyncStatus::Synced);
        assert_eq!(record.meta.owner_id.as_deref(), Some("u1"));
        let remote_id = record.remote_id().unwrap();
        assert_eq!(remote.document("products", remote_id).unwrap().fields["sku"], "A1");
        assert!(ctx.queue.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn offline_create_is_queued() {
        let (ctx, remote) = context();
        ctx.remote.set_offline(true);

        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();

        assert_eq!(record.meta.sync_status, SyncStatus::Pending);
        let queued = ctx.queue.dequeue_pending().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, OpKind::Create);
        assert_eq!(queued[0].record_id, record.meta.id);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn invalid_data_is_rejected_before_writing() {
        let (ctx, _) = context();
        let err = ctx
            .writer
            .create("stock", fields(json!({"quantity": 3})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Engine(_)));
        assert_eq!(ctx.local.count("stock").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn update_behind_queued_work_only_enqueues() {
        let (ctx, remote) = context();
        ctx.remote.set_offline(true);
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();
        ctx.remote.set_offline(false);

        let updated = ctx
            .writer
            .update("products", &record.meta.id, fields(json!({"price": 3})))
            .await
            .unwrap();

        assert_eq!(updated.meta.sync_status, SyncStatus::Pending);
        let kinds: Vec<_> = ctx
            .queue
            .dequeue_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|op| op.operation)
            .collect();
        assert_eq!(kinds, vec![OpKind::Create, OpKind::Update]);
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn rejected_update_is_queued_and_record_stays_pending() {
        let (ctx, remote) = context();
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();

        remote.fail_next(RemoteError::Rejected("permission denied".into()));
        let updated = ctx
            .writer
            .update("products", &record.meta.id, fields(json!({"name": "Gadget"})))
            .await
            .unwrap();

        assert_eq!(updated.meta.sync_status, SyncStatus::Pending);
        assert_eq!(ctx.queue.count(OpStatus::Pending).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_online_removes_remote_copy() {
        let (ctx, remote) = context();
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();
        let remote_id = record.remote_id().unwrap().to_string();

        assert!(ctx.writer.delete("products", &record.meta.id).await.unwrap());
        assert!(remote.document("products", &remote_id).is_none());
        assert!(!ctx.writer.delete("products", &record.meta.id).await.unwrap());
    }

    #[tokio::test]
    async fn offline_delete_keeps_remote_id_in_payload() {
        let (ctx, _) = context();
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();
        ctx.remote.set_offline(true);

        ctx.writer.delete("products", &record.meta.id).await.unwrap();

        let queued = ctx.queue.dequeue_pending().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, OpKind::Delete);
        assert_eq!(queued[0].payload["remote_id"], json!(record.remote_id()));
    }

    #[tokio::test]
    async fn delete_of_unsynced_record_supersedes_its_create() {
        let (ctx, remote) = context();
        remote.fail_next(RemoteError::Rejected("bad data".into()));
        let record = ctx
            .writer
            .create("products", fields(json!({"name": "Widget"})))
            .await
            .unwrap();

        ctx.writer.delete("products", &record.meta.id).await.unwrap();

        let queued = ctx.queue.dequeue_pending().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].operation, OpKind::Delete);
        assert!(remote.calls_of(CallKind::Delete).is_empty());
    }

    #[tokio::test]
    async fn other_owners_records_cannot_be_changed() {
        let (ctx, remote) = context();
        let theirs = ctx
            .local
            .insert("products", fields(json!({"name": "Theirs", "owner_id": "u2"})))
            .await
            .unwrap();

        let err = ctx
            .writer
            .update("products", &theirs, fields(json!({"price": 42})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
        assert!(!ctx.writer.delete("products", &theirs).await.unwrap());

        let kept = ctx.local.get_by_id("products", &theirs).await.unwrap().unwrap();
        assert_eq!(kept.get("price"), None);
        assert!(ctx.queue.snapshot().await.unwrap().is_empty());
        assert!(remote.calls().is_empty());
    }

    #[tokio::test]
    async fn recovery_after_outage_requests_a_sync() {
        let (ctx, remote) = context();
        remote.fail_next(RemoteError::Unavailable("network down".into()));
        ctx.writer
            .create("products", fields(json!({"name": "A"})))
            .await
            .unwrap();
        ctx.writer
            .create("products", fields(json!({"name": "B"})))
            .await
            .unwrap();

        let mut rx = ctx.take_trigger_receiver().unwrap();
        assert_eq!(rx.try_recv().unwrap(), Trigger::Mutation);
        assert!(rx.try_recv().is_err());
    }
}
