//! Executes duplicate/orphan reconciliation plans against the local store.

use std::sync::Arc;

use stockroom_engine::{
    reconcile, Catalog, OpKind, ParentIndex, RecordId, ReconcileSummary, RemovalReason,
    DEFAULT_PRIORITY,
};

use crate::error::StoreError;
use crate::local::LocalStore;
use crate::queue::OperationQueue;

type Result<T> = std::result::Result<T, StoreError>;

pub struct Reconciler {
    local: Arc<LocalStore>,
    queue: Arc<OperationQueue>,
    catalog: Arc<Catalog>,
}

impl Reconciler {
    pub fn new(local: Arc<LocalStore>, queue: Arc<OperationQueue>, catalog: Arc<Catalog>) -> Self {
        Self {
            local,
            queue,
            catalog,
        }
    }

    /// Remove duplicates and orphans from `collection`.
    ///
    /// Removed records that exist remotely get a queued delete; the queued
    /// work of records that never reached the remote store is dropped.
    pub async fn reconcile(&self, collection: &str) -> Result<ReconcileSummary> {
        self.run(collection, true).await
    }

    /// Remove duplicates from `collection` but keep records whose parent
    /// is missing. Used when the parent collections may be incomplete.
    pub async fn reconcile_duplicates(&self, collection: &str) -> Result<ReconcileSummary> {
        self.run(collection, false).await
    }

    async fn run(&self, collection: &str, orphans: bool) -> Result<ReconcileSummary> {
        let spec = self.catalog.require(collection)?;
        let records = self.local.get_all(collection).await?;

        let mut parents = ParentIndex::new();
        if orphans {
            for parent in spec.parents() {
                let parent_records = self.local.get_all(parent).await?;
                parents.insert(parent, &parent_records);
            }
        }

        let mut plan = reconcile::plan(spec, &records, &parents);
        if !orphans {
            plan.removals.retain(|r| r.reason != RemovalReason::Orphan);
        }
        let summary = plan.summary();
        if plan.is_empty() {
            return Ok(summary);
        }

        let ids: Vec<RecordId> = plan.removals.iter().map(|r| r.id.clone()).collect();
        self.local.remove_many(collection, &ids).await?;

        for removal in &plan.removals {
            if removal.remote_id.is_some() {
                let payload = records
                    .iter()
                    .find(|r| r.id() == removal.id)
                    .map(|r| r.to_value())
                    .unwrap_or_default();
                self.queue
                    .enqueue(collection, &removal.id, OpKind::Delete, payload, DEFAULT_PRIORITY)
                    .await?;
            } else {
                self.queue.discard_record(collection, &removal.id).await?;
            }
            tracing::debug!(
                collection = %collection,
                id = %removal.id,
                reason = ?removal.reason,
                key = %removal.key,
                "Removed record"
            );
        }

        tracing::info!(
            collection = %collection,
            groups = summary.groups_found,
            duplicates = summary.duplicates_removed,
            orphans = summary.orphans_removed,
            "Reconciled collection"
        );
        Ok(summary)
    }

    /// Reconcile every catalog collection, parents first.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconcileSummary>> {
        let mut summaries = Vec::new();
        for spec in self.catalog.iter() {
            summaries.push(self.reconcile(&spec.name).await?);
        }
        Ok(summaries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::{json, Map, Value};
    use std::time::Duration;
    use stockroom_engine::{Record, RemovalReason};

    struct Fixture {
        local: Arc<LocalStore>,
        queue: Arc<OperationQueue>,
        reconciler: Reconciler,
    }

    fn fixture() -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let local = Arc::new(LocalStore::new(storage.clone(), Duration::from_secs(5)));
        let queue = Arc::new(OperationQueue::new(storage));
        let reconciler = Reconciler::new(local.clone(), queue.clone(), Arc::new(Catalog::inventory()));
        Fixture {
            local,
            queue,
            reconciler,
        }
    }

    fn record(value: Value) -> Record {
        Record::from_value(value).unwrap()
    }

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn newest_sku_duplicate_survives_and_remote_copy_is_queued() {
        let f = fixture();
        f.local
            .put_raw_many(
                "products",
                vec![
                    record(json!({
                        "id": "old", "remote_id": "RemoteOld0001", "sku": "A1",
                        "owner_id": "u1", "updated_at": "2024-01-01T00:00:00Z",
                    })),
                    record(json!({
                        "id": "new", "sku": "A1",
                        "owner_id": "u1", "updated_at": "2024-02-01T00:00:00Z",
                    })),
                ],
            )
            .await
            .unwrap();

        let summary = f.reconciler.reconcile("products").await.unwrap();
        assert_eq!(summary.groups_found, 1);
        assert_eq!(summary.duplicates_removed, 1);

        let left = f.local.get_all("products").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id(), "new");

        let pending = f.queue.dequeue_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record_id, "old");
        assert_eq!(pending[0].operation, OpKind::Delete);
        assert_eq!(pending[0].payload["remote_id"], "RemoteOld0001");
    }

    #[tokio::test]
    async fn local_only_duplicate_drops_its_queued_work() {
        let f = fixture();
        let older = f
            .local
            .insert("products", fields(json!({"sku": "B2", "name": "Bolt"})))
            .await
            .unwrap();
        f.queue
            .enqueue("products", &older, OpKind::Create, json!({}), DEFAULT_PRIORITY)
            .await
            .unwrap();
        f.local
            .insert("products", fields(json!({"sku": "B2", "name": "Bolt"})))
            .await
            .unwrap();

        let summary = f.reconciler.reconcile("products").await.unwrap();
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(summary.removed[0].id, older);
        assert!(f.queue.snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn orphan_stock_row_is_removed() {
        let f = fixture();
        let product = f.local.insert("products", fields(json!({"name": "W"}))).await.unwrap();
        let location = f.local.insert("locations", fields(json!({"name": "Shop"}))).await.unwrap();
        f.local
            .insert(
                "stock",
                fields(json!({"product_id": product, "location_id": location, "quantity": 1})),
            )
            .await
            .unwrap();
        f.local
            .insert(
                "stock",
                fields(json!({"product_id": "id-deleted", "location_id": location, "quantity": 2})),
            )
            .await
            .unwrap();

        let summary = f.reconciler.reconcile("stock").await.unwrap();
        assert_eq!(summary.duplicates_removed, 0);
        assert_eq!(summary.orphans_removed, 1);
        assert_eq!(summary.removed[0].reason, RemovalReason::Orphan);
        assert_eq!(f.local.count("stock").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicates_only_pass_keeps_orphans() {
        let f = fixture();
        let location = f.local.insert("locations", fields(json!({"name": "Shop"}))).await.unwrap();
        for quantity in [1, 2] {
            f.local
                .put_raw(
                    "stock",
                    record(json!({
                        "id": format!("RemoteStock000{quantity}"),
                        "remote_id": format!("RemoteStock000{quantity}"),
                        "product_id": "RemoteProd0001", "location_id": location,
                        "quantity": quantity, "sync_status": "synced",
                        "updated_at": format!("2024-0{quantity}-01T00:00:00Z"),
                    })),
                )
                .await
                .unwrap();
        }

        let summary = f.reconciler.reconcile_duplicates("stock").await.unwrap();
        assert_eq!(summary.orphans_removed, 0);
        assert_eq!(summary.duplicates_removed, 1);
        assert_eq!(f.local.count("stock").await.unwrap(), 1);
        let queued = f.queue.dequeue_pending().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].record_id, "RemoteStock0001");
    }

    #[tokio::test]
    async fn second_run_removes_nothing() {
        let f = fixture();
        for name in ["Widget", "widget", "WIDGET", "Gadget"] {
            f.local.insert("products", fields(json!({"name": name}))).await.unwrap();
        }

        let first = f.reconciler.reconcile("products").await.unwrap();
        assert_eq!(first.total_removed(), 2);

        let second = f.reconciler.reconcile("products").await.unwrap();
        assert_eq!(second.total_removed(), 0);
        assert_eq!(second.groups_found, 0);
    }

    #[tokio::test]
    async fn reconcile_all_covers_every_collection() {
        let f = fixture();
        let summaries = f.reconciler.reconcile_all().await.unwrap();
        let names: Vec<_> = summaries.iter().map(|s| s.collection.as_str()).collect();
        assert_eq!(
            names,
            vec!["categories", "locations", "products", "stock", "inventory", "sales", "sale_items"]
        );
    }

    #[tokio::test]
    async fn unknown_collection_is_an_error() {
        let f = fixture();
        let err = f.reconciler.reconcile("unicorns").await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Engine(stockroom_engine::Error::UnknownCollection(_))
        ));
    }
}
