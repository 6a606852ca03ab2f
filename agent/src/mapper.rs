//! Correlation between local and remote identifiers.
//!
//! A read-only view over the local store: the link between the two ids is
//! the `remote_id` kept on each local record.

use std::sync::Arc;

use serde_json::{Map, Value};
use stockroom_engine::{is_local_shaped, is_remote_shaped, Catalog, CollectionName, Record, RecordId};

use crate::error::StoreError;
use crate::local::LocalStore;

type Result<T> = std::result::Result<T, StoreError>;

pub struct IdMapper {
    local: Arc<LocalStore>,
    catalog: Arc<Catalog>,
}

impl IdMapper {
    pub fn new(local: Arc<LocalStore>, catalog: Arc<Catalog>) -> Self {
        Self { local, catalog }
    }

    /// Remote id of the record `id` names in `collection`.
    pub async fn resolve_remote_id(&self, collection: &str, id: &str) -> Result<Option<RecordId>> {
        let records = self.local.get_all(collection).await?;
        Ok(remote_id_in(&records, id))
    }

    /// Local id of the record whose remote id is `remote_id`.
    pub async fn resolve_local_id(&self, collection: &str, remote_id: &str) -> Result<Option<RecordId>> {
        let records = self.local.get_all(collection).await?;
        Ok(local_id_in(&records, remote_id))
    }

    /// Collection and record answering to `id` (local or remote), searching
    /// every catalog collection.
    pub async fn locate(&self, id: &str) -> Result<Option<(CollectionName, Record)>> {
        for spec in self.catalog.iter() {
            let records = self.local.get_all(&spec.name).await?;
            if let Some(record) = records.into_iter().find(|r| r.meta.answers_to(id)) {
                return Ok(Some((spec.name.clone(), record)));
            }
        }
        Ok(None)
    }

    /// [`IdMapper::resolve_remote_id`] without knowing the collection.
    pub async fn find_remote_id(&self, id: &str) -> Result<Option<RecordId>> {
        Ok(self
            .locate(id)
            .await?
            .and_then(|(_, record)| record.meta.remote_id))
    }

    /// Swap foreign key values that name local parents for the parents'
    /// remote ids, where known. Returns how many values were replaced.
    pub async fn translate_references(
        &self,
        collection: &str,
        fields: &mut Map<String, Value>,
    ) -> Result<usize> {
        let Some(spec) = self.catalog.get(collection) else {
            return Ok(0);
        };

        let mut replaced = 0;
        for fk in &spec.foreign_keys {
            let Some(Value::String(value)) = fields.get(&fk.field) else {
                continue;
            };
            if is_remote_shaped(value) {
                continue;
            }
            if let Some(remote) = self.resolve_remote_id(&fk.parent, value).await? {
                if remote != *value {
                    tracing::debug!(
                        collection = %collection,
                        field = %fk.field,
                        local = %value,
                        remote = %remote,
                        "Translated reference"
                    );
                    fields.insert(fk.field.clone(), Value::String(remote));
                    replaced += 1;
                }
            }
        }
        Ok(replaced)
    }
}

fn remote_id_in(records: &[Record], id: &str) -> Option<RecordId> {
    if is_remote_shaped(id) && records.iter().any(|r| r.remote_id() == Some(id)) {
        return Some(id.to_string());
    }
    records
        .iter()
        .find(|r| r.id() == id)
        .and_then(|r| r.meta.remote_id.clone())
}

fn local_id_in(records: &[Record], remote_id: &str) -> Option<RecordId> {
    if is_local_shaped(remote_id) && records.iter().any(|r| r.id() == remote_id) {
        return Some(remote_id.to_string());
    }
    records
        .iter()
        .find(|r| r.remote_id() == Some(remote_id))
        .map(|r| r.meta.id.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;
    use std::time::Duration;

    fn fields(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    async fn setup() -> (IdMapper, Arc<LocalStore>) {
        let local = Arc::new(LocalStore::new(
            Arc::new(MemoryStorage::new()),
            Duration::from_secs(5),
        ));
        let mapper = IdMapper::new(local.clone(), Arc::new(Catalog::inventory()));
        (mapper, local)
    }

    #[tokio::test]
    async fn resolves_both_ways() {
        let (mapper, local) = setup().await;
        let id = local
            .insert("products", fields(json!({"name": "W", "remote_id": "Xk2aPq9LmN0bR7sT"})))
            .await
            .unwrap();
        let unsynced = local.insert("products", fields(json!({"name": "V"}))).await.unwrap();

        assert_eq!(
            mapper.resolve_remote_id("products", &id).await.unwrap().as_deref(),
            Some("Xk2aPq9LmN0bR7sT")
        );
        assert_eq!(
            mapper.resolve_remote_id("products", "Xk2aPq9LmN0bR7sT").await.unwrap().as_deref(),
            Some("Xk2aPq9LmN0bR7sT")
        );
        assert_eq!(mapper.resolve_remote_id("products", &unsynced).await.unwrap(), None);

        assert_eq!(
            mapper.resolve_local_id("products", "Xk2aPq9LmN0bR7sT").await.unwrap(),
            Some(id.clone())
        );
        assert_eq!(mapper.resolve_local_id("products", &id).await.unwrap(), Some(id));
        assert_eq!(mapper.resolve_local_id("products", "Unknown00000X").await.unwrap(), None);
    }

    #[tokio::test]
    async fn locates_across_collections() {
        let (mapper, local) = setup().await;
        let id = local
            .insert("locations", fields(json!({"name": "Shop", "remote_id": "LocRemote00001"})))
            .await
            .unwrap();

        let (collection, record) = mapper.locate("LocRemote00001").await.unwrap().unwrap();
        assert_eq!(collection, "locations");
        assert_eq!(record.id(), id);
        assert_eq!(
            mapper.find_remote_id(&id).await.unwrap().as_deref(),
            Some("LocRemote00001")
        );
        assert!(mapper.locate("nothing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn translates_known_parent_references() {
        let (mapper, local) = setup().await;
        let product = local
            .insert("products", fields(json!({"name": "W", "remote_id": "ProdRemote0001"})))
            .await
            .unwrap();
        let location = local.insert("locations", fields(json!({"name": "Shop"}))).await.unwrap();

        let mut stock = fields(json!({
            "product_id": product,
            "location_id": location.clone(),
            "quantity": 3,
        }));
        let replaced = mapper.translate_references("stock", &mut stock).await.unwrap();

        assert_eq!(replaced, 1);
        assert_eq!(stock["product_id"], "ProdRemote0001");
        assert_eq!(stock["location_id"], json!(location));
    }
}
