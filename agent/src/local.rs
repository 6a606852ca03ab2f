//! Local store: durable named collections with a short-lived read cache.
//!
//! Each collection is persisted as one JSON array under its own storage key.
//! Mutations read the collection fresh from storage, apply the change,
//! persist, and drop the collection's cache entry before returning, so the
//! next read always reflects the write. Every mutation also bumps the
//! collection's generation; a read that loaded across a bump does not
//! cache what it loaded.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde_json::{Map, Value};
use stockroom_engine::{Entity, IdGenerator, Record, RecordId, RecordMeta, Typed};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::storage::SharedStorage;

type Result<T> = std::result::Result<T, StoreError>;

/// Storage key prefix for collections.
const COLLECTION_PREFIX: &str = "collection:";

struct CacheEntry {
    records: Vec<Record>,
    loaded_at: Instant,
}

#[derive(Default)]
struct CacheSlot {
    generation: u64,
    entry: Option<CacheEntry>,
}

impl CacheSlot {
    fn invalidate(&mut self) {
        self.generation += 1;
        self.entry = None;
    }
}

/// Durable collections of records.
pub struct LocalStore {
    storage: SharedStorage,
    cache: DashMap<String, CacheSlot>,
    /// Serializes read-modify-write cycles; also owns the id generator
    writes: Mutex<IdGenerator>,
    cache_ttl: Duration,
}

impl LocalStore {
    pub fn new(storage: SharedStorage, cache_ttl: Duration) -> Self {
        Self {
            storage,
            cache: DashMap::new(),
            writes: Mutex::new(IdGenerator::new()),
            cache_ttl,
        }
    }

    fn key(collection: &str) -> String {
        format!("{COLLECTION_PREFIX}{collection}")
    }

    async fn load(&self, collection: &str) -> Result<Vec<Record>> {
        match self.storage.get(&Self::key(collection)).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, collection: &str, records: &[Record]) -> Result<()> {
        let raw = serde_json::to_string(records)?;
        self.storage.set(&Self::key(collection), raw).await?;
        self.cache
            .entry(collection.to_string())
            .or_default()
            .invalidate();
        Ok(())
    }

    /// Run `f` over the collection's current records while holding the
    /// write lock. The records are persisted when `f` reports a change.
    pub async fn modify<T, F>(&self, collection: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Vec<Record>) -> (T, bool),
    {
        let _guard = self.writes.lock().await;
        let mut records = self.load(collection).await?;
        let (out, changed) = f(&mut records);
        if changed {
            self.persist(collection, &records).await?;
        }
        Ok(out)
    }

    /// Append a new record and return its generated id.
    ///
    /// Metadata keys in `data` (`owner_id`, `sync_status`, `remote_id`) set
    /// the record's metadata; `sync_status` defaults to pending.
    pub async fn insert(&self, collection: &str, data: Map<String, Value>) -> Result<RecordId> {
        let mut ids = self.writes.lock().await;
        let mut records = self.load(collection).await?;

        let now = Utc::now();
        let id = ids.generate_at(now.timestamp_millis().max(0) as u64, &mut rand::thread_rng());
        let mut record = Record::new(RecordMeta::new_local(id.clone(), now), Map::new());
        record.apply_patch(data, now)?;

        records.push(record);
        self.persist(collection, &records).await?;

        tracing::debug!(collection = %collection, id = %id, "Inserted record");
        Ok(id)
    }

    /// Merge `patch` into an existing record and return the result.
    pub async fn update(
        &self,
        collection: &str,
        id: &str,
        patch: Map<String, Value>,
    ) -> Result<Record> {
        let _guard = self.writes.lock().await;
        let mut records = self.load(collection).await?;

        let record = records
            .iter_mut()
            .find(|r| r.id() == id)
            .ok_or_else(|| StoreError::not_found(collection, id))?;
        record.apply_patch(patch, Utc::now())?;
        let updated = record.clone();

        self.persist(collection, &records).await?;
        Ok(updated)
    }

    /// Remove a record. Missing ids are not an error; returns whether
    /// anything was removed.
    pub async fn delete(&self, collection: &str, id: &str) -> Result<bool> {
        Ok(self.remove_many(collection, &[id.to_string()]).await? > 0)
    }

    /// Remove every record whose id is in `ids`. Returns how many were removed.
    pub async fn remove_many(&self, collection: &str, ids: &[RecordId]) -> Result<usize> {
        let _guard = self.writes.lock().await;
        let mut records = self.load(collection).await?;

        let before = records.len();
        records.retain(|r| !ids.iter().any(|id| id == r.id()));
        let removed = before - records.len();

        if removed > 0 {
            self.persist(collection, &records).await?;
        }
        Ok(removed)
    }

    /// Insert or replace records by id, keeping their ids and timestamps.
    ///
    /// Used for data that already has an identity, such as pulled remote
    /// documents.
    pub async fn put_raw_many(&self, collection: &str, incoming: Vec<Record>) -> Result<()> {
        if incoming.is_empty() {
            return Ok(());
        }
        let _guard = self.writes.lock().await;
        let mut records = self.load(collection).await?;

        for record in incoming {
            match records.iter_mut().find(|r| r.id() == record.id()) {
                Some(existing) => *existing = record,
                None => records.push(record),
            }
        }

        self.persist(collection, &records).await
    }

    pub async fn put_raw(&self, collection: &str, record: Record) -> Result<()> {
        self.put_raw_many(collection, vec![record]).await
    }

    pub async fn get_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        Ok(self
            .get_all(collection)
            .await?
            .into_iter()
            .find(|r| r.id() == id))
    }

    /// All records of a collection, from cache when fresh.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let generation = {
            let slot = self.cache.entry(collection.to_string()).or_default();
            if let Some(entry) = &slot.entry {
                if entry.loaded_at.elapsed() < self.cache_ttl {
                    return Ok(entry.records.clone());
                }
            }
            slot.generation
        };

        let records = self.load(collection).await?;
        let mut slot = self.cache.entry(collection.to_string()).or_default();
        if slot.generation == generation {
            slot.entry = Some(CacheEntry {
                records: records.clone(),
                loaded_at: Instant::now(),
            });
        }
        Ok(records)
    }

    /// Records visible to `owner_id`, including legacy records without an owner.
    pub async fn get_all_by_owner(&self, collection: &str, owner_id: &str) -> Result<Vec<Record>> {
        Ok(self
            .get_all(collection)
            .await?
            .into_iter()
            .filter(|r| r.meta.is_visible_to(owner_id))
            .collect())
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.get_all(collection).await?.len())
    }

    /// Drop one collection's cache entry, or all of them.
    pub fn invalidate_cache(&self, collection: Option<&str>) {
        match collection {
            Some(name) => self.cache.entry(name.to_string()).or_default().invalidate(),
            None => self
                .cache
                .iter_mut()
                .for_each(|mut slot| slot.invalidate()),
        }
    }

    /// Insert a typed entity for `owner_id`.
    pub async fn insert_entity<T: Entity>(&self, owner_id: Option<&str>, entity: &T) -> Result<RecordId> {
        let mut data = match serde_json::to_value(entity)? {
            Value::Object(map) => map,
            _ => {
                return Err(stockroom_engine::Error::InvalidRecord(format!(
                    "{} must be an object",
                    T::COLLECTION
                ))
                .into())
            }
        };
        if let Some(owner) = owner_id {
            data.insert("owner_id".into(), Value::String(owner.to_string()));
        }
        self.insert(T::COLLECTION, data).await
    }

    pub async fn get_entity<T: Entity>(&self, id: &str) -> Result<Option<Typed<T>>> {
        match self.get_by_id(T::COLLECTION, id).await? {
            Some(record) => Ok(Some(Typed::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Typed view of the records visible to `owner_id`.
    pub async fn list_entities<T: Entity>(&self, owner_id: &str) -> Result<Vec<Typed<T>>> {
        self.get_all_by_owner(T::COLLECTION, owner_id)
            .await?
            .iter()
            .map(|r| Typed::from_record(r).map_err(StoreError::from))
            .collect()
    }
}
