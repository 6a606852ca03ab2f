//! Remote store adapter.
//!
//! [`RemoteStore`] is the raw document backend (Firestore or in-memory).
//! [`RemoteAdapter`] wraps it with the rules every caller relies on: a hard
//! per-call deadline, the disabled/offline fast path, owner-scoped reads and
//! payload cleanup before writes.

mod firestore;
mod memory;

pub use firestore::*;
pub use memory::*;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use stockroom_engine::{Record, RecordId, RecordMeta, Timestamp};

use crate::auth::{Authenticator, User};
use crate::error::RemoteError;

type Result<T> = std::result::Result<T, RemoteError>;

/// Keys that only exist locally and are never written remotely.
pub const LOCAL_ONLY_FIELDS: [&str; 3] = ["id", "remote_id", "sync_status"];

/// Field every remote document is scoped by.
pub const OWNER_FIELD: &str = "owner_id";

/// A document as stored remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteDocument {
    /// Server-assigned identifier
    pub id: RecordId,
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub create_time: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<Timestamp>,
}

/// Document database backend.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Create a document and return it with its server-assigned id.
    async fn create(&self, collection: &str, fields: Map<String, Value>) -> Result<RemoteDocument>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<RemoteDocument>>;

    /// Overwrite the given fields of an existing document.
    async fn update(&self, collection: &str, id: &str, fields: Map<String, Value>) -> Result<()>;

    /// Delete a document. Deleting a missing document succeeds.
    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    /// Documents whose `field` equals `value`.
    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<RemoteDocument>>;
}

/// Shared backend handle.
pub type SharedRemoteStore = Arc<dyn RemoteStore>;

/// Guarded access to the remote store.
pub struct RemoteAdapter {
    /// `None` when the integration is disabled
    store: Option<SharedRemoteStore>,
    auth: Arc<dyn Authenticator>,
    offline: AtomicBool,
    timeout: Duration,
}

impl RemoteAdapter {
    pub fn new(store: SharedRemoteStore, auth: Arc<dyn Authenticator>, timeout: Duration) -> Self {
        Self {
            store: Some(store),
            auth,
            offline: AtomicBool::new(false),
            timeout,
        }
    }

    /// An adapter whose every call fails with `Unavailable`.
    pub fn disabled(auth: Arc<dyn Authenticator>) -> Self {
        Self {
            store: None,
            auth,
            offline: AtomicBool::new(false),
            timeout: Duration::ZERO,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// Switch the manual offline mode.
    pub fn set_offline(&self, offline: bool) {
        let was = self.offline.swap(offline, Ordering::SeqCst);
        if was != offline {
            tracing::info!(offline, "Remote offline mode changed");
        }
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    /// Whether calls would currently be attempted.
    pub fn is_available(&self) -> bool {
        self.session().is_ok()
    }

    fn session(&self) -> Result<(&SharedRemoteStore, User)> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| RemoteError::Unavailable("remote integration disabled".into()))?;
        if self.is_offline() {
            return Err(RemoteError::Unavailable("offline mode".into()));
        }
        let user = self
            .auth
            .current_user()
            .ok_or_else(|| RemoteError::Unavailable("not signed in".into()))?;
        Ok((store, user))
    }

    async fn deadline<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| RemoteError::Timeout(self.timeout))?
    }

    /// Create a document from local fields and return its remote id.
    pub async fn create(&self, collection: &str, fields: &Map<String, Value>) -> Result<RecordId> {
        let (store, user) = self.session()?;
        let data = scoped_fields(fields, &user);
        let doc = self.deadline(store.create(collection, data)).await?;
        tracing::debug!(collection = %collection, remote_id = %doc.id, "Created remote document");
        Ok(doc.id)
    }

    pub async fn update(
        &self,
        collection: &str,
        remote_id: &str,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        let (store, user) = self.session()?;
        let data = scoped_fields(fields, &user);
        self.deadline(store.update(collection, remote_id, data)).await
    }

    pub async fn delete(&self, collection: &str, remote_id: &str) -> Result<()> {
        let (store, _) = self.session()?;
        self.deadline(store.delete(collection, remote_id)).await
    }

    /// Fetch one document; documents of other owners read as absent.
    pub async fn get(&self, collection: &str, remote_id: &str) -> Result<Option<RemoteDocument>> {
        let (store, user) = self.session()?;
        let doc = self.deadline(store.get(collection, remote_id)).await?;
        Ok(doc.filter(|d| owned_by(d, &user.id)))
    }

    /// Every document of `owner_id` in a collection.
    pub async fn query_owned(&self, collection: &str, owner_id: &str) -> Result<Vec<RemoteDocument>> {
        if owner_id.is_empty() {
            return Err(RemoteError::Rejected(format!(
                "unscoped query on {collection} refused"
            )));
        }
        let (store, _) = self.session()?;
        let owner = Value::String(owner_id.to_string());
        self.deadline(store.query_by_field(collection, OWNER_FIELD, &owner))
            .await
    }

    /// Documents of `owner_id` whose `field` equals `value`.
    pub async fn query_by_field(
        &self,
        collection: &str,
        owner_id: &str,
        field: &str,
        value: &Value,
    ) -> Result<Vec<RemoteDocument>> {
        let docs = self.query_owned(collection, owner_id).await?;
        Ok(docs
            .into_iter()
            .filter(|d| d.fields.get(field) == Some(value))
            .collect())
    }
}

fn owned_by(doc: &RemoteDocument, owner_id: &str) -> bool {
    match doc.fields.get(OWNER_FIELD) {
        Some(Value::String(owner)) => owner == owner_id,
        _ => true,
    }
}

fn scoped_fields(fields: &Map<String, Value>, user: &User) -> Map<String, Value> {
    let mut data = prepare_fields(fields);
    data.entry(OWNER_FIELD)
        .or_insert_with(|| Value::String(user.id.clone()));
    data
}

/// Copy of `fields` fit for a remote write: local-only keys removed and
/// null values stripped at every depth.
pub fn prepare_fields(fields: &Map<String, Value>) -> Map<String, Value> {
    let mut data = strip_nulls(fields);
    for key in LOCAL_ONLY_FIELDS {
        data.remove(key);
    }
    data
}

fn strip_nulls(map: &Map<String, Value>) -> Map<String, Value> {
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.clone(), strip_value(v)))
        .collect()
}

fn strip_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(strip_nulls(map)),
        Value::Array(items) => Value::Array(items.iter().map(strip_value).collect()),
        other => other.clone(),
    }
}

/// All fields of a local record, metadata included, as a JSON object.
///
/// Pass the result through the adapter, which drops the local-only keys.
pub fn record_fields(record: &Record) -> Map<String, Value> {
    match record.to_value() {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

/// Local representation of a remote document.
///
/// The document id becomes both `id` and `remote_id`; timestamps come from
/// the document's own fields when present, else from the server times.
pub fn to_record(doc: RemoteDocument) -> Record {
    let created = timestamp_field(&doc.fields, "created_at")
        .or(doc.create_time)
        .unwrap_or_else(Utc::now);
    let updated = timestamp_field(&doc.fields, "updated_at")
        .or(doc.update_time)
        .unwrap_or(created);

    let mut meta = RecordMeta::new_remote(doc.id, created, updated);
    meta.owner_id = doc
        .fields
        .get(OWNER_FIELD)
        .and_then(Value::as_str)
        .map(str::to_string);
    Record::new(meta, doc.fields)
}

fn timestamp_field(fields: &Map<String, Value>, key: &str) -> Option<Timestamp> {
    let raw = fields.get(key)?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}
