//! Record types for storing data.
//!
//! A [`Record`] is a free-form JSON object plus the metadata every
//! collection shares ([`RecordMeta`]). Both serialize flat, so a stored
//! product looks like `{"id": "...", "sync_status": "pending", "sku": "A1", ...}`.

use crate::{error::Result, Error, OwnerId, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field names owned by [`RecordMeta`]; never stored in [`Record::fields`].
pub const META_FIELDS: [&str; 6] = [
    "id",
    "remote_id",
    "sync_status",
    "owner_id",
    "created_at",
    "updated_at",
];

/// Synchronization state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Confirmed by the remote store
    Synced,
    /// Local mutation not yet confirmed remotely
    #[default]
    Pending,
    /// Retries exhausted or rejected; needs manual attention
    Error,
}

impl SyncStatus {
    /// Parse the lowercase wire form.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "synced" => Some(SyncStatus::Synced),
            "pending" => Some(SyncStatus::Pending),
            "error" => Some(SyncStatus::Error),
            _ => None,
        }
    }
}

/// Metadata carried by every record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMeta {
    /// Unique identifier within the collection
    pub id: RecordId,
    /// Identifier assigned by the remote store, once confirmed there
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RecordId>,
    #[serde(default)]
    pub sync_status: SyncStatus,
    /// Tenant isolation key; legacy records have none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<OwnerId>,
    #[serde(default)]
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Timestamp,
}

impl RecordMeta {
    /// Metadata for a record created locally at `now`.
    pub fn new_local(id: impl Into<RecordId>, now: Timestamp) -> Self {
        Self {
            id: id.into(),
            remote_id: None,
            sync_status: SyncStatus::Pending,
            owner_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Metadata for a record received from the remote store.
    pub fn new_remote(
        remote_id: impl Into<RecordId>,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Self {
        let remote_id = remote_id.into();
        Self {
            id: remote_id.clone(),
            remote_id: Some(remote_id),
            sync_status: SyncStatus::Synced,
            owner_id: None,
            created_at,
            updated_at,
        }
    }

    /// Whether a reader scoped to `owner_id` may see this record.
    ///
    /// Records without an owner predate tenant isolation and stay visible.
    pub fn is_visible_to(&self, owner_id: &str) -> bool {
        match &self.owner_id {
            Some(owner) => owner == owner_id,
            None => true,
        }
    }

    /// Whether `id` names this record, locally or remotely.
    pub fn answers_to(&self, id: &str) -> bool {
        self.id == id || self.remote_id.as_deref() == Some(id)
    }
}

/// A data record in a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(flatten)]
    pub meta: RecordMeta,
    /// Everything that is not metadata
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// Create a new local record. Metadata keys in `fields` are dropped.
    pub fn new(meta: RecordMeta, mut fields: Map<String, Value>) -> Self {
        for key in META_FIELDS {
            fields.remove(key);
        }
        Self { meta, fields }
    }

    /// Parse a record from a JSON object.
    pub fn from_value(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(Error::InvalidRecord("record must be a JSON object".into()));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Serialize into a flat JSON object.
    pub fn to_value(&self) -> Value {
        let mut object = self.fields.clone();
        if let Ok(Value::Object(meta)) = serde_json::to_value(&self.meta) {
            object.extend(meta);
        }
        Value::Object(object)
    }

    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.meta.remote_id.as_deref()
    }

    /// Raw field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// A field as a trimmed, non-empty string. Numbers are rendered.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.fields.get(field)? {
            Value::String(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Merge a partial update into the record and refresh `updated_at`.
    ///
    /// `remote_id`, `sync_status` and `owner_id` in the patch update the
    /// metadata (`null` clears the optional ones); `id` and the timestamps
    /// are never taken from a patch.
    pub fn apply_patch(&mut self, patch: Map<String, Value>, now: Timestamp) -> Result<()> {
        for (key, value) in patch {
            match key.as_str() {
                "id" | "created_at" | "updated_at" => {}
                "remote_id" => self.meta.remote_id = optional_string(&key, value)?,
                "owner_id" => self.meta.owner_id = optional_string(&key, value)?,
                "sync_status" => {
                    let status = value
                        .as_str()
                        .and_then(SyncStatus::parse)
                        .ok_or_else(|| Error::InvalidRecord(format!("bad sync_status: {value}")))?;
                    self.meta.sync_status = status;
                }
                _ => {
                    self.fields.insert(key, value);
                }
            }
        }
        self.meta.updated_at = now;
        Ok(())
    }
}

fn optional_string(key: &str, value: Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        other => Err(Error::InvalidRecord(format!("{key} must be a string, got {other}"))),
    }
}
