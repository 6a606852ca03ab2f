//! Duplicate and orphan detection.
//!
//! Given the records of one collection and an index of the parent records
//! it may reference, [`plan`] decides which records to remove. Executing the
//! plan (deleting locally, scheduling remote deletes) is left to the caller.
//!
//! # Algorithm
//!
//! 1. Assign each record to a group by its owner and the first business key
//!    it has a value for (e.g. SKU, else barcode, else lowercased name).
//!    Records of different owners never collapse into one another.
//! 2. In every group with more than one member the record with the latest
//!    `updated_at` survives (ties: latest `created_at`, then greatest id);
//!    the rest are duplicates.
//! 3. Independently, every remaining record whose foreign key does not
//!    resolve to a parent (by parent `id` or `remote_id`) is an orphan.
//!
//! Applying a plan and planning again yields an empty plan.

use crate::catalog::CollectionSpec;
use crate::{CollectionName, Record, RecordId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Why a record is removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RemovalReason {
    /// Shares a business key with a more recent record
    Duplicate,
    /// References a parent that does not exist
    Orphan,
}

/// One record to remove.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Removal {
    pub id: RecordId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RecordId>,
    pub reason: RemovalReason,
    /// Business key label for duplicates, foreign key field for orphans
    pub key: String,
    /// Record kept in place of a duplicate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub survivor: Option<RecordId>,
}

/// Removal decisions for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcilePlan {
    pub collection: CollectionName,
    /// Business-key groups with more than one member
    pub groups_found: usize,
    pub removals: Vec<Removal>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty()
    }

    pub fn count(&self, reason: RemovalReason) -> usize {
        self.removals.iter().filter(|r| r.reason == reason).count()
    }

    /// Counts for reporting.
    pub fn summary(&self) -> ReconcileSummary {
        ReconcileSummary {
            collection: self.collection.clone(),
            groups_found: self.groups_found,
            duplicates_removed: self.count(RemovalReason::Duplicate),
            orphans_removed: self.count(RemovalReason::Orphan),
            removed: self.removals.clone(),
        }
    }
}

/// Outcome of reconciling one collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileSummary {
    pub collection: CollectionName,
    pub groups_found: usize,
    pub duplicates_removed: usize,
    pub orphans_removed: usize,
    pub removed: Vec<Removal>,
}

impl ReconcileSummary {
    pub fn total_removed(&self) -> usize {
        self.duplicates_removed + self.orphans_removed
    }
}

/// Identifiers of existing parent records, per collection.
#[derive(Debug, Clone, Default)]
pub struct ParentIndex {
    ids: HashMap<CollectionName, HashSet<String>>,
}

impl ParentIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index every local and remote id of `records` under `collection`.
    pub fn insert<'a>(&mut self, collection: &str, records: impl IntoIterator<Item = &'a Record>) {
        let ids = self.ids.entry(collection.to_string()).or_default();
        for record in records {
            ids.insert(record.meta.id.clone());
            if let Some(remote) = &record.meta.remote_id {
                ids.insert(remote.clone());
            }
        }
    }

    /// Whether `value` names a record of `collection`.
    pub fn resolves(&self, collection: &str, value: &str) -> bool {
        self.ids
            .get(collection)
            .is_some_and(|ids| ids.contains(value))
    }
}

/// Decide which records of `spec.name` to remove.
///
/// `parents` must contain every collection named by `spec`'s foreign keys;
/// a missing parent collection makes every reference to it an orphan.
pub fn plan(spec: &CollectionSpec, records: &[Record], parents: &ParentIndex) -> ReconcilePlan {
    let mut removals = Vec::new();
    let mut removed: HashSet<&str> = HashSet::new();
    let mut groups_found = 0;

    // BTreeMap keeps the output order independent of hashing.
    let mut groups: BTreeMap<(Option<&str>, usize, String), Vec<&Record>> = BTreeMap::new();
    for record in records {
        if let Some((rank, value)) = spec
            .business_keys
            .iter()
            .enumerate()
            .find_map(|(rank, key)| key.value_of(record).map(|v| (rank, v)))
        {
            let owner = record.meta.owner_id.as_deref();
            groups.entry((owner, rank, value)).or_default().push(record);
        }
    }

    for ((_, rank, _), mut members) in groups {
        if members.len() < 2 {
            continue;
        }
        groups_found += 1;
        members.sort_by(|a, b| {
            b.meta
                .updated_at
                .cmp(&a.meta.updated_at)
                .then(b.meta.created_at.cmp(&a.meta.created_at))
                .then(b.meta.id.cmp(&a.meta.id))
        });
        let survivor = members[0].meta.id.clone();
        let label = spec.business_keys[rank].label();
        for duplicate in &members[1..] {
            removed.insert(duplicate.meta.id.as_str());
            removals.push(Removal {
                id: duplicate.meta.id.clone(),
                remote_id: duplicate.meta.remote_id.clone(),
                reason: RemovalReason::Duplicate,
                key: label.clone(),
                survivor: Some(survivor.clone()),
            });
        }
    }

    for record in records {
        if removed.contains(record.meta.id.as_str()) {
            continue;
        }
        let dangling = spec.foreign_keys.iter().find(|fk| {
            record
                .text(&fk.field)
                .map_or(true, |value| !parents.resolves(&fk.parent, &value))
        });
        if let Some(fk) = dangling {
            removed.insert(record.meta.id.as_str());
            removals.push(Removal {
                id: record.meta.id.clone(),
                remote_id: record.meta.remote_id.clone(),
                reason: RemovalReason::Orphan,
                key: fk.field.clone(),
                survivor: None,
            });
        }
    }

    ReconcilePlan {
        collection: spec.name.clone(),
        groups_found,
        removals,
    }
}
