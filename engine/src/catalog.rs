//! Collection declarations.
//!
//! Collections have no enforced schema. What the sync layer needs to know
//! about one is how to recognise two records as the same real-world thing
//! (business keys), which parents its records point at (foreign keys) and
//! whether it is mirrored to the remote store.

use crate::entity::{Category, Entity, InventoryPosition, Location, Product, Sale, SaleLineItem, StockItem};
use crate::{error::Result, CollectionName, Error, Record};
use serde::{Deserialize, Serialize};

/// Field name used for name-based de-duplication.
pub const NAME_FIELD: &str = "name";

/// One identity rule. All fields must be present for the key to apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusinessKey {
    pub fields: Vec<String>,
    /// Compare lowercased values
    pub case_insensitive: bool,
}

impl BusinessKey {
    /// Single field, compared exactly (after trimming).
    pub fn exact(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
            case_insensitive: false,
        }
    }

    /// Single field, compared case-insensitively.
    pub fn folded(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
            case_insensitive: true,
        }
    }

    /// Several fields that together identify a record.
    pub fn composite<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            case_insensitive: false,
        }
    }

    /// Human-readable key name, e.g. `sku` or `product_id+location_id`.
    pub fn label(&self) -> String {
        self.fields.join("+")
    }

    /// Normalized key value for `record`, or `None` if any field is empty.
    pub fn value_of(&self, record: &Record) -> Option<String> {
        let mut parts = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let text = record.text(field)?;
            parts.push(if self.case_insensitive {
                text.to_lowercase()
            } else {
                text
            });
        }
        Some(parts.join("\u{1f}"))
    }
}

/// A reference from a field to records of another collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub field: String,
    pub parent: CollectionName,
}

impl ForeignKey {
    pub fn new(field: impl Into<String>, parent: impl Into<CollectionName>) -> Self {
        Self {
            field: field.into(),
            parent: parent.into(),
        }
    }
}

/// Rules for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSpec {
    pub name: CollectionName,
    /// Identity rules in priority order; a record is grouped by the first
    /// rule it has a value for.
    pub business_keys: Vec<BusinessKey>,
    pub foreign_keys: Vec<ForeignKey>,
    /// Mirrored to the remote store
    pub remote_sync: bool,
}

impl CollectionSpec {
    /// A remotely synced collection with no identity or reference rules.
    pub fn new(name: impl Into<CollectionName>) -> Self {
        Self {
            name: name.into(),
            business_keys: Vec::new(),
            foreign_keys: Vec::new(),
            remote_sync: true,
        }
    }

    pub fn with_key(mut self, key: BusinessKey) -> Self {
        self.business_keys.push(key);
        self
    }

    /// Opt in to case-insensitive name matching as the lowest-priority key.
    ///
    /// Two distinct items can share a display name, so this is lossy.
    pub fn with_name_dedup(self) -> Self {
        self.with_key(BusinessKey::folded(NAME_FIELD))
    }

    pub fn with_foreign_key(mut self, fk: ForeignKey) -> Self {
        self.foreign_keys.push(fk);
        self
    }

    /// Keep the collection local-only.
    pub fn local_only(mut self) -> Self {
        self.remote_sync = false;
        self
    }

    pub fn dedupes_by_name(&self) -> bool {
        self.business_keys
            .iter()
            .any(|k| k.case_insensitive && k.fields.len() == 1 && k.fields[0] == NAME_FIELD)
    }

    /// The first business key `record` has a value for, with that value.
    pub fn identity_of<'a>(&'a self, record: &Record) -> Option<(&'a BusinessKey, String)> {
        self.business_keys
            .iter()
            .find_map(|key| key.value_of(record).map(|value| (key, value)))
    }

    /// Names of the parent collections, without duplicates.
    pub fn parents(&self) -> Vec<&str> {
        let mut parents: Vec<&str> = Vec::new();
        for fk in &self.foreign_keys {
            if !parents.contains(&fk.parent.as_str()) {
                parents.push(fk.parent.as_str());
            }
        }
        parents
    }
}

/// The set of known collections, ordered parents before dependents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    collections: Vec<CollectionSpec>,
}

impl Catalog {
    /// Build a catalog. Collections must be listed parents first.
    pub fn new(collections: Vec<CollectionSpec>) -> Self {
        Self { collections }
    }

    /// The inventory / point-of-sale collections.
    pub fn inventory() -> Self {
        Self::new(vec![
            Category::spec(),
            Location::spec(),
            Product::spec(),
            StockItem::spec(),
            InventoryPosition::spec(),
            Sale::spec(),
            SaleLineItem::spec(),
        ])
    }

    pub fn get(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Like [`Catalog::get`] but an unknown name is an error.
    pub fn require(&self, name: &str) -> Result<&CollectionSpec> {
        self.get(name)
            .ok_or_else(|| Error::UnknownCollection(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter()
    }

    /// Collections mirrored to the remote store.
    pub fn synced(&self) -> impl Iterator<Item = &CollectionSpec> {
        self.collections.iter().filter(|c| c.remote_sync)
    }

    /// Parent collection referenced by `field` of `collection`, if any.
    pub fn parent_of(&self, collection: &str, field: &str) -> Option<&str> {
        self.get(collection)?
            .foreign_keys
            .iter()
            .find(|fk| fk.field == field)
            .map(|fk| fk.parent.as_str())
    }
}

impl Default for Catalog {
    fn default() -> Self {
        Self::inventory()
    }
}
