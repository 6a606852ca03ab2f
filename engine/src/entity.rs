//! Typed views over the inventory collections.
//!
//! Storage and sync work on the generic [`Record`]; application code reads
//! and writes through these structs. Each entity embeds the common metadata
//! through [`Typed`], and declares its collection rules via [`Entity::spec`].

use crate::catalog::{BusinessKey, CollectionSpec, ForeignKey};
use crate::{error::Result, Error, Record, RecordMeta};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

/// A payload type stored in a named collection.
pub trait Entity: Serialize + DeserializeOwned {
    /// Collection the entity lives in.
    const COLLECTION: &'static str;

    /// Identity and referential rules for the collection.
    fn spec() -> CollectionSpec;
}

/// An entity together with its record metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Typed<T> {
    #[serde(flatten)]
    pub meta: RecordMeta,
    #[serde(flatten)]
    pub data: T,
}

impl<T: Entity> Typed<T> {
    /// Decode a generic record. Fields the entity does not know are ignored.
    pub fn from_record(record: &Record) -> Result<Self> {
        serde_json::from_value(record.to_value())
            .map_err(|e| Error::InvalidRecord(format!("{}: {e}", T::COLLECTION)))
    }

    /// Convert back into a generic record.
    pub fn into_record(self) -> Result<Record> {
        let fields = match serde_json::to_value(&self.data)? {
            Value::Object(map) => map,
            _ => return Err(Error::InvalidRecord(format!("{} must be an object", T::COLLECTION))),
        };
        Ok(Record::new(self.meta, fields))
    }
}

type Check = fn(&Map<String, Value>) -> Result<()>;

fn check<T: Entity>(fields: &Map<String, Value>) -> Result<()> {
    serde_json::from_value::<T>(Value::Object(fields.clone()))
        .map(|_| ())
        .map_err(|e| Error::InvalidRecord(format!("{}: {e}", T::COLLECTION)))
}

const CHECKS: [(&str, Check); 7] = [
    (Product::COLLECTION, check::<Product>),
    (Category::COLLECTION, check::<Category>),
    (Location::COLLECTION, check::<Location>),
    (StockItem::COLLECTION, check::<StockItem>),
    (InventoryPosition::COLLECTION, check::<InventoryPosition>),
    (Sale::COLLECTION, check::<Sale>),
    (SaleLineItem::COLLECTION, check::<SaleLineItem>),
];

/// Check that `fields` decode as the entity stored in `collection`.
///
/// Collections without a typed entity accept anything.
pub fn validate(collection: &str, fields: &Map<String, Value>) -> Result<()> {
    match CHECKS.iter().find(|(name, _)| *name == collection) {
        Some((_, check)) => check(fields),
        None => Ok(()),
    }
}

/// Something for sale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sku: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub barcode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Entity for Product {
    const COLLECTION: &'static str = "products";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
            .with_key(BusinessKey::exact("sku"))
            .with_key(BusinessKey::exact("barcode"))
            .with_name_dedup()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Entity for Category {
    const COLLECTION: &'static str = "categories";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION).with_name_dedup()
    }
}

/// A shop, warehouse or shelf.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

impl Entity for Location {
    const COLLECTION: &'static str = "locations";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
    }
}

/// Quantity of a product held at a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StockItem {
    pub product_id: String,
    pub location_id: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_quantity: Option<f64>,
}

impl Entity for StockItem {
    const COLLECTION: &'static str = "stock";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
            .with_key(BusinessKey::composite(["product_id", "location_id"]))
            .with_foreign_key(ForeignKey::new("product_id", Product::COLLECTION))
            .with_foreign_key(ForeignKey::new("location_id", Location::COLLECTION))
    }
}

/// A counted inventory position (stock take).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryPosition {
    pub product_id: String,
    pub location_id: String,
    #[serde(default)]
    pub counted_quantity: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Entity for InventoryPosition {
    const COLLECTION: &'static str = "inventory";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
            .with_key(BusinessKey::composite(["product_id", "location_id"]))
            .with_foreign_key(ForeignKey::new("product_id", Product::COLLECTION))
            .with_foreign_key(ForeignKey::new("location_id", Location::COLLECTION))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    #[serde(default)]
    pub total: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
}

impl Entity for Sale {
    const COLLECTION: &'static str = "sales";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleLineItem {
    pub sale_id: String,
    pub product_id: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub unit_price: f64,
}

impl Entity for SaleLineItem {
    const COLLECTION: &'static str = "sale_items";

    fn spec() -> CollectionSpec {
        CollectionSpec::new(Self::COLLECTION)
            .with_foreign_key(ForeignKey::new("sale_id", Sale::COLLECTION))
    }
}
