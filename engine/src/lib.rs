//! # Stockroom Engine
//!
//! The deterministic core of Stockroom's offline-first synchronization.
//!
//! The engine owns the data model and every decision the sync layer makes:
//! what a record looks like, how local ids are minted and told apart from
//! remote ids, in which order queued mutations replay, and which records a
//! duplicate/orphan pass removes. It performs no IO; callers pass in the
//! current time and a random source, and persist whatever it hands back.
//!
//! ## Design Principles
//!
//! - **No IO**: storage, network and clocks belong to the agent
//! - **Deterministic**: the same inputs always produce the same decisions
//! - **Testable**: pure functions and plain data
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! A [`Record`] is a free-form JSON object plus [`RecordMeta`]: id, optional
//! remote id, [`SyncStatus`], optional owner and timestamps. Typed views
//! ([`Product`], [`StockItem`], ...) embed the same metadata via [`Typed`].
//!
//! ### Collections
//!
//! A [`Catalog`] lists the collections with their business keys (SKU,
//! barcode, name) and foreign keys (e.g. `stock.product_id -> products`).
//!
//! ### Pending operations
//!
//! [`PendingQueue`] holds mutations the remote store has not confirmed yet,
//! with priority ordering, per-record replay order, delete supersession and
//! retry bookkeeping under a [`RetryPolicy`].
//!
//! ### Reconciliation
//!
//! [`reconcile::plan`] groups records by business key, keeps the most
//! recently updated one per key, and flags records whose parent is gone.
//!
//! ## Quick Start
//!
//! ```rust
//! use stockroom_engine::{reconcile, Catalog, ParentIndex, Record, RemovalReason};
//! use serde_json::json;
//!
//! let catalog = Catalog::inventory();
//! let products = vec![
//!     Record::from_value(json!({"id": "a", "sku": "A1", "updated_at": "2024-01-01T00:00:00Z"})).unwrap(),
//!     Record::from_value(json!({"id": "b", "sku": "A1", "updated_at": "2024-02-01T00:00:00Z"})).unwrap(),
//! ];
//!
//! let spec = catalog.require("products").unwrap();
//! let plan = reconcile::plan(spec, &products, &ParentIndex::new());
//!
//! assert_eq!(plan.removals.len(), 1);
//! assert_eq!(plan.removals[0].id, "a");
//! assert_eq!(plan.removals[0].reason, RemovalReason::Duplicate);
//! ```

pub mod catalog;
pub mod entity;
pub mod error;
pub mod id;
pub mod queue;
pub mod reconcile;
pub mod record;

// Re-export main types at crate root
pub use catalog::{BusinessKey, Catalog, CollectionSpec, ForeignKey};
pub use entity::{
    Category, Entity, InventoryPosition, Location, Product, Sale, SaleLineItem, StockItem, Typed,
};
pub use error::Error;
pub use id::{is_local_shaped, is_remote_shaped, IdGenerator};
pub use queue::{
    FailureOutcome, OpKind, OpStatus, PendingOp, PendingQueue, RetryPolicy, DEFAULT_PRIORITY,
    SUPERSEDED,
};
pub use reconcile::{ParentIndex, ReconcilePlan, ReconcileSummary, Removal, RemovalReason};
pub use record::{Record, RecordMeta, SyncStatus};

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type OwnerId = String;
pub type OperationId = String;
pub type Timestamp = chrono::DateTime<chrono::Utc>;
