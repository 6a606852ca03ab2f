//! Durable key-value storage for collections and the pending queue.

mod memory;
mod pool;
mod sqlite;

pub use memory::*;
pub use pool::*;
pub use sqlite::*;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StoreError;

/// Storage URL selecting the in-memory backend.
pub const MEMORY_URL: &str = "memory";

/// String values addressed by string keys.
#[async_trait]
pub trait KeyValueStorage: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// Shared storage handle.
pub type SharedStorage = Arc<dyn KeyValueStorage>;

/// Open the backend named by `url`: `memory` or a SQLite URL.
pub async fn open(url: &str) -> Result<SharedStorage, StoreError> {
    if url == MEMORY_URL {
        return Ok(Arc::new(MemoryStorage::new()));
    }

    let pool = create_pool(url).await?;
    tracing::info!("Running storage migrations...");
    run_migrations(&pool).await?;
    Ok(Arc::new(SqliteStorage::new(pool)))
}
