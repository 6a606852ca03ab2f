//! SQLite-backed storage.

use async_trait::async_trait;
use chrono::Utc;

use super::{KeyValueStorage, Pool};
use crate::error::StoreError;

/// Key-value storage over the `kv_entries` table.
#[derive(Clone)]
pub struct SqliteStorage {
    pool: Pool,
}

impl SqliteStorage {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}

#[async_trait]
impl KeyValueStorage for SqliteStorage {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM kv_entries WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO kv_entries (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv_entries WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{create_pool, run_migrations};

    async fn storage() -> SqliteStorage {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteStorage::new(pool)
    }

    #[tokio::test]
    async fn set_get_overwrite_remove() {
        let storage = storage().await;
        assert_eq!(storage.get("a").await.unwrap(), None);

        storage.set("a", "1".into()).await.unwrap();
        storage.set("a", "2".into()).await.unwrap();
        assert_eq!(storage.get("a").await.unwrap().as_deref(), Some("2"));

        storage.remove("a").await.unwrap();
        assert_eq!(storage.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn removing_missing_key_is_ok() {
        let storage = storage().await;
        storage.remove("ghost").await.unwrap();
    }
}
