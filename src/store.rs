use std::collections::VecDeque;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::request::QueuedRequest;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted record {id}: {reason}")]
    Corrupted { id: String, reason: String },
}

/// Durable store for pending requests. One collection, FIFO by enqueue
/// timestamp. Owned exclusively by the queue; nothing else writes here.
#[async_trait::async_trait]
pub trait RequestStore<B>: Send + Sync {
    /// Insert a new record or overwrite an existing one by id (used to
    /// persist an incremented `retry_count` between drain passes).
    async fn save(&self, request: &QueuedRequest<B>) -> Result<(), StoreError>;

    /// All pending records in enqueue order.
    async fn load_all(&self) -> Result<Vec<QueuedRequest<B>>, StoreError>;

    async fn remove(&self, id: &str) -> Result<(), StoreError>;

    async fn clear(&self) -> Result<(), StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;
}

/// SQLite-backed request store.
pub struct SqliteRequestStore {
    pool: sqlx::SqlitePool,
}

impl SqliteRequestStore {
    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS requests (
                id          TEXT PRIMARY KEY,
                data        TEXT NOT NULL,
                timestamp   INTEGER NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_requests_timestamp ON requests(timestamp);
            CREATE INDEX IF NOT EXISTS idx_requests_retry_count ON requests(retry_count);
            "#,
        )
        .execute(&pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(Self { pool })
    }

    pub async fn new_in_memory() -> Result<Self, StoreError> {
        Self::new("sqlite::memory:").await
    }
}

#[async_trait::async_trait]
impl<B> RequestStore<B> for SqliteRequestStore
where
    B: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn save(&self, request: &QueuedRequest<B>) -> Result<(), StoreError> {
        let data =
            serde_json::to_string(request).map_err(|e| StoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO requests (id, data, timestamp, retry_count)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                retry_count = excluded.retry_count
            "#,
        )
        .bind(&request.id)
        .bind(&data)
        .bind(request.timestamp.0 as i64)
        .bind(request.retry_count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueuedRequest<B>>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT id, data FROM requests ORDER BY timestamp ASC, rowid ASC")
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Storage(e.to_string()))?;

        rows.into_iter()
            .map(|(id, data)| {
                serde_json::from_str(&data).map_err(|e| StoreError::Corrupted {
                    id,
                    reason: e.to_string(),
                })
            })
            .collect()
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM requests WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM requests")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM requests")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Storage(e.to_string()))?;
        Ok(count as usize)
    }
}

/// In-memory request store for tests and non-persistent deployments.
pub struct MemoryRequestStore<B> {
    records: RwLock<VecDeque<QueuedRequest<B>>>,
}

impl<B> MemoryRequestStore<B> {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
        }
    }
}

impl<B> Default for MemoryRequestStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl<B> RequestStore<B> for MemoryRequestStore<B>
where
    B: Clone + Send + Sync + 'static,
{
    async fn save(&self, request: &QueuedRequest<B>) -> Result<(), StoreError> {
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter_mut().find(|r| r.id == request.id) {
            *existing = request.clone();
        } else {
            records.push_back(request.clone());
        }
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<QueuedRequest<B>>, StoreError> {
        Ok(self.records.read().await.iter().cloned().collect())
    }

    async fn remove(&self, id: &str) -> Result<(), StoreError> {
        self.records.write().await.retain(|r| r.id != id);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StoreError> {
        self.records.write().await.clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.records.read().await.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Method;
    use crate::time::UnixTimeMs;
    use serde_json::json;

    fn sample(url: &str, ts: u64) -> QueuedRequest {
        QueuedRequest::new(
            Method::Post,
            url,
            Some(json!({"lp_id": "LP-0001", "qty": 10})),
            None,
            UnixTimeMs(ts),
            3,
        )
    }

    #[tokio::test]
    async fn sqlite_roundtrip_preserves_fifo_order() {
        let store = SqliteRequestStore::new_in_memory().await.unwrap();

        let first = sample("https://erp.local/api/stage/1", 100);
        let second = sample("https://erp.local/api/stage/2", 200);
        let third = sample("https://erp.local/api/stage/3", 300);

        // Insert out of order; load must come back by timestamp.
        RequestStore::save(&store, &second).await.unwrap();
        RequestStore::save(&store, &first).await.unwrap();
        RequestStore::save(&store, &third).await.unwrap();

        let loaded: Vec<QueuedRequest> = store.load_all().await.unwrap();
        let urls: Vec<&str> = loaded.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://erp.local/api/stage/1",
                "https://erp.local/api/stage/2",
                "https://erp.local/api/stage/3"
            ]
        );
    }

    #[tokio::test]
    async fn sqlite_save_upserts_retry_count() {
        let store = SqliteRequestStore::new_in_memory().await.unwrap();

        let mut req = sample("https://erp.local/api/consume", 100);
        RequestStore::save(&store, &req).await.unwrap();

        req.retry_count = 2;
        RequestStore::save(&store, &req).await.unwrap();

        let loaded: Vec<QueuedRequest> = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].retry_count, 2);
    }

    #[tokio::test]
    async fn sqlite_remove_and_clear() {
        let store = SqliteRequestStore::new_in_memory().await.unwrap();

        let a = sample("https://erp.local/api/a", 1);
        let b = sample("https://erp.local/api/b", 2);
        RequestStore::save(&store, &a).await.unwrap();
        RequestStore::save(&store, &b).await.unwrap();
        assert_eq!(RequestStore::<serde_json::Value>::len(&store).await.unwrap(), 2);

        RequestStore::<serde_json::Value>::remove(&store, &a.id).await.unwrap();
        assert_eq!(RequestStore::<serde_json::Value>::len(&store).await.unwrap(), 1);

        RequestStore::<serde_json::Value>::clear(&store).await.unwrap();
        assert_eq!(RequestStore::<serde_json::Value>::len(&store).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn memory_store_upserts_in_place() {
        let store: MemoryRequestStore<serde_json::Value> = MemoryRequestStore::new();

        let first = sample("https://erp.local/api/a", 1);
        let mut second = sample("https://erp.local/api/b", 2);
        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        second.retry_count = 1;
        store.save(&second).await.unwrap();

        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 2);
        // Upsert keeps the original position.
        assert_eq!(loaded[0].id, first.id);
        assert_eq!(loaded[1].retry_count, 1);
    }
}
