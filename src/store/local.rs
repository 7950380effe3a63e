//! JSON-file data store for local runs.
//!
//! The whole table lives in one file:
//!
//! ```text
//! storage/
//! └── table.json      # [{"id": ..., "SK": ..., ...}, ...]
//! ```
//!
//! Writes go to a temp file which is then renamed over the table, and every
//! operation holds one async lock, so conditional puts are race-free within
//! the process.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{AppError, Result};
use crate::store::memory::query;
use crate::store::{DataStore, Item, PutOutcome};

type Table = BTreeMap<(String, String), Item>;

/// Local filesystem data store backend.
#[derive(Clone)]
pub struct LocalStore {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Create a store backed by the given JSON file. The file is created on
    /// first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    async fn load(&self) -> Result<Table> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Table::new()),
            Err(e) => return Err(AppError::Io(e)),
        };
        let items: Vec<Item> = serde_json::from_slice(&bytes).map_err(|e| {
            AppError::storage(format!("corrupt table {}: {e}", self.path.display()))
        })?;
        Ok(items
            .into_iter()
            .map(|item| ((item.id.clone(), item.sk.clone()), item))
            .collect())
    }

    /// Write the table atomically (write to temp, then rename).
    async fn save(&self, table: &Table) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let items: Vec<&Item> = table.values().collect();
        let bytes = serde_json::to_vec_pretty(&items)?;

        let tmp = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(&bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl DataStore for LocalStore {
    async fn put(&self, item: Item) -> Result<()> {
        self.batch_put(vec![item]).await
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let count = items.len();
        for item in items {
            table.insert((item.id.clone(), item.sk.clone()), item);
        }
        self.save(&table).await?;
        log::debug!("Wrote {} rows to {}", count, self.path.display());
        Ok(())
    }

    async fn get(&self, id: &str, sk: &str) -> Result<Option<Item>> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        Ok(table.remove(&(id.to_string(), sk.to_string())))
    }

    async fn query_by_id(&self, id: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let _guard = self.lock.lock().await;
        let table = self.load().await?;
        Ok(query(&table, id, sk_prefix))
    }

    async fn put_if_absent(&self, item: Item) -> Result<PutOutcome> {
        let _guard = self.lock.lock().await;
        let mut table = self.load().await?;
        let key = (item.id.clone(), item.sk.clone());
        if table.contains_key(&key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        table.insert(key, item);
        self.save(&table).await?;
        Ok(PutOutcome::Created)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn item(id: &str, sk: &str, v: i64) -> Item {
        Item::encode(id, sk, &json!({ "v": v })).unwrap()
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path().join("db/table.json"));

        store.put(item("u1", "UserConfig", 1)).await.unwrap();
        let row = store.get("u1", "UserConfig").await.unwrap().unwrap();
        assert_eq!(row.attributes["v"], 1);

        // A second handle on the same file sees the row.
        let reopened = LocalStore::new(store.path().clone());
        assert!(reopened.get("u1", "UserConfig").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_read_nonexistent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path().join("table.json"));

        assert!(store.get("nope", "x").await.unwrap().is_none());
        assert!(store.query_by_id("nope", "").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_put_if_absent() {
        let tmp = TempDir::new().unwrap();
        let store = LocalStore::new(tmp.path().join("table.json"));

        let (a, b) = tokio::join!(
            store.put_if_absent(item("u1", "UserConfig", 1)),
            store.put_if_absent(item("u1", "UserConfig", 2)),
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == PutOutcome::Created);
        assert_eq!(outcomes, [PutOutcome::AlreadyExists, PutOutcome::Created]);
        assert_eq!(store.query_by_id("u1", "").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_corrupt_table_is_reported() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("table.json");
        tokio::fs::write(&path, b"not json").await.unwrap();

        let err = LocalStore::new(path).get("u1", "x").await.unwrap_err();
        assert!(matches!(err, AppError::Storage(_)));
    }
}
