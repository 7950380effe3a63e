//! In-memory data store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::store::{DataStore, Item, PutOutcome};

type Table = BTreeMap<(String, String), Item>;

/// Process-local table; clones share the same rows.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<Table>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    /// Snapshot of every row, ordered by key.
    pub async fn items(&self) -> Vec<Item> {
        self.rows.read().await.values().cloned().collect()
    }
}

pub(crate) fn query(rows: &Table, id: &str, sk_prefix: &str) -> Vec<Item> {
    rows.range((id.to_string(), sk_prefix.to_string())..)
        .take_while(|((row_id, sk), _)| row_id == id && sk.starts_with(sk_prefix))
        .map(|(_, item)| item.clone())
        .collect()
}

fn key(item: &Item) -> (String, String) {
    (item.id.clone(), item.sk.clone())
}

#[async_trait]
impl DataStore for MemoryStore {
    async fn put(&self, item: Item) -> Result<()> {
        self.rows.write().await.insert(key(&item), item);
        Ok(())
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        let mut rows = self.rows.write().await;
        for item in items {
            rows.insert(key(&item), item);
        }
        Ok(())
    }

    async fn get(&self, id: &str, sk: &str) -> Result<Option<Item>> {
        let rows = self.rows.read().await;
        Ok(rows.get(&(id.to_string(), sk.to_string())).cloned())
    }

    async fn query_by_id(&self, id: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let rows = self.rows.read().await;
        Ok(query(&rows, id, sk_prefix))
    }

    async fn put_if_absent(&self, item: Item) -> Result<PutOutcome> {
        let mut rows = self.rows.write().await;
        let key = key(&item);
        if rows.contains_key(&key) {
            return Ok(PutOutcome::AlreadyExists);
        }
        rows.insert(key, item);
        Ok(PutOutcome::Created)
    }
}
