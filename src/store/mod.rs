//! Key-value data store with composite `(id, SK)` keys.
//!
//! Work records, user configs, templates and execution records all live in
//! one table. Backends:
//!
//! - [`MemoryStore`]: process-local, used by tests
//! - [`LocalStore`]: JSON file, used by the CLI
//! - `DynamoStore`: DynamoDB, used by the Lambda (feature `aws`)

pub mod ledger;
pub mod local;
pub mod memory;

#[cfg(feature = "aws")]
pub mod dynamodb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};

use crate::error::{AppError, Result};

pub use ledger::ExecutionLedger;
pub use local::LocalStore;
pub use memory::MemoryStore;

#[cfg(feature = "aws")]
pub use dynamodb::DynamoStore;

/// One row of the table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    #[serde(rename = "SK")]
    pub sk: String,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Item {
    /// Encode a serializable value as a row under the given key.
    ///
    /// `id`/`SK` fields of the value are replaced by the key.
    pub fn encode<T: Serialize>(
        id: impl Into<String>,
        sk: impl Into<String>,
        value: &T,
    ) -> Result<Self> {
        let mut attributes = match serde_json::to_value(value)? {
            Value::Object(map) => map,
            other => {
                return Err(AppError::storage(format!(
                    "row payload must be an object, got {other}"
                )));
            }
        };
        attributes.remove("id");
        attributes.remove("SK");
        Ok(Self {
            id: id.into(),
            sk: sk.into(),
            attributes,
        })
    }

    /// Decode the row, including its key fields, into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut map = self.attributes.clone();
        map.insert("id".into(), Value::String(self.id.clone()));
        map.insert("SK".into(), Value::String(self.sk.clone()));
        Ok(serde_json::from_value(Value::Object(map))?)
    }

    pub fn key(&self) -> (&str, &str) {
        (&self.id, &self.sk)
    }
}

/// Result of a conditional create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    AlreadyExists,
}

/// Data store operations used by the pipeline.
///
/// `put` and `batch_put` overwrite, so replaying them is idempotent.
/// `put_if_absent` is the only create-once primitive.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn put(&self, item: Item) -> Result<()>;

    async fn batch_put(&self, items: Vec<Item>) -> Result<()>;

    async fn get(&self, id: &str, sk: &str) -> Result<Option<Item>>;

    /// All rows under `id` whose sort key starts with `sk_prefix`, ordered by
    /// sort key.
    async fn query_by_id(&self, id: &str, sk_prefix: &str) -> Result<Vec<Item>>;

    /// Create the row unless one with the same key exists.
    async fn put_if_absent(&self, item: Item) -> Result<PutOutcome>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TEMPLATE_ID, TemplateConfig, USER_CONFIG_SK, UserConfig};

    #[test]
    fn test_encode_decode_user_config() {
        let config = TemplateConfig::builtin("default").derive_for("u1");
        let item = Item::encode(&config.user_id, USER_CONFIG_SK, &config).unwrap();

        assert_eq!(item.key(), ("u1", "UserConfig"));
        assert!(!item.attributes.contains_key("id"));

        let decoded: UserConfig = item.decode().unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn test_encode_rejects_scalars() {
        assert!(Item::encode(TEMPLATE_ID, "x", &42).is_err());
    }

    #[test]
    fn test_item_json_shape() {
        let item = Item::encode("u1", "WorkData#2024-01-01#01", &serde_json::json!({ "memo": "m" }))
            .unwrap();
        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(value["SK"], "WorkData#2024-01-01#01");
        assert_eq!(value["memo"], "m");
    }
}
