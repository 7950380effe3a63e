//! DynamoDB data store.
//!
//! Table layout: partition key `id` (S), sort key `SK` (S). Rows are mapped
//! with `serde_dynamo`, so arbitrary JSON attributes survive the round trip.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use aws_sdk_dynamodb::Client;
use aws_sdk_dynamodb::types::{AttributeValue, PutRequest, WriteRequest};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result, from_sdk_error};
use crate::store::{DataStore, Item, PutOutcome};

/// Maximum number of requests DynamoDB accepts in one BatchWriteItem call.
const BATCH_SIZE: usize = 25;

/// Rounds spent re-sending unprocessed items before giving up.
const UNPROCESSED_ROUNDS: u32 = 5;

type Row = HashMap<String, AttributeValue>;

/// DynamoDB-backed data store.
pub struct DynamoStore {
    client: Client,
    table_name: String,
}

impl DynamoStore {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    /// Create a store from the ambient AWS configuration.
    pub async fn from_env(table_name: impl Into<String>) -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config), table_name)
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    fn to_row(item: &Item) -> Result<Row> {
        serde_dynamo::to_item(item)
            .map_err(|e| AppError::storage(format!("encode {}/{}: {e}", item.id, item.sk)))
    }

    fn from_row(row: Row) -> Result<Item> {
        serde_dynamo::from_item(row).map_err(|e| AppError::storage(format!("decode row: {e}")))
    }

    /// Write one chunk, re-sending unprocessed items with growing delays.
    async fn write_chunk(&self, mut requests: Vec<WriteRequest>) -> Result<()> {
        for round in 0..=UNPROCESSED_ROUNDS {
            if round > 0 {
                let delay = Duration::from_millis(50 * 2u64.pow(round));
                warn!(
                    "{} unprocessed items in {}, retrying in {:?}",
                    requests.len(),
                    self.table_name,
                    delay
                );
                tokio::time::sleep(delay).await;
            }

            let output = self
                .client
                .batch_write_item()
                .request_items(&self.table_name, requests)
                .send()
                .await
                .map_err(|e| from_sdk_error("BatchWriteItem", e))?;

            requests = output
                .unprocessed_items()
                .and_then(|items| items.get(&self.table_name))
                .cloned()
                .unwrap_or_default();

            if requests.is_empty() {
                return Ok(());
            }
        }

        Err(AppError::transient(format!(
            "{} items still unprocessed in {}",
            requests.len(),
            self.table_name
        )))
    }
}

#[async_trait]
impl DataStore for DynamoStore {
    async fn put(&self, item: Item) -> Result<()> {
        let row = Self::to_row(&item)?;
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(row))
            .send()
            .await
            .map_err(|e| from_sdk_error("PutItem", e))?;
        debug!("Put {}/{}", item.id, item.sk);
        Ok(())
    }

    async fn batch_put(&self, items: Vec<Item>) -> Result<()> {
        // One batch may not name the same key twice; the last write wins.
        let unique: BTreeMap<(String, String), Item> = items
            .into_iter()
            .map(|item| ((item.id.clone(), item.sk.clone()), item))
            .collect();
        let total = unique.len();

        let mut requests = Vec::with_capacity(total);
        for item in unique.values() {
            let put = PutRequest::builder()
                .set_item(Some(Self::to_row(item)?))
                .build()
                .map_err(AppError::storage)?;
            requests.push(WriteRequest::builder().put_request(put).build());
        }

        for chunk in requests.chunks(BATCH_SIZE) {
            self.write_chunk(chunk.to_vec()).await?;
        }

        info!("Wrote {} items to {}", total, self.table_name);
        Ok(())
    }

    async fn get(&self, id: &str, sk: &str) -> Result<Option<Item>> {
        let output = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("id", AttributeValue::S(id.to_string()))
            .key("SK", AttributeValue::S(sk.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| from_sdk_error("GetItem", e))?;

        output.item.map(Self::from_row).transpose()
    }

    async fn query_by_id(&self, id: &str, sk_prefix: &str) -> Result<Vec<Item>> {
        let mut items = Vec::new();
        let mut last_evaluated_key = None;

        loop {
            let mut query = self
                .client
                .query()
                .table_name(&self.table_name)
                .expression_attribute_values(":id", AttributeValue::S(id.to_string()))
                .consistent_read(true);

            query = if sk_prefix.is_empty() {
                query.key_condition_expression("id = :id")
            } else {
                query
                    .key_condition_expression("id = :id AND begins_with(SK, :prefix)")
                    .expression_attribute_values(":prefix", AttributeValue::S(sk_prefix.to_string()))
            };

            if let Some(key) = last_evaluated_key {
                query = query.set_exclusive_start_key(Some(key));
            }

            let output = query
                .send()
                .await
                .map_err(|e| from_sdk_error("Query", e))?;

            for row in output.items() {
                items.push(Self::from_row(row.clone())?);
            }

            last_evaluated_key = output.last_evaluated_key().cloned();
            if last_evaluated_key.is_none() {
                break;
            }
        }

        Ok(items)
    }

    async fn put_if_absent(&self, item: Item) -> Result<PutOutcome> {
        let row = Self::to_row(&item)?;
        let result = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(row))
            .condition_expression("attribute_not_exists(id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok(PutOutcome::Created),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|e| e.is_conditional_check_failed_exception()) =>
            {
                debug!("{}/{} already exists", item.id, item.sk);
                Ok(PutOutcome::AlreadyExists)
            }
            Err(err) => Err(from_sdk_error("PutItem (conditional)", err)),
        }
    }
}
