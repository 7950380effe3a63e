//! PersistRecords: bulk-write work records.
//!
//! Records are keyed by `(id, SK)` and written with plain puts, so running
//! this unit any number of times leaves the same rows as running it once.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::stage::StageUnit;
use crate::stages::{IngestOutput, PersistOutput, UserMonths, from_payload, to_payload};
use crate::store::{DataStore, Item};

pub struct PersistUnit {
    store: Arc<dyn DataStore>,
}

impl PersistUnit {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageUnit for PersistUnit {
    fn name(&self) -> &str {
        "PersistRecords"
    }

    async fn call(&self, input: Value) -> Result<Value> {
        let ingest: IngestOutput = from_payload(self.name(), input)?;

        let mut items = Vec::new();
        for user in &ingest.users {
            for record in &user.records {
                items.push(Item::encode(&record.id, &record.sk, record)?);
            }
        }
        let written = items.len();
        self.store.batch_put(items).await?;

        let users = ingest
            .users
            .into_iter()
            .map(|u| UserMonths {
                user_id: u.user_id,
                months: u.months,
            })
            .collect();
        to_payload(&PersistOutput { users, written })
    }
}
