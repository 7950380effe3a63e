//! AWS S3 object store.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use tracing::info;

use crate::error::{AppError, Result, from_sdk_error};
use crate::storage::ObjectStore;

/// S3-backed object store.
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
}

impl S3ObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Create an S3 store from the ambient AWS configuration.
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self::new(Client::new(&config))
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let bytes = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| AppError::transient(format!("read s3://{bucket}/{key}: {e}")))?;
                Ok(Some(bytes.into_bytes().to_vec()))
            }
            Err(err) => {
                // Check if it's a "not found" error
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    info!("No object at s3://{}/{}", bucket, key);
                    Ok(None)
                } else {
                    Err(from_sdk_error("GetObject", err))
                }
            }
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| from_sdk_error("PutObject", e))?;

        info!("Wrote {} bytes to s3://{}/{}", size, bucket, key);
        Ok(())
    }
}
