//! Messaging delivery endpoints.
//!
//! - [`SlackMessenger`]: Slack Web API external upload flow
//! - [`OutboxMessenger`]: writes deliveries to a local directory

pub mod slack;

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

pub use slack::SlackMessenger;

/// One artifact to hand to a user's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRequest {
    pub user_id: String,
    pub channel: String,
    pub filename: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub user_id: String,
    pub channel: String,
    /// Endpoint-specific id of the delivered file
    pub file_id: String,
    pub delivered_at: DateTime<Utc>,
}

/// Trait for messaging endpoints.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt>;
}

/// Writes each delivery to `{dir}/{channel}/{filename}`.
#[derive(Debug, Clone)]
pub struct OutboxMessenger {
    dir: PathBuf,
}

impl OutboxMessenger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

fn safe_segment(segment: &str) -> Result<&str> {
    if segment.is_empty() || segment.contains(['/', '\\']) || segment == "." || segment == ".." {
        return Err(AppError::rejected(format!("invalid outbox path segment {segment:?}")));
    }
    Ok(segment)
}

#[async_trait]
impl Messenger for OutboxMessenger {
    async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryReceipt> {
        let dir = self.dir.join(safe_segment(&request.channel)?);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(safe_segment(&request.filename)?);

        let mut file = tokio::fs::File::create(&path).await?;
        file.write_all(&request.bytes).await?;
        file.flush().await?;

        log::info!(
            "Delivered {} for {} to {}",
            request.filename,
            request.user_id,
            path.display()
        );
        Ok(DeliveryReceipt {
            user_id: request.user_id,
            channel: request.channel,
            file_id: path.display().to_string(),
            delivered_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn request(channel: &str, filename: &str) -> DeliveryRequest {
        DeliveryRequest {
            user_id: "u1".into(),
            channel: channel.into(),
            filename: filename.into(),
            bytes: b"a,b\r\n".to_vec(),
        }
    }

    #[tokio::test]
    async fn test_outbox_writes_file() {
        let tmp = TempDir::new().unwrap();
        let messenger = OutboxMessenger::new(tmp.path());

        let receipt = messenger.deliver(request("C1", "u1.csv")).await.unwrap();
        assert_eq!(receipt.channel, "C1");
        let written = std::fs::read(tmp.path().join("C1/u1.csv")).unwrap();
        assert_eq!(written, b"a,b\r\n");
    }

    #[tokio::test]
    async fn test_outbox_rejects_traversal() {
        let tmp = TempDir::new().unwrap();
        let messenger = OutboxMessenger::new(tmp.path());

        assert!(messenger.deliver(request("..", "u1.csv")).await.is_err());
        assert!(messenger.deliver(request("C1", "../u1.csv")).await.is_err());
    }
}
