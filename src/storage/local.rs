//! Local filesystem object store.
//!
//! Buckets are directories under the root:
//!
//! ```text
//! {root}/
//! └── {bucket}/
//!     ├── raw/2024-01.csv
//!     └── work_schedule/u1/{execution_id}/u1_2024-01.csv
//! ```

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};
use crate::storage::ObjectStore;

/// Local filesystem object store backend.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root_dir: PathBuf,
}

impl LocalObjectStore {
    /// Create a new store rooted at the given directory.
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    /// Get the full path for a bucket and key.
    ///
    /// Keys may not escape the bucket directory.
    fn path(&self, bucket: &str, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if bucket.is_empty() || bucket.contains('/') || escapes {
            return Err(AppError::input(format!("invalid object location {bucket}/{key}")));
        }
        Ok(self.root_dir.join(bucket).join(relative))
    }

    /// Write bytes atomically (write to temp, then rename).
    async fn write_bytes(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = tokio::fs::File::create(&tmp).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        drop(file);

        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<()> {
        let path = self.path(bucket, key)?;
        self.write_bytes(&path, &bytes).await?;
        log::debug!("Wrote {} bytes to {}", bytes.len(), path.display());
        Ok(())
    }
}
