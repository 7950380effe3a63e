//! Object storage for uploads and rendered artifacts.
//!
//! ```text
//! {bucket}/
//! ├── raw/                                   # uploaded work-data files
//! │   └── 2024-01.csv
//! └── work_schedule/                         # rendered schedules
//!     └── {user_id}/{execution_id}/{filename}
//! ```

pub mod local;
pub mod memory;

#[cfg(feature = "aws")]
pub mod s3;

use async_trait::async_trait;

use crate::error::Result;

// Re-export for convenience
pub use local::LocalObjectStore;
pub use memory::MemoryObjectStore;

#[cfg(feature = "aws")]
pub use s3::S3ObjectStore;

/// Trait for object storage backends.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object, returning `None` if it does not exist.
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any previous content.
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<()>;
}
