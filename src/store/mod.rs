//! Object store access
//!
//! [`ObjectFetcher`] turns a store/key reference into a byte stream and the
//! size the store reported for it. Fetching is read-only.

mod s3;

use std::pin::Pin;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::TransferError;

pub use s3::S3ObjectFetcher;

/// Streamed object content
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// An object ready to be streamed
pub struct FetchedObject {
    /// Size reported by the store at fetch time
    pub size: u64,
    pub body: ObjectBody,
}

impl std::fmt::Debug for FetchedObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchedObject")
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

/// Resolves an object reference to its content
///
/// Signals `ObjectNotFound` (including an object deleted after its creation
/// event was emitted), `ObjectStoreUnavailable` for transient backend errors
/// and `ObjectTooLarge` when the configured ceiling is exceeded.
#[async_trait]
pub trait ObjectFetcher: Send + Sync {
    async fn fetch(&self, store_name: &str, object_key: &str)
        -> Result<FetchedObject, TransferError>;
}

/// Enforce the configurable size ceiling
pub fn check_ceiling(size: u64, limit: Option<u64>) -> Result<(), TransferError> {
    match limit {
        Some(limit) if size > limit => Err(TransferError::ObjectTooLarge { size, limit }),
        _ => Ok(()),
    }
}
