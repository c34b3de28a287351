//! Durable storage of per-(user, template) volume snapshots.

mod object;

pub use object::ObjectSnapshotStore;

use crate::retry::{Retryable, StepTimeout};
use agentbox_common::LeaseError;
use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("snapshot {0} not found")]
    NotFound(String),

    #[error("object store error: {0}")]
    Backend(String),

    #[error("unsupported by this store: {0}")]
    Unsupported(String),

    #[error("snapshot {0} is corrupt: {1}")]
    Corrupt(String, String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Timeout(_))
    }
}

impl From<StepTimeout> for StoreError {
    fn from(timeout: StepTimeout) -> Self {
        StoreError::Timeout(timeout.0)
    }
}

impl From<StoreError> for LeaseError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => LeaseError::NotFound(format!("snapshot {key}")),
            e => LeaseError::Store(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Outcome of a confirmed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotPut {
    /// Size of the archive as handed to `put`.
    pub size_bytes: u64,
    /// Size at rest after compression.
    pub stored_bytes: u64,
    /// Hex SHA-256 of the archive as handed to `put`.
    pub sha256: String,
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Replaces the object at `key`. A failed put leaves any previous object
    /// untouched.
    async fn put(&self, key: &str, archive: Bytes) -> Result<SnapshotPut>;

    /// The archive exactly as it was put, or `None` if nothing is stored.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Time-limited URL a client can fetch the stored (compressed) object from.
    async fn signed_download_url(&self, key: &str, ttl: Duration) -> Result<Url>;
}

/// Hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}
