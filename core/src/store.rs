//! Optional persistence collaborators: a key-value store and a blob store.
//!
//! Both are consumed through `Arc<dyn ..>` so a service can run with either, both or neither.

use crate::error::StoreError;
use bytes::Bytes;
use std::time::{Duration, SystemTime};

/// Per-write settings, honored when the store supports them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PutOptions {
    pub ttl: Option<Duration>,
    /// Revisions retained per key, 0 is treated as 1
    pub history: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KvEntry {
    pub bucket: String,
    pub key: String,
    pub value: Bytes,
    pub revision: u64,
    pub created: SystemTime,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlobInfo {
    pub bucket: String,
    pub name: String,
    pub size: u64,
    pub chunks: u32,
    /// "SHA-256=" followed by the hex digest of the whole object
    pub digest: String,
    pub modified: SystemTime,
}

#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Returns the new revision.
    async fn put(
        &self, bucket: &str, key: &str, value: Bytes, opts: &PutOptions,
    ) -> Result<u64, StoreError>;

    /// The latest live revision, None when absent or expired.
    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Retained revisions, oldest first.
    async fn history(&self, bucket: &str, key: &str) -> Result<Vec<KvEntry>, StoreError>;

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StoreError>;
}

#[async_trait::async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(
        &self, bucket: &str, name: &str, data: Bytes, opts: &PutOptions,
    ) -> Result<BlobInfo, StoreError>;

    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Bytes>, StoreError>;

    async fn info(&self, bucket: &str, name: &str) -> Result<Option<BlobInfo>, StoreError>;

    async fn delete(&self, bucket: &str, name: &str) -> Result<bool, StoreError>;
}
