use bytes::{Bytes, BytesMut};
use micro_rpc_core::error::StoreError;
use micro_rpc_core::store::{BlobInfo, BlobStore, PutOptions};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

pub const DEFAULT_CHUNK_SIZE: usize = 128 * 1024;

struct StoredBlob {
    info: BlobInfo,
    chunks: Vec<Bytes>,
    expires: Option<Instant>,
}

#[inline]
fn digest_of<'a>(chunks: impl Iterator<Item = &'a Bytes>) -> String {
    let mut hasher = Sha256::new();
    for c in chunks {
        hasher.update(c);
    }
    format!("SHA-256={:x}", hasher.finalize())
}

/// Object store kept in memory, objects are split into fixed-size chunks.
#[derive(Clone)]
pub struct MemBlobStore {
    objects: Arc<RwLock<HashMap<(String, String), StoredBlob>>>,
    chunk_size: usize,
}

impl Default for MemBlobStore {
    fn default() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }
}

impl MemBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self { objects: Arc::default(), chunk_size: chunk_size.max(1) }
    }

    #[cfg(test)]
    fn corrupt(&self, bucket: &str, name: &str) {
        let mut objects = self.objects.write().unwrap();
        if let Some(blob) = objects.get_mut(&(bucket.to_string(), name.to_string())) {
            blob.chunks[0] = Bytes::from_static(b"tampered");
        }
    }
}

#[async_trait::async_trait]
impl BlobStore for MemBlobStore {
    async fn put(
        &self, bucket: &str, name: &str, data: Bytes, opts: &PutOptions,
    ) -> Result<BlobInfo, StoreError> {
        if bucket.is_empty() || name.is_empty() {
            return Err(StoreError::Backend(format!("invalid object {:?} in bucket {:?}", name, bucket)));
        }
        let mut chunks = Vec::with_capacity(data.len() / self.chunk_size + 1);
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + self.chunk_size).min(data.len());
            chunks.push(data.slice(offset..end));
            offset = end;
        }
        let info = BlobInfo {
            bucket: bucket.to_string(),
            name: name.to_string(),
            size: data.len() as u64,
            chunks: chunks.len() as u32,
            digest: digest_of(chunks.iter()),
            modified: SystemTime::now(),
        };
        let expires = opts.ttl.map(|ttl| Instant::now() + ttl);
        trace!("blob put {}/{} {} bytes in {} chunks", bucket, name, info.size, info.chunks);
        self.objects
            .write()
            .unwrap()
            .insert((bucket.to_string(), name.to_string()), StoredBlob { info: info.clone(), chunks, expires });
        Ok(info)
    }

    async fn get(&self, bucket: &str, name: &str) -> Result<Option<Bytes>, StoreError> {
        let objects = self.objects.read().unwrap();
        let blob = match objects.get(&(bucket.to_string(), name.to_string())) {
            None => return Ok(None),
            Some(b) => b,
        };
        if let Some(t) = blob.expires {
            if Instant::now() >= t {
                return Ok(None);
            }
        }
        let mut buf = BytesMut::with_capacity(blob.info.size as usize);
        for c in blob.chunks.iter() {
            buf.extend_from_slice(c);
        }
        let digest = digest_of(blob.chunks.iter());
        if digest != blob.info.digest {
            return Err(StoreError::Corrupt {
                name: name.to_string(),
                reason: format!("digest mismatch, expected {} got {}", blob.info.digest, digest),
            });
        }
        Ok(Some(buf.freeze()))
    }

    async fn info(&self, bucket: &str, name: &str) -> Result<Option<BlobInfo>, StoreError> {
        let objects = self.objects.read().unwrap();
        let now = Instant::now();
        Ok(objects
            .get(&(bucket.to_string(), name.to_string()))
            .filter(|b| b.expires.map(|t| now < t).unwrap_or(true))
            .map(|b| b.info.clone()))
    }

    async fn delete(&self, bucket: &str, name: &str) -> Result<bool, StoreError> {
        let removed = self.objects.write().unwrap().remove(&(bucket.to_string(), name.to_string()));
        Ok(removed.is_some())
    }
}
