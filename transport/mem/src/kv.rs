use bytes::Bytes;
use micro_rpc_core::error::StoreError;
use micro_rpc_core::store::{KvEntry, KvStore, PutOptions};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Instant, SystemTime};

struct Revision {
    entry: KvEntry,
    expires: Option<Instant>,
}

impl Revision {
    #[inline]
    fn alive(&self, now: Instant) -> bool {
        match self.expires {
            Some(t) => now < t,
            None => true,
        }
    }
}

/// Key-value store kept in memory.
///
/// Revisions are numbered across the whole store. Each key keeps at most `history` revisions
/// from the latest write's options.
#[derive(Clone, Default)]
pub struct MemKvStore {
    keys: Arc<RwLock<HashMap<(String, String), VecDeque<Revision>>>>,
    revision: Arc<AtomicU64>,
}

impl MemKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemKvStore {
    async fn put(
        &self, bucket: &str, key: &str, value: Bytes, opts: &PutOptions,
    ) -> Result<u64, StoreError> {
        if bucket.is_empty() || key.is_empty() {
            return Err(StoreError::Backend(format!("invalid key {:?} in bucket {:?}", key, bucket)));
        }
        let revision = self.revision.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = KvEntry {
            bucket: bucket.to_string(),
            key: key.to_string(),
            value,
            revision,
            created: SystemTime::now(),
        };
        let expires = opts.ttl.map(|ttl| Instant::now() + ttl);
        let depth = opts.history.max(1) as usize;
        let mut keys = self.keys.write().unwrap();
        let revisions = keys.entry((bucket.to_string(), key.to_string())).or_default();
        revisions.push_back(Revision { entry, expires });
        while revisions.len() > depth {
            revisions.pop_front();
        }
        trace!("kv put {}/{} rev {}", bucket, key, revision);
        Ok(revision)
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let now = Instant::now();
        let keys = self.keys.read().unwrap();
        let found = keys
            .get(&(bucket.to_string(), key.to_string()))
            .and_then(|revs| revs.back())
            .filter(|rev| rev.alive(now))
            .map(|rev| rev.entry.clone());
        Ok(found)
    }

    async fn history(&self, bucket: &str, key: &str) -> Result<Vec<KvEntry>, StoreError> {
        let now = Instant::now();
        let keys = self.keys.read().unwrap();
        match keys.get(&(bucket.to_string(), key.to_string())) {
            Some(revs) => {
                Ok(revs.iter().filter(|rev| rev.alive(now)).map(|rev| rev.entry.clone()).collect())
            }
            None => Ok(Vec::new()),
        }
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<bool, StoreError> {
        let removed = self.keys.write().unwrap().remove(&(bucket.to_string(), key.to_string()));
        Ok(removed.is_some())
    }
}
