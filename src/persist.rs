//! Persistence sidecar: store a successful response under a key derived from its request.
//!
//! Writes go to the store selected by the endpoint's [PersistenceRule]. A missing store turns
//! writes into no-ops and reads into `UNAVAILABLE`; store failures on the server path are logged
//! and never fail the call.

use crate::descriptor::{PersistenceRule, StoreKind};
use crate::key_template::KeyTemplate;
use bytes::Bytes;
use captains_log::filter::LogFilter;
use micro_rpc_codec::{AnyCodec, Codec};
use micro_rpc_core::error::{ConfigError, StoreError};
use micro_rpc_core::store::{BlobStore, KvStore};
use micro_rpc_core::{ErrorEnvelope, RpcError, RpcIntErr};
use serde_json::Value;
use std::sync::Arc;

/// The optional store handles of a service or client.
#[derive(Clone, Default)]
pub struct Stores {
    pub kv: Option<Arc<dyn KvStore>>,
    pub blob: Option<Arc<dyn BlobStore>>,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Stores(kv={}, blob={})", self.kv.is_some(), self.blob.is_some())
    }
}

impl Stores {
    #[inline]
    pub fn has(&self, kind: StoreKind) -> bool {
        match kind {
            StoreKind::KeyValue => self.kv.is_some(),
            StoreKind::Blob => self.blob.is_some(),
        }
    }

    /// Returns false when the rule's store is not configured, nothing is written then.
    pub async fn write(
        &self, rule: &PersistenceRule, key: &str, value: Bytes,
    ) -> Result<bool, StoreError> {
        let opts = rule.put_options();
        match rule.kind {
            StoreKind::KeyValue => match &self.kv {
                Some(kv) => {
                    kv.put(&rule.bucket, key, value, &opts).await?;
                    Ok(true)
                }
                None => Ok(false),
            },
            StoreKind::Blob => match &self.blob {
                Some(blob) => {
                    blob.put(&rule.bucket, key, value, &opts).await?;
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Raw stored bytes. `UNAVAILABLE` without a store or on store failure, `NOT_FOUND` when
    /// nothing is stored under `key`.
    pub async fn read(&self, rule: &PersistenceRule, key: &str) -> Result<Bytes, RpcError> {
        let res = match rule.kind {
            StoreKind::KeyValue => match &self.kv {
                Some(kv) => kv.get(&rule.bucket, key).await.map(|e| e.map(|e| e.value)),
                None => return Err(no_store(rule)),
            },
            StoreKind::Blob => match &self.blob {
                Some(blob) => blob.get(&rule.bucket, key).await,
                None => return Err(no_store(rule)),
            },
        };
        match res {
            Ok(Some(v)) => Ok(v),
            Ok(None) => {
                Err(ErrorEnvelope::not_found(format!("{} {}/{} not found", rule.kind, rule.bucket, key))
                    .into())
            }
            Err(e) => Err(RpcError::unavailable(e.to_string())),
        }
    }
}

#[inline]
fn no_store(rule: &PersistenceRule) -> RpcError {
    RpcError::unavailable(format!("no {} store configured for bucket {}", rule.kind, rule.bucket))
}

/// A rule with its template parsed, bound to one endpoint.
#[derive(Debug, Clone)]
pub struct BoundRule {
    pub rule: PersistenceRule,
    pub template: KeyTemplate,
}

impl BoundRule {
    pub fn new(rule: &PersistenceRule) -> Result<Self, ConfigError> {
        Ok(Self { rule: rule.clone(), template: rule.template()? })
    }

    /// Key for an encoded request. The request is decoded as a generic value, so this works
    /// without knowing its type.
    pub fn key_for(&self, codec: &AnyCodec, request: &[u8]) -> Result<String, RpcIntErr> {
        if !self.template.has_placeholders() {
            return Ok(self.template.as_str().to_string());
        }
        match codec.decode::<Value>(request) {
            Ok(v) => Ok(self.template.resolve(&v)),
            Err(()) => Err(RpcIntErr::Decode),
        }
    }
}

/// Write `response` after a successful call. Failures are logged and swallowed.
pub(crate) async fn after_success(
    stores: &Stores, bound: &BoundRule, codec: &AnyCodec, request: &[u8], response: Bytes,
    logger: &LogFilter,
) {
    if bound.rule.client_only {
        return;
    }
    let key = match bound.key_for(codec, request) {
        Ok(key) => key,
        Err(e) => {
            logger_warn!(logger, "persist {}: cannot resolve key: {}", bound.rule.bucket, e);
            return;
        }
    };
    match stores.write(&bound.rule, &key, response).await {
        Ok(true) => {
            logger_trace!(logger, "persisted {} {}/{}", bound.rule.kind, bound.rule.bucket, key);
        }
        Ok(false) => {
            logger_trace!(logger, "no {} store, skip persisting {}", bound.rule.kind, key);
        }
        Err(e) => {
            logger_warn!(logger, "persist {}/{} failed: {}", bound.rule.bucket, key, e);
        }
    }
}
