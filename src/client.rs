//! Caller side of a service.
//!
//! A [Client] is built once from a [ServiceDescriptor] and a transport, then shared (it is a
//! cheap clone). Every call resolves its subject and timeout, encodes with the service's
//! encoding and returns [RpcError] on failure; nothing here panics on a remote error.
//!
//! ```ignore
//! let client = Client::builder(desc, transport).with_interceptor(tracing).build()?;
//! let ctx = CallContext::new().with_timeout(Duration::from_secs(2));
//! ctx.set_header("Authorization", "Bearer t");
//! let profile: Profile = client.call("GetProfile", &GetProfileRequest { id }, &ctx).await?;
//! ```

use crate::descriptor::{EndpointDescriptor, ServiceDescriptor, Shape, StoreKind, valid_prefix};
use crate::interceptor::{ClientCall, ClientInterceptor, UnaryInvoker, chain_client};
use crate::key_template::validate_for;
use crate::persist::{BoundRule, Stores};
use crate::subject::{self, EndpointInfo, Resolved};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use futures::FutureExt;
use micro_rpc_codec::{AnyCodec, Codec};
use micro_rpc_core::error::ConfigError;
use micro_rpc_core::store::{BlobStore, KvStore};
use micro_rpc_core::transport::{self, Message, Transport};
use micro_rpc_core::{CallContext, ClientConfig, ErrorEnvelope, RpcError, RpcIntErr};
use micro_rpc_stream::client::{
    self as stream_client, ClientBidiStream, ClientRecvStream, ClientSendStream, StreamOptions,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ClientBuilder {
    desc: ServiceDescriptor,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    interceptors: Vec<Arc<dyn ClientInterceptor>>,
    stores: Stores,
}

impl ClientBuilder {
    #[inline]
    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Interceptors run in the order they are added, the first one outermost.
    #[inline]
    pub fn with_interceptor(mut self, ic: impl ClientInterceptor) -> Self {
        self.interceptors.push(Arc::new(ic));
        self
    }

    #[inline]
    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.stores.kv = Some(kv);
        self
    }

    #[inline]
    pub fn with_blob_store(mut self, blob: Arc<dyn BlobStore>) -> Self {
        self.stores.blob = Some(blob);
        self
    }

    pub fn build(self) -> Result<Client, ConfigError> {
        self.desc.validate()?;
        if let Some(prefix) = &self.config.subject_prefix {
            if !valid_prefix(prefix) {
                return Err(ConfigError::InvalidSubject(prefix.clone()));
            }
        }
        let mut rules = BTreeMap::new();
        for ep in &self.desc.endpoints {
            if let Some(rule) = &ep.persistence {
                rules.insert(ep.name.clone(), BoundRule::new(rule)?);
            }
        }
        let logger = Arc::new(LogFilter::new());
        let invoker = chain_client(&self.interceptors, bus_invoker(self.transport.clone()));
        Ok(Client {
            inner: Arc::new(ClientInner {
                codec: AnyCodec::new(self.desc.encoding),
                desc: self.desc,
                transport: self.transport,
                config: self.config,
                invoker,
                stores: self.stores,
                rules,
                logger,
            }),
        })
    }
}

/// The innermost invoker: one request on the bus, one reply.
fn bus_invoker(transport: Arc<dyn Transport>) -> UnaryInvoker {
    Arc::new(move |call: ClientCall| {
        let transport = transport.clone();
        async move {
            let mut headers = call.ctx.seal_outgoing();
            headers.strip_reserved();
            let msg = Message::new(call.subject, call.request).with_headers(headers);
            let reply = transport::request(transport.as_ref(), msg, &call.ctx, call.timeout).await?;
            let err = ErrorEnvelope::decode(&reply.headers, &reply.payload);
            let mut headers = reply.headers;
            headers.strip_reserved();
            call.ctx.resolve_response(headers);
            match err {
                Some(e) => Err(e.into()),
                None => Ok(reply.payload),
            }
        }
        .boxed()
    })
}

struct ClientInner {
    desc: ServiceDescriptor,
    transport: Arc<dyn Transport>,
    config: ClientConfig,
    codec: AnyCodec,
    invoker: UnaryInvoker,
    stores: Stores,
    rules: BTreeMap<String, BoundRule>,
    logger: Arc<LogFilter>,
}

#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "client({})", self.inner.desc.name)
    }
}

impl Client {
    pub fn builder(desc: ServiceDescriptor, transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder {
            desc,
            transport,
            config: ClientConfig::default(),
            interceptors: Vec::new(),
            stores: Stores::default(),
        }
    }

    #[inline]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.inner.desc
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.inner.logger
    }

    /// Endpoints as this client addresses them, after any prefix override.
    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        subject::endpoint_infos(&self.inner.desc, self.inner.config.subject_prefix.as_deref())
    }

    fn resolve(&self, method: &str, shape: Shape) -> Result<(&EndpointDescriptor, Resolved), RpcError> {
        let desc = &self.inner.desc;
        let ep = match desc.endpoint(method) {
            Some(ep) if !ep.skip => ep,
            _ => {
                return Err(ErrorEnvelope::invalid_argument(format!(
                    "{} has no callable method {}",
                    desc.name, method
                ))
                .into());
            }
        };
        if ep.shape != shape {
            return Err(ErrorEnvelope::invalid_argument(format!(
                "{}.{} is {}, not {}",
                desc.name, method, ep.shape, shape
            ))
            .into());
        }
        let config = &self.inner.config;
        let resolved = subject::resolve(desc, ep, config.subject_prefix.as_deref(), config.timeout);
        Ok((ep, resolved))
    }

    #[inline]
    fn encode<T: Serialize>(&self, msg: &T) -> Result<Bytes, RpcError> {
        match self.inner.codec.encode(msg) {
            Ok(buf) => Ok(Bytes::from(buf)),
            Err(()) => Err(RpcIntErr::Encode.into()),
        }
    }

    #[inline]
    fn decode<T: DeserializeOwned>(&self, buf: &[u8]) -> Result<T, RpcError> {
        match self.inner.codec.decode::<T>(buf) {
            Ok(v) => Ok(v),
            Err(()) => Err(RpcIntErr::Decode.into()),
        }
    }

    /// One request, one response.
    ///
    /// Waits until the reply arrives, the effective timeout or the context deadline expires
    /// (`rpc_timeout`), or the context is cancelled (`rpc_cancelled`). No responder on the
    /// subject gives `UNAVAILABLE`.
    pub async fn call<Req: Serialize, Resp: DeserializeOwned>(
        &self, method: &str, req: &Req, ctx: &CallContext,
    ) -> Result<Resp, RpcError> {
        let (_ep, resolved) = self.resolve(method, Shape::Unary)?;
        let request = self.encode(req)?;
        let call = ClientCall {
            service: self.inner.desc.name.clone(),
            method: method.to_string(),
            subject: resolved.subject,
            ctx: ctx.clone(),
            request,
            timeout: resolved.timeout,
        };
        logger_trace!(self.inner.logger, "{:?} call {:?}", self, call);
        match (self.inner.invoker)(call).await {
            Ok(resp) => self.decode(&resp),
            Err(e) => {
                logger_debug!(self.inner.logger, "{:?} {} failed: {}", self, method, e);
                Err(e)
            }
        }
    }

    fn stream_options(&self, resolved: Resolved) -> StreamOptions {
        StreamOptions {
            subject: resolved.subject,
            codec: self.inner.codec,
            timeout: resolved.timeout,
            idle_timeout: self.inner.config.stream_idle_timeout,
        }
    }

    /// Send one request, receive any number of responses.
    pub async fn server_stream<Req: Serialize, Resp: DeserializeOwned>(
        &self, method: &str, req: &Req, ctx: &CallContext,
    ) -> Result<ClientRecvStream<Resp>, RpcError> {
        let (_ep, resolved) = self.resolve(method, Shape::ServerStream)?;
        let opts = self.stream_options(resolved);
        logger_trace!(self.inner.logger, "{:?} open server stream {}", self, opts.subject);
        stream_client::server_stream(self.inner.transport.clone(), &opts, ctx, req).await
    }

    /// Send any number of requests, then receive one response with `close_and_recv`.
    pub async fn client_stream<Req: Serialize, Resp: DeserializeOwned>(
        &self, method: &str, ctx: &CallContext,
    ) -> Result<ClientSendStream<Req, Resp>, RpcError> {
        let (_ep, resolved) = self.resolve(method, Shape::ClientStream)?;
        let opts = self.stream_options(resolved);
        logger_trace!(self.inner.logger, "{:?} open client stream {}", self, opts.subject);
        stream_client::client_stream(self.inner.transport.clone(), &opts, ctx).await
    }

    pub async fn bidi<Req: Serialize, Resp: DeserializeOwned>(
        &self, method: &str, ctx: &CallContext,
    ) -> Result<ClientBidiStream<Req, Resp>, RpcError> {
        let (_ep, resolved) = self.resolve(method, Shape::Bidi)?;
        let opts = self.stream_options(resolved);
        logger_trace!(self.inner.logger, "{:?} open bidi stream {}", self, opts.subject);
        stream_client::bidi_stream(self.inner.transport.clone(), &opts, ctx).await
    }

    fn rule(&self, method: &str) -> Result<&BoundRule, RpcError> {
        match self.inner.rules.get(method) {
            Some(rule) => Ok(rule),
            None => Err(ErrorEnvelope::invalid_argument(format!(
                "{}.{} has no persistence rule",
                self.inner.desc.name, method
            ))
            .into()),
        }
    }

    /// Check the persistence key template of `method` against its request type.
    pub fn validate_persistence<Req: DeserializeOwned>(&self, method: &str) -> Result<(), ConfigError> {
        match self.inner.rules.get(method) {
            Some(bound) => validate_for::<Req>(&bound.template, std::any::type_name::<Req>()),
            None => Ok(()),
        }
    }

    /// The key the response to `req` is stored under.
    pub fn persisted_key<Req: Serialize>(&self, method: &str, req: &Req) -> Result<String, RpcError> {
        let bound = self.rule(method)?;
        match serde_json::to_value(req) {
            Ok(v) => Ok(bound.template.resolve(&v)),
            Err(e) => {
                logger_warn!(self.inner.logger, "{:?} persisted_key {}: {}", self, method, e);
                Err(RpcIntErr::Encode.into())
            }
        }
    }

    /// Read a persisted response straight from the store, without calling the service.
    ///
    /// `UNAVAILABLE` when no store is configured, `NOT_FOUND` when nothing is stored under
    /// `key`.
    pub async fn read_direct<Resp: DeserializeOwned>(
        &self, method: &str, key: &str,
    ) -> Result<Resp, RpcError> {
        let bound = self.rule(method)?;
        let raw = self.inner.stores.read(&bound.rule, key).await?;
        self.decode(&raw)
    }

    /// Write a value where the service would have persisted it, without calling the service.
    pub async fn write_direct<Resp: Serialize>(
        &self, method: &str, key: &str, value: &Resp,
    ) -> Result<(), RpcError> {
        let bound = self.rule(method)?;
        let raw = self.encode(value)?;
        match self.inner.stores.write(&bound.rule, key, raw).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(RpcError::unavailable(format!(
                "no {} store configured for bucket {}",
                bound.rule.kind, bound.rule.bucket
            ))),
            Err(e) => Err(RpcError::unavailable(e.to_string())),
        }
    }

    /// Retained revisions of a key-value persisted response, oldest first.
    pub async fn history<Resp: DeserializeOwned>(
        &self, method: &str, key: &str,
    ) -> Result<Vec<Resp>, RpcError> {
        let bound = self.rule(method)?;
        let kv = match &self.inner.stores.kv {
            Some(kv) if bound.rule.kind == StoreKind::KeyValue => kv,
            _ => {
                return Err(RpcError::unavailable(format!(
                    "no kv store configured for bucket {}",
                    bound.rule.bucket
                )));
            }
        };
        let entries = match kv.history(&bound.rule.bucket, key).await {
            Ok(entries) => entries,
            Err(e) => return Err(RpcError::unavailable(e.to_string())),
        };
        let mut out = Vec::with_capacity(entries.len());
        for entry in entries {
            out.push(self.decode(&entry.value)?);
        }
        Ok(out)
    }
}
