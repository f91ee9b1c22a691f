//! Handler side of a service.
//!
//! A service is assembled with [ServiceBuilder]: one handler per non-skipped endpoint, registered
//! with the method matching the endpoint's shape, plus optional interceptors and stores. All
//! wiring mistakes are reported as [ConfigError] before anything subscribes to the bus.
//! [ServiceBuilder::start] then subscribes every endpoint and returns the running [Service].
//!
//! ```ignore
//! let svc = Service::builder(desc, transport)
//!     .with_interceptor(auth)
//!     .with_kv_store(kv)
//!     .unary("GetProfile", |ctx: CallContext, req: GetProfileRequest| async move {
//!         Ok::<_, ErrorEnvelope>(Profile { id: req.id, name: "Ada".to_string() })
//!     })?
//!     .start()
//!     .await?;
//! ```

mod dispatch;
mod registry;

pub use dispatch::EndpointStats;
pub use registry::{DISCOVERY_PREFIX, PingInfo, ServiceInfo, ServiceStats};

use crate::descriptor::{ServiceDescriptor, Shape, valid_prefix};
use crate::interceptor::{CallInfo, ServerCall, ServerInterceptor, UnaryHandler, chain_server};
use crate::key_template::validate_for;
use crate::persist::{BoundRule, Stores};
use crate::subject::{self, EndpointInfo};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use dispatch::{Endpoint, Handler, ServiceShared, StreamCall, StreamHandler, guarded};
use futures::FutureExt;
use micro_rpc_codec::{AnyCodec, Codec};
use micro_rpc_core::error::ConfigError;
use micro_rpc_core::store::{BlobStore, KvStore};
use micro_rpc_core::transport::Transport;
use micro_rpc_core::{CallContext, ErrorEnvelope, ServerConfig, ToEnvelope};
use micro_rpc_stream::server::{
    ServerBidiStream, ServerRecvStream, ServerSendStream, accept_bidi, accept_client_stream,
    accept_server_stream, reject, reply_aggregate,
};
use registry::Verb;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ServiceBuilder {
    desc: ServiceDescriptor,
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    interceptors: Vec<Arc<dyn ServerInterceptor>>,
    stores: Stores,
    handlers: BTreeMap<String, Handler>,
}

impl ServiceBuilder {
    #[inline]
    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Interceptors wrap unary handlers in the order they are added, the first one outermost.
    #[inline]
    pub fn with_interceptor(mut self, ic: impl ServerInterceptor) -> Self {
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

    /// Check that `method` is declared with `shape` and has no handler yet.
    fn check(&self, method: &str, shape: Shape) -> Result<(), ConfigError> {
        let ep = match self.desc.endpoint(method) {
            Some(ep) => ep,
            None => {
                return Err(ConfigError::UnknownEndpoint {
                    service: self.desc.name.clone(),
                    method: method.to_string(),
                });
            }
        };
        if ep.shape != shape {
            return Err(ConfigError::ShapeMismatch {
                service: self.desc.name.clone(),
                method: method.to_string(),
                declared: ep.shape.to_string(),
                registered: shape.to_string(),
            });
        }
        if self.handlers.contains_key(method) {
            return Err(ConfigError::DuplicateHandler {
                service: self.desc.name.clone(),
                method: method.to_string(),
            });
        }
        Ok(())
    }

    #[inline]
    fn codec(&self) -> AnyCodec {
        AnyCodec::new(self.desc.encoding)
    }

    pub fn unary<Req, Resp, E, F, Fut>(mut self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: ToEnvelope + Send + 'static,
        F: Fn(CallContext, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        self.check(method, Shape::Unary)?;
        if let Some(rule) = self.desc.endpoint(method).and_then(|ep| ep.persistence.as_ref()) {
            validate_for::<Req>(&rule.template()?, std::any::type_name::<Req>())?;
        }
        let codec = self.codec();
        let f = Arc::new(f);
        let handler: UnaryHandler = Arc::new(move |call: ServerCall| {
            let f = f.clone();
            async move {
                let req: Req = match codec.decode(&call.request) {
                    Ok(req) => req,
                    Err(()) => return Err(ErrorEnvelope::invalid_argument("cannot decode request")),
                };
                let resp = match f(call.ctx, req).await {
                    Ok(resp) => resp,
                    Err(e) => return Err(e.to_envelope()),
                };
                match codec.encode(&resp) {
                    Ok(buf) => Ok(Bytes::from(buf)),
                    Err(()) => Err(ErrorEnvelope::internal("cannot encode response")),
                }
            }
            .boxed()
        });
        self.handlers.insert(method.to_string(), Handler::Unary(handler));
        Ok(self)
    }

    /// The handler sends any number of messages; its return emits the end marker, carrying
    /// the error if any.
    pub fn server_stream<Req, Resp, E, F, Fut>(mut self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: ToEnvelope + Send + 'static,
        F: Fn(CallContext, Req, ServerSendStream<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.check(method, Shape::ServerStream)?;
        let f = Arc::new(f);
        let handler: StreamHandler = Arc::new(move |call: StreamCall| {
            let f = f.clone();
            async move {
                let req: Req = match call.codec.decode(&call.msg.payload) {
                    Ok(req) => req,
                    Err(()) => {
                        let e = ErrorEnvelope::invalid_argument("cannot decode request");
                        reject(&call.transport, &call.msg, &e).await;
                        return Err(e);
                    }
                };
                let stream =
                    match accept_server_stream::<Resp>(&call.transport, &call.msg, call.codec, &call.ctx).await {
                        Ok(stream) => stream,
                        Err(e) => return Err(refuse(&call, e.to_envelope()).await),
                    };
                let res = call.conclude(guarded(f(call.ctx.clone(), req, stream.clone())).await);
                stream.finish(res.clone(), call.ctx.seal_response()).await;
                res
            }
            .boxed()
        });
        self.handlers.insert(method.to_string(), Handler::Stream(Shape::ServerStream, handler));
        Ok(self)
    }

    /// The handler receives until the caller's end of input, then returns the single response.
    pub fn client_stream<Req, Resp, E, F, Fut>(mut self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: ToEnvelope + Send + 'static,
        F: Fn(CallContext, ServerRecvStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, E>> + Send + 'static,
    {
        self.check(method, Shape::ClientStream)?;
        let f = Arc::new(f);
        let handler: StreamHandler = Arc::new(move |call: StreamCall| {
            let f = f.clone();
            async move {
                let accepted = match accept_client_stream::<Req>(
                    &call.transport,
                    &call.msg,
                    call.codec,
                    &call.ctx,
                    call.idle_timeout,
                )
                .await
                {
                    Ok(accepted) => accepted,
                    Err(e) => return Err(refuse(&call, e.to_envelope()).await),
                };
                let res = call.conclude(guarded(f(call.ctx.clone(), accepted.stream.clone())).await);
                accepted.stream.finish().await;
                let out = match res {
                    Ok(resp) => match call.codec.encode(&resp) {
                        Ok(buf) => Ok(Bytes::from(buf)),
                        Err(()) => Err(ErrorEnvelope::internal("cannot encode response")),
                    },
                    Err(e) => Err(e),
                };
                let ret = match &out {
                    Ok(_) => Ok(()),
                    Err(e) => Err(e.clone()),
                };
                reply_aggregate(&call.transport, &accepted.reply, out, call.ctx.seal_response()).await;
                ret
            }
            .boxed()
        });
        self.handlers.insert(method.to_string(), Handler::Stream(Shape::ClientStream, handler));
        Ok(self)
    }

    /// Both directions at once; the handler's return ends the outgoing direction.
    pub fn bidi<Req, Resp, E, F, Fut>(mut self, method: &str, f: F) -> Result<Self, ConfigError>
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        E: ToEnvelope + Send + 'static,
        F: Fn(CallContext, ServerBidiStream<Req, Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.check(method, Shape::Bidi)?;
        let f = Arc::new(f);
        let handler: StreamHandler = Arc::new(move |call: StreamCall| {
            let f = f.clone();
            async move {
                let stream = match accept_bidi::<Req, Resp>(
                    &call.transport,
                    &call.msg,
                    call.codec,
                    &call.ctx,
                    call.idle_timeout,
                )
                .await
                {
                    Ok(stream) => stream,
                    Err(e) => return Err(refuse(&call, e.to_envelope()).await),
                };
                let res = call.conclude(guarded(f(call.ctx.clone(), stream.clone())).await);
                stream.finish(res.clone(), call.ctx.seal_response()).await;
                res
            }
            .boxed()
        });
        self.handlers.insert(method.to_string(), Handler::Stream(Shape::Bidi, handler));
        Ok(self)
    }

    /// Validate the wiring, subscribe every active endpoint and start serving.
    pub async fn start(mut self) -> Result<Service, ConfigError> {
        self.desc.validate()?;
        if let Some(prefix) = &self.config.subject_prefix {
            if !valid_prefix(prefix) {
                return Err(ConfigError::InvalidSubject(prefix.clone()));
            }
        }
        let prefix = self.config.subject_prefix.clone();
        let mut endpoints = Vec::new();
        for ep in self.desc.active_endpoints() {
            let handler = match self.handlers.remove(&ep.name) {
                Some(h) => h,
                None => {
                    return Err(ConfigError::MissingHandler {
                        service: self.desc.name.clone(),
                        method: ep.name.clone(),
                    });
                }
            };
            debug_assert_eq!(handler.shape(), ep.shape);
            let handler = match handler {
                Handler::Unary(h) => Handler::Unary(chain_server(&self.interceptors, h)),
                other => other,
            };
            let rule = match &ep.persistence {
                Some(rule) => Some(BoundRule::new(rule)?),
                None => None,
            };
            let resolved = subject::resolve(&self.desc, ep, prefix.as_deref(), None);
            let info = CallInfo {
                service: self.desc.name.clone(),
                method: ep.name.clone(),
                subject: resolved.subject,
            };
            endpoints.push(Arc::new(Endpoint::new(info, handler, rule, self.config.thresholds)));
        }

        let id = uuid::Uuid::new_v4().simple().to_string();
        let mut subs = Vec::with_capacity(endpoints.len());
        for ep in &endpoints {
            let subject = &ep.info.subject;
            match self.transport.subscribe(subject, Some(&self.config.queue_group)).await {
                Ok(sub) => subs.push(sub),
                Err(err) => return Err(ConfigError::Subscribe { subject: subject.clone(), err }),
            }
        }
        let mut discovery = Vec::new();
        if self.config.discovery {
            for verb in Verb::ALL {
                for subject in verb.subjects(&self.desc.name, &id) {
                    match self.transport.subscribe(&subject, None).await {
                        Ok(sub) => discovery.push((verb, sub)),
                        Err(err) => return Err(ConfigError::Subscribe { subject, err }),
                    }
                }
            }
        }

        let logger = Arc::new(LogFilter::new());
        let shared = Arc::new(ServiceShared {
            codec: AnyCodec::new(self.desc.encoding),
            desc: Arc::new(self.desc),
            id,
            transport: self.transport,
            config: self.config,
            stores: self.stores,
            cancel: CancellationToken::new(),
            logger,
            endpoints,
        });
        let mut tasks = Vec::with_capacity(subs.len() + discovery.len());
        for (ep, sub) in shared.endpoints.iter().zip(subs) {
            tasks.push(tokio::spawn(dispatch::serve(shared.clone(), ep.clone(), sub)));
        }
        for (verb, sub) in discovery {
            tasks.push(tokio::spawn(registry::serve_discovery(shared.clone(), verb, sub)));
        }
        logger_debug!(
            shared.logger,
            "service {} {} started with {} endpoints",
            shared.desc.name,
            shared.id,
            shared.endpoints.len()
        );
        Ok(Service { shared, tasks: Mutex::new(tasks), stopped: AtomicBool::new(false) })
    }
}

/// Tell the caller a stream could not be set up.
async fn refuse(call: &StreamCall, e: ErrorEnvelope) -> ErrorEnvelope {
    logger_warn!(call.logger, "{}: cannot accept stream: {}", call.msg.subject, e);
    reject(&call.transport, &call.msg, &e).await;
    e
}

/// A running service. Dropping it stops serving without waiting for in-flight calls.
pub struct Service {
    shared: Arc<ServiceShared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "service({} {})", self.shared.desc.name, self.shared.id)
    }
}

impl Service {
    pub fn builder(desc: ServiceDescriptor, transport: Arc<dyn Transport>) -> ServiceBuilder {
        ServiceBuilder {
            desc,
            transport,
            config: ServerConfig::default(),
            interceptors: Vec::new(),
            stores: Stores::default(),
            handlers: BTreeMap::new(),
        }
    }

    /// Random per start.
    #[inline]
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    #[inline]
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.shared.desc
    }

    #[inline]
    pub fn logger(&self) -> &Arc<LogFilter> {
        &self.shared.logger
    }

    pub fn endpoints(&self) -> Vec<EndpointInfo> {
        self.shared.endpoint_infos()
    }

    pub fn info(&self) -> ServiceInfo {
        self.shared.info()
    }

    pub fn stats(&self) -> ServiceStats {
        self.shared.stats()
    }

    pub fn reset_stats(&self) {
        for ep in &self.shared.endpoints {
            ep.reset_stats();
        }
    }

    #[inline]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Unsubscribe every endpoint, cancel the contexts of running handlers, then wait up to
    /// `stop_wait` for in-flight calls. Returns false when some were still running.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return true;
        }
        let shared = &self.shared;
        shared.cancel.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        let deadline = tokio::time::Instant::now() + shared.config.stop_wait;
        let mut drained = true;
        for ep in &shared.endpoints {
            match tokio::time::timeout_at(deadline, ep.sem.acquire_many(ep.permits)).await {
                Ok(Ok(_permits)) => {}
                _ => {
                    logger_warn!(shared.logger, "{:?}: {} still busy after stop_wait", self, ep.info.subject);
                    drained = false;
                }
            }
        }
        logger_debug!(shared.logger, "{:?} stopped, drained={}", self, drained);
        drained
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}
