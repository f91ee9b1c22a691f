//! Per-endpoint dispatch loop.
//!
//! Each active endpoint owns one queue-group subscription. Every inbound message is handled in
//! its own task, at most `thresholds` at a time per endpoint. Handler failures (errors and
//! panics alike) are turned into an [ErrorEnvelope] at this boundary and never take the loop
//! down.

use crate::descriptor::{ServiceDescriptor, Shape};
use crate::interceptor::{CallInfo, ServerCall, UnaryHandler};
use crate::persist::{self, BoundRule, Stores};
use bytes::Bytes;
use captains_log::filter::LogFilter;
use futures::FutureExt;
use futures::future::BoxFuture;
use micro_rpc_codec::AnyCodec;
use micro_rpc_core::transport::{Message, Subscription, Transport};
use micro_rpc_core::{CallContext, ErrorEnvelope, ServerConfig, ToEnvelope};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Everything a stream handler needs to accept and drive one streaming call.
pub(crate) struct StreamCall {
    pub transport: Arc<dyn Transport>,
    pub msg: Message,
    pub ctx: CallContext,
    pub codec: AnyCodec,
    pub idle_timeout: Option<Duration>,
    pub service: Arc<ServiceDescriptor>,
    pub logger: Arc<LogFilter>,
}

impl StreamCall {
    #[inline]
    pub fn conclude<T>(&self, res: Result<T, ErrorEnvelope>) -> Result<T, ErrorEnvelope> {
        restrict_code(&self.service, &self.logger, res)
    }
}

/// Runs a whole streaming call, accept to end marker, and reports how it ended.
pub(crate) type StreamHandler =
    Arc<dyn Fn(StreamCall) -> BoxFuture<'static, Result<(), ErrorEnvelope>> + Send + Sync>;

pub(crate) enum Handler {
    Unary(UnaryHandler),
    Stream(Shape, StreamHandler),
}

impl Handler {
    #[inline]
    pub fn shape(&self) -> Shape {
        match self {
            Self::Unary(_) => Shape::Unary,
            Self::Stream(shape, _) => *shape,
        }
    }
}

/// Await a user handler, mapping its error and any panic to an envelope.
pub(crate) async fn guarded<T, E, F>(fut: F) -> Result<T, ErrorEnvelope>
where
    E: ToEnvelope,
    F: Future<Output = Result<T, E>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.to_envelope()),
        Err(_) => Err(ErrorEnvelope::internal("handler panicked")),
    }
}

/// A code the service did not declare goes out as `INTERNAL`.
pub(crate) fn restrict_code<T>(
    desc: &ServiceDescriptor, logger: &LogFilter, res: Result<T, ErrorEnvelope>,
) -> Result<T, ErrorEnvelope> {
    match res {
        Err(e) if !desc.declares(&e.code) => {
            logger_warn!(logger, "{}: undeclared error code {}, reply INTERNAL: {}", desc.name, e.code, e.message);
            Err(ErrorEnvelope::internal(e.message))
        }
        other => other,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointStats {
    pub name: String,
    pub subject: String,
    pub num_requests: u64,
    pub num_errors: u64,
    pub last_error: String,
    pub processing_time: Duration,
    pub average_processing_time: Duration,
}

pub(crate) struct Endpoint {
    pub info: Arc<CallInfo>,
    pub handler: Handler,
    pub rule: Option<BoundRule>,
    pub sem: Arc<Semaphore>,
    pub permits: u32,
    pub stats: Mutex<EndpointStats>,
}

/// State shared by the dispatch loops and the handle of a running service.
pub(crate) struct ServiceShared {
    pub desc: Arc<ServiceDescriptor>,
    pub id: String,
    pub transport: Arc<dyn Transport>,
    pub config: ServerConfig,
    pub codec: AnyCodec,
    pub stores: Stores,
    pub cancel: CancellationToken,
    pub logger: Arc<LogFilter>,
    pub endpoints: Vec<Arc<Endpoint>>,
}

impl Endpoint {
    pub fn new(info: CallInfo, handler: Handler, rule: Option<BoundRule>, thresholds: usize) -> Self {
        let permits = thresholds.clamp(1, Semaphore::MAX_PERMITS.min(u32::MAX as usize)) as u32;
        let stats = EndpointStats {
            name: info.method.clone(),
            subject: info.subject.clone(),
            ..Default::default()
        };
        Self {
            info: Arc::new(info),
            handler,
            rule,
            sem: Arc::new(Semaphore::new(permits as usize)),
            permits,
            stats: Mutex::new(stats),
        }
    }

    fn record(&self, shared: &ServiceShared, start: Instant, err: Option<&ErrorEnvelope>) {
        let elapsed = start.elapsed();
        if let Some(e) = err {
            logger_debug!(shared.logger, "{} failed: {}", self.info.subject, e);
        }
        let mut s = self.stats.lock().unwrap();
        s.num_requests += 1;
        s.processing_time += elapsed;
        s.average_processing_time =
            Duration::from_nanos((s.processing_time.as_nanos() / s.num_requests as u128) as u64);
        if let Some(e) = err {
            s.num_errors += 1;
            s.last_error = e.to_string();
        }
    }

    pub fn reset_stats(&self) {
        let mut s = self.stats.lock().unwrap();
        *s = EndpointStats {
            name: self.info.method.clone(),
            subject: self.info.subject.clone(),
            ..Default::default()
        };
    }

    async fn handle(&self, shared: &ServiceShared, msg: Message) {
        let start = Instant::now();
        let ctx = CallContext::new().with_cancel(shared.cancel.child_token());
        let mut incoming = msg.headers.clone();
        incoming.strip_reserved();
        ctx.set_incoming(incoming);
        match &self.handler {
            Handler::Unary(handler) => self.handle_unary(shared, handler, msg, ctx, start).await,
            Handler::Stream(_, handler) => {
                let call = StreamCall {
                    transport: shared.transport.clone(),
                    msg,
                    ctx,
                    codec: shared.codec,
                    idle_timeout: shared.config.stream_idle_timeout,
                    service: shared.desc.clone(),
                    logger: shared.logger.clone(),
                };
                let res = match AssertUnwindSafe(async move { handler(call).await }).catch_unwind().await {
                    Ok(res) => res,
                    Err(_) => Err(ErrorEnvelope::internal("stream dispatch panicked")),
                };
                self.record(shared, start, res.as_ref().err());
            }
        }
    }

    async fn handle_unary(
        &self, shared: &ServiceShared, handler: &UnaryHandler, msg: Message, ctx: CallContext,
        start: Instant,
    ) {
        let request = msg.payload;
        let call = ServerCall { info: self.info.clone(), ctx: ctx.clone(), request: request.clone() };
        let res = match AssertUnwindSafe(async move { handler(call).await }).catch_unwind().await {
            Ok(res) => res,
            Err(_) => {
                logger_error!(shared.logger, "{}: handler panicked", self.info.subject);
                Err(ErrorEnvelope::internal("handler panicked"))
            }
        };
        let res = restrict_code(&shared.desc, &shared.logger, res);
        if let (Ok(resp), Some(bound)) = (&res, &self.rule) {
            persist::after_success(&shared.stores, bound, &shared.codec, &request, resp.clone(), &shared.logger)
                .await;
        }
        self.record(shared, start, res.as_ref().err());
        let reply = match msg.reply {
            Some(reply) => reply,
            None => {
                logger_debug!(shared.logger, "{}: no reply subject, response dropped", self.info.subject);
                return;
            }
        };
        let mut headers = ctx.seal_response();
        headers.strip_reserved();
        let out = match &res {
            Ok(resp) => Message::new(reply, resp.clone()).with_headers(headers),
            Err(e) => {
                let body: Bytes = e.encode(&mut headers);
                Message::new(reply, body).with_headers(headers)
            }
        };
        if let Err(e) = shared.transport.publish(out).await {
            logger_warn!(shared.logger, "{}: reply not delivered: {}", self.info.subject, e);
        }
    }
}

/// Receive loop of one endpoint, ends when the service stops or the bus drops the subscription.
pub(crate) async fn serve(shared: Arc<ServiceShared>, ep: Arc<Endpoint>, sub: Subscription) {
    logger_debug!(shared.logger, "{} serving {:?}", shared.desc.name, sub);
    loop {
        let msg = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            msg = sub.next() => match msg {
                Some(msg) => msg,
                None => {
                    logger_warn!(shared.logger, "{:?} closed by the bus", sub);
                    break;
                }
            },
        };
        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            permit = ep.sem.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let (shared, ep) = (shared.clone(), ep.clone());
        tokio::spawn(async move {
            ep.handle(&shared, msg).await;
            drop(permit);
        });
    }
    logger_debug!(shared.logger, "{} unsubscribe {:?}", shared.desc.name, sub);
    sub.unsubscribe();
}
