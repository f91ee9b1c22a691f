//! Middleware around unary calls, on both sides of the bus.
//!
//! Interceptors see the encoded request and the [CallContext], and get a `next` continuation
//! they must call to proceed, or skip to short-circuit. A chain is folded into one handler when
//! the service (or client) is built, the first interceptor registered being the outermost.
//!
//! Streaming calls do not pass through interceptors.

use bytes::Bytes;
use futures::future::BoxFuture;
use micro_rpc_core::{CallContext, ErrorEnvelope, RpcError};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Static facts about the endpoint a server call was routed to.
#[derive(Debug, Clone, PartialEq)]
pub struct CallInfo {
    pub service: String,
    pub method: String,
    pub subject: String,
}

pub struct ServerCall {
    pub info: Arc<CallInfo>,
    pub ctx: CallContext,
    pub request: Bytes,
}

impl fmt::Debug for ServerCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{} ({} bytes)", self.info.service, self.info.method, self.request.len())
    }
}

pub type UnaryHandler =
    Arc<dyn Fn(ServerCall) -> BoxFuture<'static, Result<Bytes, ErrorEnvelope>> + Send + Sync>;

pub trait ServerInterceptor: Send + Sync + 'static {
    fn intercept(
        &self, call: ServerCall, next: UnaryHandler,
    ) -> BoxFuture<'static, Result<Bytes, ErrorEnvelope>>;
}

impl<F> ServerInterceptor for F
where
    F: Fn(ServerCall, UnaryHandler) -> BoxFuture<'static, Result<Bytes, ErrorEnvelope>>
        + Send
        + Sync
        + 'static,
{
    #[inline]
    fn intercept(
        &self, call: ServerCall, next: UnaryHandler,
    ) -> BoxFuture<'static, Result<Bytes, ErrorEnvelope>> {
        (self)(call, next)
    }
}

/// Wrap `handler` so that `interceptors[0]` runs first and unwinds last.
pub fn chain_server(interceptors: &[Arc<dyn ServerInterceptor>], handler: UnaryHandler) -> UnaryHandler {
    interceptors.iter().rev().fold(handler, |next, ic| {
        let ic = ic.clone();
        Arc::new(move |call: ServerCall| ic.intercept(call, next.clone()))
    })
}

pub struct ClientCall {
    pub service: String,
    pub method: String,
    pub subject: String,
    pub ctx: CallContext,
    pub request: Bytes,
    /// Resolved timeout, the context deadline applies on top
    pub timeout: Option<Duration>,
}

impl fmt::Debug for ClientCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({} bytes, timeout {:?})", self.subject, self.request.len(), self.timeout)
    }
}

pub type UnaryInvoker =
    Arc<dyn Fn(ClientCall) -> BoxFuture<'static, Result<Bytes, RpcError>> + Send + Sync>;

pub trait ClientInterceptor: Send + Sync + 'static {
    fn intercept(
        &self, call: ClientCall, next: UnaryInvoker,
    ) -> BoxFuture<'static, Result<Bytes, RpcError>>;
}

impl<F> ClientInterceptor for F
where
    F: Fn(ClientCall, UnaryInvoker) -> BoxFuture<'static, Result<Bytes, RpcError>>
        + Send
        + Sync
        + 'static,
{
    #[inline]
    fn intercept(
        &self, call: ClientCall, next: UnaryInvoker,
    ) -> BoxFuture<'static, Result<Bytes, RpcError>> {
        (self)(call, next)
    }
}

pub fn chain_client(interceptors: &[Arc<dyn ClientInterceptor>], invoker: UnaryInvoker) -> UnaryInvoker {
    interceptors.iter().rev().fold(invoker, |next, ic| {
        let ic = ic.clone();
        Arc::new(move |call: ClientCall| ic.intercept(call, next.clone()))
    })
}
