//! # micro-rpc
//!
//! Typed request/reply and streaming RPC over a publish/subscribe message bus.
//!
//! A [ServiceDescriptor] names the service, its endpoints and their shapes. The same descriptor
//! drives both sides: [Service] subscribes one queue group per endpoint and dispatches to typed
//! handlers, [Client] resolves subjects and timeouts and calls them. Unary responses may be
//! persisted to a key-value or blob store under a key derived from the request.
//!
//! The bus and the stores are traits from [micro_rpc_core]; `micro-rpc-mem` provides in-process
//! implementations.

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod descriptor;
pub mod interceptor;
pub mod key_template;
pub mod persist;
pub mod server;
pub mod subject;

pub use client::{Client, ClientBuilder};
pub use descriptor::{
    EndpointDescriptor, PersistenceRule, ServiceDescriptor, ServiceDescriptorBuilder, Shape, StoreKind,
};
pub use interceptor::{
    CallInfo, ClientCall, ClientInterceptor, ServerCall, ServerInterceptor, UnaryHandler, UnaryInvoker,
};
pub use persist::Stores;
pub use server::{EndpointStats, PingInfo, Service, ServiceBuilder, ServiceInfo, ServiceStats};
pub use subject::EndpointInfo;

pub use micro_rpc_core::error::ConfigError;
pub use micro_rpc_core::{
    CallContext, ClientConfig, Code, Encoding, ErrorEnvelope, Headers, RpcError, RpcIntErr, ServerConfig,
    ToEnvelope,
};
pub use micro_rpc_stream::{
    ClientBidiStream, ClientRecvStream, ClientSendStream, ServerBidiStream, ServerRecvStream, ServerSendStream,
};
