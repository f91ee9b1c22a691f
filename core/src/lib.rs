//! # micro-rpc-core
//!
//! This crate provides the core types for [`micro-rpc`](https://docs.rs/micro-rpc).
//! It includes the error envelope, the codec trait, per-call context, and the traits for the
//! collaborators the runtime is built on (message bus, key-value store, blob store).

mod codec;
pub use codec::{Codec, Encoding};
mod config;
pub use config::*;
pub mod context;
pub mod error;
pub mod header;
pub mod store;
pub mod transport;

pub use context::CallContext;
pub use error::{Code, ErrorEnvelope, RpcError, RpcIntErr, ToEnvelope};
pub use header::Headers;
pub use transport::{Message, Subscription, Transport};
