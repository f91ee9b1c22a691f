#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # micro-rpc-stream
//!
//! This crate provides the streaming shapes of [`micro-rpc`](https://docs.rs/micro-rpc):
//! server-streaming, client-streaming and bidirectional calls, carried over ephemeral bus
//! inboxes with explicit sequence numbers and end markers.
//!
//! ## Components
//!
//! - [proto]: frame layout (handshake, data, end, error) in message metadata.
//! - [session]: one direction of a session, owning its sequence counter or its subscription.
//! - [client]: caller side handles.
//! - [server]: handler side handles and the accept functions the dispatcher uses.

#[macro_use]
extern crate captains_log;

pub mod client;
pub mod proto;
pub mod server;
pub mod session;

pub use client::{ClientBidiStream, ClientRecvStream, ClientSendStream, StreamOptions};
pub use server::{ServerBidiStream, ServerRecvStream, ServerSendStream};
