#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # micro-rpc-mem
//!
//! In-process implementations of the collaborators [`micro-rpc`](https://docs.rs/micro-rpc) runs
//! on: a message bus with subject wildcards, queue groups and reply inboxes, a key-value store
//! with TTL and revision history, and a chunked blob store.
//!
//! All three are `Clone`, clones share the same state.

#[macro_use]
extern crate captains_log;

mod blob;
pub use blob::*;
mod bus;
pub use bus::*;
mod kv;
pub use kv::*;
