#![cfg_attr(docsrs, feature(doc_cfg))]
#![cfg_attr(docsrs, allow(unused_attributes))]

//! # micro-rpc-codec
//!
//! This crate provides [micro_rpc_core::Codec] implementations for the two encoding modes a
//! service may declare: `msgpack` for [Encoding::Binary] and `json` for [Encoding::Text].
//! [AnyCodec] picks one at run time from a service descriptor.

pub use micro_rpc_core::{Codec, Encoding};
use serde::{Deserialize, Serialize};

#[cfg(feature = "msgpack")]
mod msgpack;
#[cfg(feature = "msgpack")]
pub use msgpack::*;
#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::*;

/// Codec selected by a service's [Encoding].
#[derive(Clone, Copy, Debug)]
pub enum AnyCodec {
    #[cfg(feature = "msgpack")]
    Msgp(MsgpCodec),
    #[cfg(feature = "json")]
    Json(JsonCodec),
}

impl AnyCodec {
    #[inline]
    pub fn new(encoding: Encoding) -> Self {
        match encoding {
            #[cfg(feature = "msgpack")]
            Encoding::Binary => Self::Msgp(MsgpCodec::default()),
            #[cfg(feature = "json")]
            Encoding::Text => Self::Json(JsonCodec::default()),
            #[allow(unreachable_patterns)]
            _ => Self::default(),
        }
    }

    #[inline]
    pub fn encoding(&self) -> Encoding {
        match self {
            #[cfg(feature = "msgpack")]
            Self::Msgp(_) => Encoding::Binary,
            #[cfg(feature = "json")]
            Self::Json(_) => Encoding::Text,
        }
    }
}

impl Default for AnyCodec {
    #[inline]
    fn default() -> Self {
        #[cfg(feature = "msgpack")]
        return Self::Msgp(MsgpCodec::default());
        #[cfg(not(feature = "msgpack"))]
        return Self::Json(JsonCodec::default());
    }
}

impl From<Encoding> for AnyCodec {
    #[inline]
    fn from(e: Encoding) -> Self {
        Self::new(e)
    }
}

impl Codec for AnyCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, task: &T) -> Result<Vec<u8>, ()> {
        match self {
            #[cfg(feature = "msgpack")]
            Self::Msgp(c) => c.encode(task),
            #[cfg(feature = "json")]
            Self::Json(c) => c.encode(task),
        }
    }

    #[inline(always)]
    fn encode_into<T: Serialize>(&self, task: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        match self {
            #[cfg(feature = "msgpack")]
            Self::Msgp(c) => c.encode_into(task, buf),
            #[cfg(feature = "json")]
            Self::Json(c) => c.encode_into(task, buf),
        }
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        match self {
            #[cfg(feature = "msgpack")]
            Self::Msgp(c) => c.decode(buf),
            #[cfg(feature = "json")]
            Self::Json(c) => c.decode(buf),
        }
    }
}
