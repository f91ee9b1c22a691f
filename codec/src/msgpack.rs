use crate::Codec;
use serde::{Deserialize, Serialize};

/// msgpack nil, what an empty body decodes as
const NIL: &'static [u8] = &[0xc0];

/// Binary encoding mode.
///
/// Structs must go out as maps keyed by field name (`to_vec_named`, `write_named`): the server
/// decodes a request into a dynamic value to resolve persistence keys by field, and the
/// compact array form carries no names.
#[derive(Default, Clone, Copy, Debug)]
pub struct MsgpCodec();

impl Codec for MsgpCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, task: &T) -> Result<Vec<u8>, ()> {
        rmp_serde::to_vec_named(task).map_err(|e| {
            log::error!("msgpack encode {}: {:?}", std::any::type_name::<T>(), e);
        })
    }

    /// Append to `buf`, returns the bytes written.
    fn encode_into<T: Serialize>(&self, task: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let start = buf.len();
        rmp_serde::encode::write_named(buf, task).map_err(|e| {
            log::error!("msgpack encode {}: {:?}", std::any::type_name::<T>(), e);
        })?;
        Ok(buf.len() - start)
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        let buf: &'a [u8] = if buf.is_empty() { NIL } else { buf };
        rmp_serde::from_slice::<T>(buf).map_err(|e| {
            log::warn!("msgpack decode {} ({} bytes): {}", std::any::type_name::<T>(), buf.len(), e);
        })
    }
}
