use crate::Codec;
use serde::{Deserialize, Serialize};

/// Textual encoding mode.
#[derive(Default, Clone, Copy, Debug)]
pub struct JsonCodec();

impl Codec for JsonCodec {
    #[inline(always)]
    fn encode<T: Serialize>(&self, task: &T) -> Result<Vec<u8>, ()> {
        match serde_json::to_vec(task) {
            Ok(buf) => return Ok(buf),
            Err(e) => {
                log::error!("json encode error: {:?}", e);
                return Err(());
            }
        }
    }

    fn encode_into<T: Serialize>(&self, task: &T, buf: &mut Vec<u8>) -> Result<usize, ()> {
        let pre_len = buf.len();
        if let Err(e) = serde_json::to_writer(&mut *buf, task) {
            log::error!("json encode error: {:?}", e);
            return Err(());
        }
        Ok(buf.len() - pre_len)
    }

    #[inline(always)]
    fn decode<'a, T: Deserialize<'a>>(&self, buf: &'a [u8]) -> Result<T, ()> {
        // An empty body stands for the empty message
        let buf: &'a [u8] = if buf.is_empty() { b"null" } else { buf };
        match serde_json::from_slice::<T>(buf) {
            Err(e) => {
                log::warn!("json decode error: {:?}", e);
                return Err(());
            }
            Ok(s) => return Ok(s),
        }
    }
}
