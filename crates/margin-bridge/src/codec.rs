//! Native-messaging frame codec
//!
//! Each frame is a 4-byte little-endian length followed by that many bytes of
//! UTF-8 JSON. Partial frames stay in the read buffer until the rest arrives.

use bytes::{Buf, BufMut, BytesMut};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::BridgeError;

const HEADER_LEN: usize = 4;

/// Largest message a browser host accepts from a native application
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct NativeMessageCodec {
    max_frame_len: usize,
}

impl Default for NativeMessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl NativeMessageCodec {
    pub fn new() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for NativeMessageCodec {
    type Item = Value;
    type Error = BridgeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, BridgeError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let len = u32::from_le_bytes(header) as usize;
        if len > self.max_frame_len {
            return Err(BridgeError::FrameTooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(len);
        let value = serde_json::from_slice(&body)?;
        Ok(Some(value))
    }
}

impl Encoder<Value> for NativeMessageCodec {
    type Error = BridgeError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), BridgeError> {
        let body = serde_json::to_vec(&item)?;
        if body.len() > self.max_frame_len {
            return Err(BridgeError::FrameTooLarge {
                len: body.len(),
                max: self.max_frame_len,
            });
        }

        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32_le(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
