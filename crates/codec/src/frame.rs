//! Length-prefixed framing for the key-value stream.
//!
//! A frame is `[len: u32 BE][body]` where the body is one encoded
//! [`KvMessage`]. The async read/write halves live with the store's
//! transport; this module is the pure byte layer.

use crate::kv::KvMessage;
use crate::CodecError;
use bytes::{Buf, BufMut};

/// Upper bound on one frame body. Anything larger is treated as a protocol
/// error rather than a buffer to allocate.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Encode one message as a length-prefixed frame.
pub fn encode_frame(msg: &KvMessage) -> Vec<u8> {
    let body = msg.encode();
    let mut out = Vec::with_capacity(body.len() + 4);
    out.put_u32(body.len() as u32);
    out.put_slice(&body);
    out
}

/// Decode one frame from the front of `buf`. Returns the message and the
/// number of bytes consumed, or `None` when the buffer does not yet hold a
/// complete frame.
pub fn decode_frame(mut buf: &[u8]) -> Result<Option<(KvMessage, usize)>, CodecError> {
    if buf.remaining() < 4 {
        return Ok(None);
    }
    let len = buf.get_u32() as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::Oversize {
            len,
            max: MAX_FRAME_SIZE,
        });
    }
    if buf.remaining() < len {
        return Ok(None);
    }
    let msg = KvMessage::decode(&buf[..len])?;
    Ok(Some((msg, 4 + len)))
}
