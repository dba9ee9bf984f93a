//! spindle-codec: canonical binary encoding for all spindle wire messages.
//!
//! Every message is a flat sequence of tagged fields. A field is
//! `[id: u8][len: u32 BE][payload]`; ids are emitted in ascending order,
//! absent optionals are simply not emitted, and readers skip unknown ids,
//! which is what keeps the encoding forward-compatible. All integers are
//! big-endian.
//!
//! Discovery packets ride UDP datagrams behind a 5-byte magic/version
//! header and are clamped to the IPv6 minimum MTU. Key-value messages ride
//! any reliable stream behind a 4-byte length prefix.

pub mod frame;
pub mod hello;
pub mod kv;
pub mod wire;

pub use frame::{decode_frame, encode_frame, MAX_FRAME_SIZE};
pub use hello::{HelloMsg, HelloPacket, HandshakeMsg, HeartbeatMsg, LegacyHelloPayload, ReflectedNeighborInfo};
pub use kv::{
    Ack, DualMessage, DualMessages, DualMsgType, DumpRequest, FloodTopoSet, GetRequest, KvMessage,
    Publication, SetRequest,
};

/// Errors surfaced while encoding or decoding wire messages.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("truncated message")]
    Truncated,

    #[error("bad magic bytes")]
    BadMagic,

    #[error("unsupported wire version {0}")]
    UnsupportedWireVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("field {0} is not valid UTF-8")]
    InvalidUtf8(u8),

    #[error("field {field} has length {len}, expected {expected}")]
    BadFieldLength { field: u8, len: usize, expected: usize },

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    Oversize { len: usize, max: usize },

    #[error("invalid enum discriminant {0}")]
    InvalidDiscriminant(u8),
}
