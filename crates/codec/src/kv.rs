//! Key-value wire forms and the request/response envelope carried over a
//! reliable stream.

use crate::wire::{
    read_bool, read_elements, read_i64, read_str, read_str_list, read_u64, read_u8,
    write_elements, write_str_list, FieldReader, FieldWriter,
};
use crate::CodecError;
use bytes::{Buf, BufMut};
use spindle_common::Value;
use std::collections::BTreeMap;

fn encode_value(v: &Value) -> Vec<u8> {
    let mut w = FieldWriter::new();
    w.field_u64(1, v.version);
    w.field_str(2, &v.originator_id);
    if let Some(ref payload) = v.value {
        w.field_bytes(3, payload);
    }
    w.field_i64(4, v.ttl_ms);
    w.field_u64(5, v.ttl_version);
    if let Some(hash) = v.hash {
        w.field_u64(6, hash);
    }
    w.into_bytes()
}

fn decode_value(buf: &[u8]) -> Result<Value, CodecError> {
    let mut v = Value {
        version: 0,
        originator_id: String::new(),
        value: None,
        ttl_ms: 0,
        ttl_version: 0,
        hash: None,
    };
    let mut r = FieldReader::new(buf);
    while let Some((id, p)) = r.next_field()? {
        match id {
            1 => v.version = read_u64(id, p)?,
            2 => v.originator_id = read_str(id, p)?,
            3 => v.value = Some(p.to_vec()),
            4 => v.ttl_ms = read_i64(id, p)?,
            5 => v.ttl_version = read_u64(id, p)?,
            6 => v.hash = Some(read_u64(id, p)?),
            _ => {}
        }
    }
    if v.originator_id.is_empty() {
        return Err(CodecError::MissingField("originator_id"));
    }
    Ok(v)
}

fn encode_key_vals(key_vals: &BTreeMap<String, Value>) -> Vec<u8> {
    let elements: Vec<Vec<u8>> = key_vals
        .iter()
        .map(|(key, value)| {
            let mut el = Vec::new();
            el.put_u32(key.len() as u32);
            el.put_slice(key.as_bytes());
            el.put_slice(&encode_value(value));
            el
        })
        .collect();
    let mut out = Vec::new();
    write_elements(&mut out, &elements);
    out
}

fn decode_key_vals(id: u8, payload: &[u8]) -> Result<BTreeMap<String, Value>, CodecError> {
    let mut out = BTreeMap::new();
    for mut el in read_elements(payload)? {
        if el.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let key_len = el.get_u32() as usize;
        if el.remaining() < key_len {
            return Err(CodecError::Truncated);
        }
        let key = read_str(id, &el[..key_len])?;
        el.advance(key_len);
        out.insert(key, decode_value(el)?);
    }
    Ok(out)
}

fn encode_key_hashes(hashes: &BTreeMap<String, u64>) -> Vec<u8> {
    let elements: Vec<Vec<u8>> = hashes
        .iter()
        .map(|(key, hash)| {
            let mut el = Vec::new();
            el.put_u32(key.len() as u32);
            el.put_slice(key.as_bytes());
            el.put_u64(*hash);
            el
        })
        .collect();
    let mut out = Vec::new();
    write_elements(&mut out, &elements);
    out
}

fn decode_key_hashes(id: u8, payload: &[u8]) -> Result<BTreeMap<String, u64>, CodecError> {
    let mut out = BTreeMap::new();
    for mut el in read_elements(payload)? {
        if el.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let key_len = el.get_u32() as usize;
        if el.remaining() < key_len {
            return Err(CodecError::Truncated);
        }
        let key = read_str(id, &el[..key_len])?;
        el.advance(key_len);
        if el.remaining() != 8 {
            return Err(CodecError::Truncated);
        }
        out.insert(key, el.get_u64());
    }
    Ok(out)
}

/// Install key-values into a peer's store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetRequest {
    pub area: String,
    pub key_vals: BTreeMap<String, Value>,
    /// Nodes this publication has already visited; used for loop
    /// suppression when flooding.
    pub node_ids: Option<Vec<String>>,
}

/// Fetch specific keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetRequest {
    pub area: String,
    pub keys: Vec<String>,
}

/// Dump keys by prefix and originator, optionally pruned by known hashes
/// (delta sync) and optionally stripped of payloads (hash-only dump).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpRequest {
    pub area: String,
    pub prefix: String,
    pub originators: Vec<String>,
    /// When set, return only keys that are absent here or locally strictly
    /// newer than the supplied hash.
    pub key_val_hashes: Option<BTreeMap<String, u64>>,
    /// When set, returned records carry metadata and hash only.
    pub hashes_only: bool,
}

/// A batch of changed key-values pushed to subscribers and flooded to peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Publication {
    pub key_vals: BTreeMap<String, Value>,
    pub expired_keys: Vec<String>,
    pub area: Option<String>,
    /// Root of the spanning tree this publication is flooding along.
    pub flood_root_id: Option<String>,
    pub node_ids: Option<Vec<String>>,
}

/// Spanning-tree maintenance message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DualMsgType {
    Query,
    Reply,
    Update,
}

impl DualMsgType {
    fn to_u8(self) -> u8 {
        match self {
            DualMsgType::Query => 1,
            DualMsgType::Reply => 2,
            DualMsgType::Update => 3,
        }
    }

    fn from_u8(v: u8) -> Result<Self, CodecError> {
        match v {
            1 => Ok(DualMsgType::Query),
            2 => Ok(DualMsgType::Reply),
            3 => Ok(DualMsgType::Update),
            other => Err(CodecError::InvalidDiscriminant(other)),
        }
    }
}

/// One spanning-tree tuple for a given root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualMessage {
    pub root_id: String,
    pub mtype: DualMsgType,
    /// Sender's distance to the root; negative means unreachable.
    pub distance: i64,
}

impl DualMessage {
    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.field_str(1, &self.root_id);
        w.field_u8(2, self.mtype.to_u8());
        w.field_i64(3, self.distance);
        w.into_bytes()
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut root_id = String::new();
        let mut mtype = None;
        let mut distance = -1;
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => root_id = read_str(id, p)?,
                2 => mtype = Some(DualMsgType::from_u8(read_u8(id, p)?)?),
                3 => distance = read_i64(id, p)?,
                _ => {}
            }
        }
        Ok(Self {
            root_id,
            mtype: mtype.ok_or(CodecError::MissingField("mtype"))?,
            distance,
        })
    }
}

/// A batch of spanning-tree messages from one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualMessages {
    pub sender_id: String,
    pub area: String,
    pub messages: Vec<DualMessage>,
}

/// Explicit child registration on the flooding tree: the sender announces it
/// now uses (or no longer uses) the receiver as its parent toward `root_id`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodTopoSet {
    pub area: String,
    pub root_id: String,
    pub child: String,
    pub set_child: bool,
}

/// Result of a SET / Dual / FloodTopoSet request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ack {
    pub ok: bool,
}

/// Envelope for everything carried on the key-value stream. The first body
/// byte is the message type, the rest is the message's tagged fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KvMessage {
    Set(SetRequest),
    Get(GetRequest),
    Dump(DumpRequest),
    Publication(Publication),
    Dual(DualMessages),
    FloodTopoSet(FloodTopoSet),
    Ack(Ack),
}

const TYPE_SET: u8 = 1;
const TYPE_GET: u8 = 2;
const TYPE_DUMP: u8 = 3;
const TYPE_PUBLICATION: u8 = 4;
const TYPE_DUAL: u8 = 5;
const TYPE_FLOOD_TOPO_SET: u8 = 6;
const TYPE_ACK: u8 = 7;

impl KvMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            KvMessage::Set(_) => "set",
            KvMessage::Get(_) => "get",
            KvMessage::Dump(_) => "dump",
            KvMessage::Publication(_) => "publication",
            KvMessage::Dual(_) => "dual",
            KvMessage::FloodTopoSet(_) => "flood_topo_set",
            KvMessage::Ack(_) => "ack",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let (mtype, w) = match self {
            KvMessage::Set(req) => {
                let mut w = FieldWriter::new();
                w.field_str(1, &req.area);
                w.field_bytes(2, &encode_key_vals(&req.key_vals));
                if let Some(ref node_ids) = req.node_ids {
                    w.field_bytes(3, &write_str_list(node_ids.iter()));
                }
                (TYPE_SET, w)
            }
            KvMessage::Get(req) => {
                let mut w = FieldWriter::new();
                w.field_str(1, &req.area);
                w.field_bytes(2, &write_str_list(req.keys.iter()));
                (TYPE_GET, w)
            }
            KvMessage::Dump(req) => {
                let mut w = FieldWriter::new();
                w.field_str(1, &req.area);
                w.field_str(2, &req.prefix);
                w.field_bytes(3, &write_str_list(req.originators.iter()));
                if let Some(ref hashes) = req.key_val_hashes {
                    w.field_bytes(4, &encode_key_hashes(hashes));
                }
                w.field_bool(5, req.hashes_only);
                (TYPE_DUMP, w)
            }
            KvMessage::Publication(publication) => {
                let mut w = FieldWriter::new();
                w.field_bytes(1, &encode_key_vals(&publication.key_vals));
                w.field_bytes(2, &write_str_list(publication.expired_keys.iter()));
                if let Some(ref area) = publication.area {
                    w.field_str(3, area);
                }
                if let Some(ref root) = publication.flood_root_id {
                    w.field_str(4, root);
                }
                if let Some(ref node_ids) = publication.node_ids {
                    w.field_bytes(5, &write_str_list(node_ids.iter()));
                }
                (TYPE_PUBLICATION, w)
            }
            KvMessage::Dual(dual) => {
                let mut w = FieldWriter::new();
                w.field_str(1, &dual.sender_id);
                w.field_str(2, &dual.area);
                let elements: Vec<Vec<u8>> = dual.messages.iter().map(|m| m.encode()).collect();
                let mut payload = Vec::new();
                write_elements(&mut payload, &elements);
                w.field_bytes(3, &payload);
                (TYPE_DUAL, w)
            }
            KvMessage::FloodTopoSet(req) => {
                let mut w = FieldWriter::new();
                w.field_str(1, &req.area);
                w.field_str(2, &req.root_id);
                w.field_str(3, &req.child);
                w.field_bool(4, req.set_child);
                (TYPE_FLOOD_TOPO_SET, w)
            }
            KvMessage::Ack(ack) => {
                let mut w = FieldWriter::new();
                w.field_bool(1, ack.ok);
                (TYPE_ACK, w)
            }
        };

        let fields = w.into_bytes();
        let mut out = Vec::with_capacity(fields.len() + 1);
        out.put_u8(mtype);
        out.put_slice(&fields);
        out
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, CodecError> {
        if buf.is_empty() {
            return Err(CodecError::Truncated);
        }
        let mtype = buf.get_u8();
        let mut r = FieldReader::new(buf);

        match mtype {
            TYPE_SET => {
                let mut req = SetRequest::default();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => req.area = read_str(id, p)?,
                        2 => req.key_vals = decode_key_vals(id, p)?,
                        3 => req.node_ids = Some(read_str_list(id, p)?),
                        _ => {}
                    }
                }
                Ok(KvMessage::Set(req))
            }
            TYPE_GET => {
                let mut req = GetRequest::default();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => req.area = read_str(id, p)?,
                        2 => req.keys = read_str_list(id, p)?,
                        _ => {}
                    }
                }
                Ok(KvMessage::Get(req))
            }
            TYPE_DUMP => {
                let mut req = DumpRequest::default();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => req.area = read_str(id, p)?,
                        2 => req.prefix = read_str(id, p)?,
                        3 => req.originators = read_str_list(id, p)?,
                        4 => req.key_val_hashes = Some(decode_key_hashes(id, p)?),
                        5 => req.hashes_only = read_bool(id, p)?,
                        _ => {}
                    }
                }
                Ok(KvMessage::Dump(req))
            }
            TYPE_PUBLICATION => {
                let mut publication = Publication::default();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => publication.key_vals = decode_key_vals(id, p)?,
                        2 => publication.expired_keys = read_str_list(id, p)?,
                        3 => publication.area = Some(read_str(id, p)?),
                        4 => publication.flood_root_id = Some(read_str(id, p)?),
                        5 => publication.node_ids = Some(read_str_list(id, p)?),
                        _ => {}
                    }
                }
                Ok(KvMessage::Publication(publication))
            }
            TYPE_DUAL => {
                let mut sender_id = String::new();
                let mut area = String::new();
                let mut messages = Vec::new();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => sender_id = read_str(id, p)?,
                        2 => area = read_str(id, p)?,
                        3 => {
                            messages = read_elements(p)?
                                .into_iter()
                                .map(DualMessage::decode)
                                .collect::<Result<_, _>>()?;
                        }
                        _ => {}
                    }
                }
                if sender_id.is_empty() {
                    return Err(CodecError::MissingField("sender_id"));
                }
                Ok(KvMessage::Dual(DualMessages {
                    sender_id,
                    area,
                    messages,
                }))
            }
            TYPE_FLOOD_TOPO_SET => {
                let mut req = FloodTopoSet::default();
                while let Some((id, p)) = r.next_field()? {
                    match id {
                        1 => req.area = read_str(id, p)?,
                        2 => req.root_id = read_str(id, p)?,
                        3 => req.child = read_str(id, p)?,
                        4 => req.set_child = read_bool(id, p)?,
                        _ => {}
                    }
                }
                Ok(KvMessage::FloodTopoSet(req))
            }
            TYPE_ACK => {
                let mut ack = Ack::default();
                while let Some((id, p)) = r.next_field()? {
                    if id == 1 {
                        ack.ok = read_bool(id, p)?;
                    }
                }
                Ok(KvMessage::Ack(ack))
            }
            other => Err(CodecError::UnknownMessageType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_value(payload: Option<&str>) -> Value {
        Value::new(
            3,
            "thanos",
            payload.map(|p| p.as_bytes().to_vec()),
            60_000,
            1,
        )
    }

    #[test]
    fn test_set_request_roundtrip() {
        let mut key_vals = BTreeMap::new();
        key_vals.insert("prefix:10.0.0.0/8".to_string(), sample_value(Some("v")));
        key_vals.insert("adj:thanos".to_string(), sample_value(None));
        let msg = KvMessage::Set(SetRequest {
            area: "0".into(),
            key_vals,
            node_ids: Some(vec!["thanos".into(), "gamora".into()]),
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_get_request_roundtrip() {
        let msg = KvMessage::Get(GetRequest {
            area: "0".into(),
            keys: vec!["k1".into(), "k2".into()],
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_dump_request_roundtrip() {
        let msg = KvMessage::Dump(DumpRequest {
            area: "backbone".into(),
            prefix: "adj:".into(),
            originators: vec!["thanos".into()],
            key_val_hashes: Some([("adj:x".to_string(), 0x1234u64)].into()),
            hashes_only: true,
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_publication_roundtrip() {
        let mut key_vals = BTreeMap::new();
        key_vals.insert("k".to_string(), sample_value(Some("v")));
        let msg = KvMessage::Publication(Publication {
            key_vals,
            expired_keys: vec!["dead".into()],
            area: Some("0".into()),
            flood_root_id: Some("thanos".into()),
            node_ids: Some(vec!["thanos".into()]),
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_absent_optionals_not_emitted() {
        let a = KvMessage::Publication(Publication::default());
        let b = KvMessage::Publication(Publication {
            node_ids: Some(vec![]),
            ..Default::default()
        });
        // Empty-but-present differs from absent on the wire.
        assert_ne!(a.encode(), b.encode());
        assert_eq!(KvMessage::decode(&a.encode()).unwrap(), a);
        assert_eq!(KvMessage::decode(&b.encode()).unwrap(), b);
    }

    #[test]
    fn test_dual_roundtrip() {
        let msg = KvMessage::Dual(DualMessages {
            sender_id: "gamora".into(),
            area: "0".into(),
            messages: vec![
                DualMessage {
                    root_id: "thanos".into(),
                    mtype: DualMsgType::Query,
                    distance: -1,
                },
                DualMessage {
                    root_id: "nebula".into(),
                    mtype: DualMsgType::Update,
                    distance: 2,
                },
            ],
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_flood_topo_set_roundtrip() {
        let msg = KvMessage::FloodTopoSet(FloodTopoSet {
            area: "0".into(),
            root_id: "thanos".into(),
            child: "gamora".into(),
            set_child: true,
        });
        assert_eq!(KvMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_unknown_type_rejected() {
        assert_eq!(
            KvMessage::decode(&[99u8, 0, 0, 0]).unwrap_err(),
            CodecError::UnknownMessageType(99)
        );
    }

    #[test]
    fn test_ttl_update_value_has_no_payload() {
        let mut key_vals = BTreeMap::new();
        key_vals.insert("k".to_string(), sample_value(None));
        let msg = KvMessage::Set(SetRequest {
            area: "0".into(),
            key_vals,
            node_ids: None,
        });
        let KvMessage::Set(decoded) = KvMessage::decode(&msg.encode()).unwrap() else {
            panic!("wrong variant");
        };
        assert!(decoded.key_vals["k"].value.is_none());
    }
}
