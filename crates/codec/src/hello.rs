//! Discovery datagrams: the `HelloPacket` envelope and the hello /
//! handshake / heartbeat messages it carries.
//!
//! Datagram layout: 4 magic bytes, 1 wire-version byte, then the envelope's
//! tagged fields. Exactly one of the envelope's message fields is expected;
//! a legacy payload block may ride alongside for backward compatibility.

use crate::wire::{
    read_bool, read_elements, read_i64, read_str, read_str_list, read_u16, read_u32, read_u64,
    write_elements, write_str_list, FieldReader, FieldWriter,
};
use crate::CodecError;
use bytes::{Buf, BufMut};
use spindle_common::MIN_IPV6_MTU;
use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Magic bytes opening every discovery datagram.
pub const MAGIC: [u8; 4] = *b"SPRK";

/// Version of the datagram framing itself (not the protocol version).
pub const WIRE_VERSION: u8 = 1;

/// What a node reflects back about each neighbor it has heard from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReflectedNeighborInfo {
    /// Last sequence number seen from the neighbor.
    pub seen_seq_num: u64,
    /// Timestamp the neighbor put in its last message, microseconds.
    pub last_nbr_msg_sent_ts_us: i64,
    /// Our kernel receive timestamp for that message, microseconds.
    pub last_my_msg_rcvd_ts_us: i64,
}

impl ReflectedNeighborInfo {
    fn encode(&self) -> Vec<u8> {
        let mut w = FieldWriter::new();
        w.field_u64(1, self.seen_seq_num);
        w.field_i64(2, self.last_nbr_msg_sent_ts_us);
        w.field_i64(3, self.last_my_msg_rcvd_ts_us);
        w.into_bytes()
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut info = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => info.seen_seq_num = read_u64(id, p)?,
                2 => info.last_nbr_msg_sent_ts_us = read_i64(id, p)?,
                3 => info.last_my_msg_rcvd_ts_us = read_i64(id, p)?,
                _ => {}
            }
        }
        Ok(info)
    }
}

fn encode_neighbor_infos(infos: &BTreeMap<String, ReflectedNeighborInfo>) -> Vec<u8> {
    let elements: Vec<Vec<u8>> = infos
        .iter()
        .map(|(name, info)| {
            let mut el = Vec::new();
            let name_bytes = name.as_bytes();
            el.put_u32(name_bytes.len() as u32);
            el.put_slice(name_bytes);
            el.put_slice(&info.encode());
            el
        })
        .collect();
    let mut out = Vec::new();
    write_elements(&mut out, &elements);
    out
}

fn decode_neighbor_infos(
    id: u8,
    payload: &[u8],
) -> Result<BTreeMap<String, ReflectedNeighborInfo>, CodecError> {
    let mut out = BTreeMap::new();
    for mut el in read_elements(payload)? {
        if el.remaining() < 4 {
            return Err(CodecError::Truncated);
        }
        let name_len = el.get_u32() as usize;
        if el.remaining() < name_len {
            return Err(CodecError::Truncated);
        }
        let name = read_str(id, &el[..name_len])?;
        el.advance(name_len);
        out.insert(name, ReflectedNeighborInfo::decode(el)?);
    }
    Ok(out)
}

fn decode_v6(id: u8, payload: &[u8]) -> Result<Ipv6Addr, CodecError> {
    let arr: [u8; 16] = payload.try_into().map_err(|_| CodecError::BadFieldLength {
        field: id,
        len: payload.len(),
        expected: 16,
    })?;
    Ok(Ipv6Addr::from(arr))
}

fn decode_v4(id: u8, payload: &[u8]) -> Result<Ipv4Addr, CodecError> {
    let arr: [u8; 4] = payload.try_into().map_err(|_| CodecError::BadFieldLength {
        field: id,
        len: payload.len(),
        expected: 4,
    })?;
    Ok(Ipv4Addr::from(arr))
}

/// Periodic discovery message: who I am, who I have heard from, and the
/// timestamps that let the receiver compute RTT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloMsg {
    pub domain_name: String,
    pub node_name: String,
    /// Sender's name for the interface the packet left on.
    pub if_name: String,
    pub seq_num: u64,
    pub version: u32,
    /// Set while in fast-init: asks the receiver to reply immediately.
    pub solicit_response: bool,
    pub restarting: bool,
    pub neighbor_infos: BTreeMap<String, ReflectedNeighborInfo>,
    pub areas: Option<BTreeSet<String>>,
    /// When this message left the sender, microseconds. Reflected back by
    /// receivers for RTT computation.
    pub sent_ts_us: i64,
}

impl HelloMsg {
    fn encode(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.field_str(1, &self.domain_name);
        w.field_str(2, &self.node_name);
        w.field_str(3, &self.if_name);
        w.field_u64(4, self.seq_num);
        w.field_u32(5, self.version);
        w.field_bool(6, self.solicit_response);
        w.field_bool(7, self.restarting);
        w.field_bytes(8, &encode_neighbor_infos(&self.neighbor_infos));
        if let Some(ref areas) = self.areas {
            w.field_bytes(9, &write_str_list(areas.iter()));
        }
        w.field_i64(10, self.sent_ts_us);
        w
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => msg.domain_name = read_str(id, p)?,
                2 => msg.node_name = read_str(id, p)?,
                3 => msg.if_name = read_str(id, p)?,
                4 => msg.seq_num = read_u64(id, p)?,
                5 => msg.version = read_u32(id, p)?,
                6 => msg.solicit_response = read_bool(id, p)?,
                7 => msg.restarting = read_bool(id, p)?,
                8 => msg.neighbor_infos = decode_neighbor_infos(id, p)?,
                9 => msg.areas = Some(read_str_list(id, p)?.into_iter().collect()),
                10 => msg.sent_ts_us = read_i64(id, p)?,
                _ => {}
            }
        }
        if msg.node_name.is_empty() {
            return Err(CodecError::MissingField("node_name"));
        }
        Ok(msg)
    }
}

/// Parameter negotiation sent while a neighbor is in NEGOTIATE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeMsg {
    pub node_name: String,
    /// Whether the sender already counts us as an adjacency.
    pub is_adj_established: bool,
    /// Heartbeat hold time the sender asks us to honor, milliseconds.
    pub hold_time_ms: u64,
    pub graceful_restart_time_ms: u64,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub kv_cmd_port: u16,
    pub kv_pub_port: u16,
    pub area: String,
    /// Whether the sender participates in spanning-tree optimized flooding.
    pub supports_flood_optimization: bool,
}

impl HandshakeMsg {
    fn encode(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.field_str(1, &self.node_name);
        w.field_bool(2, self.is_adj_established);
        w.field_u64(3, self.hold_time_ms);
        w.field_u64(4, self.graceful_restart_time_ms);
        if let Some(v6) = self.transport_address_v6 {
            w.field_bytes(5, &v6.octets());
        }
        if let Some(v4) = self.transport_address_v4 {
            w.field_bytes(6, &v4.octets());
        }
        w.field_u16(7, self.kv_cmd_port);
        w.field_u16(8, self.kv_pub_port);
        w.field_str(9, &self.area);
        w.field_bool(10, self.supports_flood_optimization);
        w
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => msg.node_name = read_str(id, p)?,
                2 => msg.is_adj_established = read_bool(id, p)?,
                3 => msg.hold_time_ms = read_u64(id, p)?,
                4 => msg.graceful_restart_time_ms = read_u64(id, p)?,
                5 => msg.transport_address_v6 = Some(decode_v6(id, p)?),
                6 => msg.transport_address_v4 = Some(decode_v4(id, p)?),
                7 => msg.kv_cmd_port = read_u16(id, p)?,
                8 => msg.kv_pub_port = read_u16(id, p)?,
                9 => msg.area = read_str(id, p)?,
                10 => msg.supports_flood_optimization = read_bool(id, p)?,
                _ => {}
            }
        }
        if msg.node_name.is_empty() {
            return Err(CodecError::MissingField("node_name"));
        }
        Ok(msg)
    }
}

/// Keep-alive for an established adjacency.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub seq_num: u64,
}

impl HeartbeatMsg {
    fn encode(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.field_str(1, &self.node_name);
        w.field_u64(2, self.seq_num);
        w
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => msg.node_name = read_str(id, p)?,
                2 => msg.seq_num = read_u64(id, p)?,
                _ => {}
            }
        }
        if msg.node_name.is_empty() {
            return Err(CodecError::MissingField("node_name"));
        }
        Ok(msg)
    }
}

/// Pre-handshake hello block kept for interop with old senders.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyHelloPayload {
    pub domain_name: String,
    pub node_name: String,
    pub if_name: String,
    pub hold_time_ms: u64,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub kv_cmd_port: u16,
    pub kv_pub_port: u16,
    pub seq_num: u64,
    pub neighbor_infos: BTreeMap<String, ReflectedNeighborInfo>,
    pub timestamp_us: i64,
    pub solicit_response: bool,
    pub restarting: bool,
    pub areas: Option<BTreeSet<String>>,
}

impl LegacyHelloPayload {
    fn encode(&self) -> FieldWriter {
        let mut w = FieldWriter::new();
        w.field_str(1, &self.domain_name);
        w.field_str(2, &self.node_name);
        w.field_str(3, &self.if_name);
        w.field_u64(4, self.hold_time_ms);
        if let Some(v6) = self.transport_address_v6 {
            w.field_bytes(5, &v6.octets());
        }
        if let Some(v4) = self.transport_address_v4 {
            w.field_bytes(6, &v4.octets());
        }
        w.field_u16(7, self.kv_cmd_port);
        w.field_u16(8, self.kv_pub_port);
        w.field_u64(9, self.seq_num);
        w.field_bytes(10, &encode_neighbor_infos(&self.neighbor_infos));
        w.field_i64(11, self.timestamp_us);
        w.field_bool(12, self.solicit_response);
        w.field_bool(13, self.restarting);
        if let Some(ref areas) = self.areas {
            w.field_bytes(14, &write_str_list(areas.iter()));
        }
        w
    }

    fn decode(buf: &[u8]) -> Result<Self, CodecError> {
        let mut msg = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => msg.domain_name = read_str(id, p)?,
                2 => msg.node_name = read_str(id, p)?,
                3 => msg.if_name = read_str(id, p)?,
                4 => msg.hold_time_ms = read_u64(id, p)?,
                5 => msg.transport_address_v6 = Some(decode_v6(id, p)?),
                6 => msg.transport_address_v4 = Some(decode_v4(id, p)?),
                7 => msg.kv_cmd_port = read_u16(id, p)?,
                8 => msg.kv_pub_port = read_u16(id, p)?,
                9 => msg.seq_num = read_u64(id, p)?,
                10 => msg.neighbor_infos = decode_neighbor_infos(id, p)?,
                11 => msg.timestamp_us = read_i64(id, p)?,
                12 => msg.solicit_response = read_bool(id, p)?,
                13 => msg.restarting = read_bool(id, p)?,
                14 => msg.areas = Some(read_str_list(id, p)?.into_iter().collect()),
                _ => {}
            }
        }
        Ok(msg)
    }
}

/// The discovery datagram envelope. Receivers dispatch on whichever message
/// field is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelloPacket {
    pub hello: Option<HelloMsg>,
    pub heartbeat: Option<HeartbeatMsg>,
    pub handshake: Option<HandshakeMsg>,
    pub legacy: Option<LegacyHelloPayload>,
}

impl HelloPacket {
    pub fn from_hello(msg: HelloMsg) -> Self {
        Self {
            hello: Some(msg),
            ..Default::default()
        }
    }

    pub fn from_heartbeat(msg: HeartbeatMsg) -> Self {
        Self {
            heartbeat: Some(msg),
            ..Default::default()
        }
    }

    pub fn from_handshake(msg: HandshakeMsg) -> Self {
        Self {
            handshake: Some(msg),
            ..Default::default()
        }
    }

    /// Encode into a datagram. Fails if the result would exceed the IPv6
    /// minimum MTU.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut out = Vec::with_capacity(128);
        out.put_slice(&MAGIC);
        out.put_u8(WIRE_VERSION);

        let mut w = FieldWriter::new();
        if let Some(ref msg) = self.hello {
            w.field_nested(1, msg.encode());
        }
        if let Some(ref msg) = self.heartbeat {
            w.field_nested(2, msg.encode());
        }
        if let Some(ref msg) = self.handshake {
            w.field_nested(3, msg.encode());
        }
        if let Some(ref legacy) = self.legacy {
            w.field_nested(4, legacy.encode());
        }
        out.put_slice(&w.into_bytes());

        if out.len() > MIN_IPV6_MTU {
            return Err(CodecError::Oversize {
                len: out.len(),
                max: MIN_IPV6_MTU,
            });
        }
        Ok(out)
    }

    /// Decode a received datagram. Datagrams above the IPv6 minimum MTU are
    /// rejected before parsing.
    pub fn decode(datagram: &[u8]) -> Result<Self, CodecError> {
        if datagram.len() > MIN_IPV6_MTU {
            return Err(CodecError::Oversize {
                len: datagram.len(),
                max: MIN_IPV6_MTU,
            });
        }
        let mut buf = datagram;
        if buf.remaining() < 5 {
            return Err(CodecError::Truncated);
        }
        if buf[..4] != MAGIC {
            return Err(CodecError::BadMagic);
        }
        buf.advance(4);
        let wire_version = buf.get_u8();
        if wire_version != WIRE_VERSION {
            return Err(CodecError::UnsupportedWireVersion(wire_version));
        }

        let mut packet = Self::default();
        let mut r = FieldReader::new(buf);
        while let Some((id, p)) = r.next_field()? {
            match id {
                1 => packet.hello = Some(HelloMsg::decode(p)?),
                2 => packet.heartbeat = Some(HeartbeatMsg::decode(p)?),
                3 => packet.handshake = Some(HandshakeMsg::decode(p)?),
                4 => packet.legacy = Some(LegacyHelloPayload::decode(p)?),
                _ => {}
            }
        }
        Ok(packet)
    }
}
