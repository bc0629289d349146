//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut, TryGetError};
use derive_new::new;
use enum_as_inner::EnumAsInner;
use serde::{Deserialize, Serialize};
use spark_utils::bytes::{BytesExt, BytesMutExt, TLS_BUF};

use crate::consts::MIN_IPV6_MTU;

//
// Spark packet envelope.
//
// Every datagram carries exactly one of the three message types. The
// encoding is a stable binary schema: a one-byte message tag followed by
// the message fields in order, big-endian integers, length-prefixed UTF-8
// strings, and a count-prefixed reflected-neighbor table.
//
#[derive(Clone, Debug, EnumAsInner, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Packet {
    Hello(HelloMsg),
    Handshake(HandshakeMsg),
    Heartbeat(HeartbeatMsg),
}

//
// Discovery message, sent periodically to the Spark multicast group.
//
// The reflected-neighbor table echoes what the sender has observed from
// each of its peers; the presence of the recipient's own entry is the
// mutual-visibility evidence driving the WARM -> NEGOTIATE promotion.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HelloMsg {
    pub domain_name: String,
    pub node_name: String,
    pub ifname: String,
    pub seq_num: u64,
    pub version: u32,
    pub flags: HelloFlags,
    pub sent_ts_us: i64,
    pub neighbor_infos: BTreeMap<String, ReflectedNeighborInfo>,
}

// Hello message flags.
bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct HelloFlags: u8 {
        // Sender is in its fast-init window and wants an immediate reply.
        const SOLICIT_RESPONSE = 1 << 0;
        // Sender is shutting down and expects graceful restart handling.
        const RESTARTING = 1 << 1;
    }
}

// Per-neighbor timestamps echoed back inside a hello.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct ReflectedNeighborInfo {
    pub seq_num: u64,
    pub last_nbr_msg_sent_ts_us: i64,
    pub last_my_msg_rcvd_ts_us: i64,
}

//
// Adjacency negotiation message, sent point-to-point while a neighbor is
// in the NEGOTIATE state. Hold times are in milliseconds.
//
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct HandshakeMsg {
    pub node_name: String,
    pub is_adj_established: bool,
    pub hold_time: i64,
    pub graceful_restart_time: i64,
    pub transport_address_v6: Ipv6Addr,
    pub transport_address_v4: Ipv4Addr,
    pub ctrl_port: i32,
    pub kvstore_cmd_port: i32,
    pub area: String,
    pub neighbor_node_name: Option<String>,
}

// Liveness message, sent periodically once an adjacency is established.
#[derive(Clone, Debug, Eq, PartialEq, new)]
#[derive(Deserialize, Serialize)]
pub struct HeartbeatMsg {
    pub node_name: String,
    pub seq_num: u64,
}

// Spark decode errors.
#[derive(Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum DecodeError {
    ReadOutOfBounds,
    PacketTooLarge(usize),
    InvalidMsgType(u8),
    InvalidUtf8,
}

// Message type tags.
const MSG_TYPE_HELLO: u8 = 1;
const MSG_TYPE_HANDSHAKE: u8 = 2;
const MSG_TYPE_HEARTBEAT: u8 = 3;

// ===== impl Packet =====

impl Packet {
    // Encodes Spark packet into a bytes buffer.
    pub fn encode(&self) -> BytesMut {
        TLS_BUF.with(|buf| {
            let mut buf = buf.borrow_mut();
            buf.clear();

            match self {
                Packet::Hello(msg) => {
                    buf.put_u8(MSG_TYPE_HELLO);
                    msg.encode(&mut buf);
                }
                Packet::Handshake(msg) => {
                    buf.put_u8(MSG_TYPE_HANDSHAKE);
                    msg.encode(&mut buf);
                }
                Packet::Heartbeat(msg) => {
                    buf.put_u8(MSG_TYPE_HEARTBEAT);
                    msg.encode(&mut buf);
                }
            }

            buf.clone()
        })
    }

    // Decodes Spark packet from a bytes buffer.
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() > MIN_IPV6_MTU {
            return Err(DecodeError::PacketTooLarge(data.len()));
        }

        let mut buf = Bytes::copy_from_slice(data);
        let msg_type = buf.try_get_u8()?;
        let packet = match msg_type {
            MSG_TYPE_HELLO => Packet::Hello(HelloMsg::decode(&mut buf)?),
            MSG_TYPE_HANDSHAKE => {
                Packet::Handshake(HandshakeMsg::decode(&mut buf)?)
            }
            MSG_TYPE_HEARTBEAT => {
                Packet::Heartbeat(HeartbeatMsg::decode(&mut buf)?)
            }
            _ => return Err(DecodeError::InvalidMsgType(msg_type)),
        };

        Ok(packet)
    }

    // Returns the node name asserted by the packet's sender.
    pub fn node_name(&self) -> &str {
        match self {
            Packet::Hello(msg) => &msg.node_name,
            Packet::Handshake(msg) => &msg.node_name,
            Packet::Heartbeat(msg) => &msg.node_name,
        }
    }
}

// ===== impl HelloMsg =====

impl HelloMsg {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.domain_name);
        put_string(buf, &self.node_name);
        put_string(buf, &self.ifname);
        buf.put_u64(self.seq_num);
        buf.put_u32(self.version);
        buf.put_u8(self.flags.bits());
        buf.put_i64(self.sent_ts_us);
        buf.put_u16(self.neighbor_infos.len() as u16);
        for (name, info) in &self.neighbor_infos {
            put_string(buf, name);
            buf.put_u64(info.seq_num);
            buf.put_i64(info.last_nbr_msg_sent_ts_us);
            buf.put_i64(info.last_my_msg_rcvd_ts_us);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let domain_name = get_string(buf)?;
        let node_name = get_string(buf)?;
        let ifname = get_string(buf)?;
        let seq_num = buf.try_get_u64()?;
        let version = buf.try_get_u32()?;
        let flags = HelloFlags::from_bits_truncate(buf.try_get_u8()?);
        let sent_ts_us = buf.try_get_i64()?;
        let count = buf.try_get_u16()?;
        let mut neighbor_infos = BTreeMap::new();
        for _ in 0..count {
            let name = get_string(buf)?;
            let seq_num = buf.try_get_u64()?;
            let last_nbr_msg_sent_ts_us = buf.try_get_i64()?;
            let last_my_msg_rcvd_ts_us = buf.try_get_i64()?;
            neighbor_infos.insert(
                name,
                ReflectedNeighborInfo {
                    seq_num,
                    last_nbr_msg_sent_ts_us,
                    last_my_msg_rcvd_ts_us,
                },
            );
        }

        Ok(HelloMsg {
            domain_name,
            node_name,
            ifname,
            seq_num,
            version,
            flags,
            sent_ts_us,
            neighbor_infos,
        })
    }
}

// ===== impl HandshakeMsg =====

impl HandshakeMsg {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.node_name);
        buf.put_u8(self.is_adj_established as u8);
        buf.put_i64(self.hold_time);
        buf.put_i64(self.graceful_restart_time);
        buf.put_ipv6(&self.transport_address_v6);
        buf.put_ipv4(&self.transport_address_v4);
        buf.put_i32(self.ctrl_port);
        buf.put_i32(self.kvstore_cmd_port);
        put_string(buf, &self.area);
        match &self.neighbor_node_name {
            Some(name) => {
                buf.put_u8(1);
                put_string(buf, name);
            }
            None => buf.put_u8(0),
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let node_name = get_string(buf)?;
        let is_adj_established = buf.try_get_u8()? != 0;
        let hold_time = buf.try_get_i64()?;
        let graceful_restart_time = buf.try_get_i64()?;
        let transport_address_v6 = buf.try_get_ipv6()?;
        let transport_address_v4 = buf.try_get_ipv4()?;
        let ctrl_port = buf.try_get_i32()?;
        let kvstore_cmd_port = buf.try_get_i32()?;
        let area = get_string(buf)?;
        let neighbor_node_name = match buf.try_get_u8()? {
            0 => None,
            _ => Some(get_string(buf)?),
        };

        Ok(HandshakeMsg {
            node_name,
            is_adj_established,
            hold_time,
            graceful_restart_time,
            transport_address_v6,
            transport_address_v4,
            ctrl_port,
            kvstore_cmd_port,
            area,
            neighbor_node_name,
        })
    }
}

// ===== impl HeartbeatMsg =====

impl HeartbeatMsg {
    fn encode(&self, buf: &mut BytesMut) {
        put_string(buf, &self.node_name);
        buf.put_u64(self.seq_num);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let node_name = get_string(buf)?;
        let seq_num = buf.try_get_u64()?;

        Ok(HeartbeatMsg { node_name, seq_num })
    }
}

// ===== impl DecodeError =====

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::ReadOutOfBounds => {
                write!(f, "attempt to read out of bounds")
            }
            DecodeError::PacketTooLarge(len) => {
                write!(f, "packet length exceeds the minimum IPv6 MTU: {len}")
            }
            DecodeError::InvalidMsgType(msg_type) => {
                write!(f, "invalid message type: {msg_type}")
            }
            DecodeError::InvalidUtf8 => {
                write!(f, "string field isn't valid UTF-8")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<TryGetError> for DecodeError {
    fn from(_error: TryGetError) -> DecodeError {
        DecodeError::ReadOutOfBounds
    }
}

// ===== helper functions =====

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.put_slice(value.as_bytes());
}

fn get_string(buf: &mut Bytes) -> Result<String, DecodeError> {
    let len = buf.try_get_u16()? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::ReadOutOfBounds);
    }
    let bytes = buf.split_to(len);
    String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
}
