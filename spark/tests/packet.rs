//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::sync::LazyLock as Lazy;

use spark::packet::{
    DecodeError, HandshakeMsg, HeartbeatMsg, HelloFlags, HelloMsg, Packet,
    ReflectedNeighborInfo,
};

//
// Helper functions.
//

fn test_encode_packet(
    bytes_expected: &[u8],
    packet: &Result<Packet, DecodeError>,
) {
    let bytes_actual = packet.as_ref().unwrap().encode();
    assert_eq!(bytes_expected, bytes_actual.as_ref());
}

fn test_decode_packet(
    bytes: &[u8],
    packet_expected: &Result<Packet, DecodeError>,
) {
    let packet_actual = Packet::decode(bytes);
    assert_eq!(*packet_expected, packet_actual);
}

//
// Test packets.
//

static HELLO1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> = Lazy::new(|| {
    (
        vec![
            0x01, 0x00, 0x05, 0x74, 0x65, 0x72, 0x72, 0x61, 0x00, 0x06,
            0x6e, 0x6f, 0x64, 0x65, 0x2d, 0x31, 0x00, 0x04, 0x65, 0x74,
            0x68, 0x30, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x07,
            0x00, 0x00, 0x00, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x03, 0xe8, 0x00, 0x01, 0x00, 0x06, 0x6e, 0x6f, 0x64,
            0x65, 0x2d, 0x32, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0xf4, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x02, 0x58,
        ],
        Ok(Packet::Hello(HelloMsg {
            domain_name: "terra".to_owned(),
            node_name: "node-1".to_owned(),
            ifname: "eth0".to_owned(),
            seq_num: 7,
            version: 1,
            flags: HelloFlags::SOLICIT_RESPONSE,
            sent_ts_us: 1000,
            neighbor_infos: BTreeMap::from([(
                "node-2".to_owned(),
                ReflectedNeighborInfo::new(3, 500, 600),
            )]),
        })),
    )
});

static HANDSHAKE1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x02, 0x00, 0x06, 0x6e, 0x6f, 0x64, 0x65, 0x2d, 0x31, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x27, 0x10, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x75, 0x30, 0xfe, 0x80, 0x00, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
                0x00, 0x01, 0x0a, 0x00, 0x00, 0x01, 0x00, 0x00, 0x07, 0xe2,
                0x00, 0x00, 0xea, 0x62, 0x00, 0x01, 0x30, 0x01, 0x00, 0x06,
                0x6e, 0x6f, 0x64, 0x65, 0x2d, 0x32,
            ],
            Ok(Packet::Handshake(HandshakeMsg {
                node_name: "node-1".to_owned(),
                is_adj_established: false,
                hold_time: 10000,
                graceful_restart_time: 30000,
                transport_address_v6: "fe80::1".parse().unwrap(),
                transport_address_v4: "10.0.0.1".parse().unwrap(),
                ctrl_port: 2018,
                kvstore_cmd_port: 60002,
                area: "0".to_owned(),
                neighbor_node_name: Some("node-2".to_owned()),
            })),
        )
    });

static HEARTBEAT1: Lazy<(Vec<u8>, Result<Packet, DecodeError>)> =
    Lazy::new(|| {
        (
            vec![
                0x03, 0x00, 0x06, 0x6e, 0x6f, 0x64, 0x65, 0x2d, 0x31, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2a,
            ],
            Ok(Packet::Heartbeat(HeartbeatMsg::new(
                "node-1".to_owned(),
                42,
            ))),
        )
    });

//
// Tests.
//

#[test]
fn test_encode_hello1() {
    let (ref bytes, ref packet) = *HELLO1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_hello1() {
    let (ref bytes, ref packet) = *HELLO1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_handshake1() {
    let (ref bytes, ref packet) = *HANDSHAKE1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_handshake1() {
    let (ref bytes, ref packet) = *HANDSHAKE1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_encode_heartbeat1() {
    let (ref bytes, ref packet) = *HEARTBEAT1;
    test_encode_packet(bytes, packet);
}

#[test]
fn test_decode_heartbeat1() {
    let (ref bytes, ref packet) = *HEARTBEAT1;
    test_decode_packet(bytes, packet);
}

#[test]
fn test_decode_truncated() {
    let (ref bytes, _) = *HEARTBEAT1;
    for len in 0..bytes.len() {
        assert_eq!(
            Packet::decode(&bytes[..len]),
            Err(DecodeError::ReadOutOfBounds)
        );
    }
}

#[test]
fn test_decode_invalid_msg_type() {
    test_decode_packet(&[0x09, 0x00], &Err(DecodeError::InvalidMsgType(9)));
}

#[test]
fn test_decode_oversized() {
    let bytes = vec![0; 1281];
    test_decode_packet(&bytes, &Err(DecodeError::PacketTooLarge(1281)));
}

#[test]
fn test_decode_trailing_garbage_string_length() {
    // A string length running past the end of the buffer must not panic.
    let bytes = [0x03, 0xff, 0xff, 0x6e];
    test_decode_packet(&bytes, &Err(DecodeError::ReadOutOfBounds));
}
