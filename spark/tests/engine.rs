//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg(feature = "testing")]

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use spark::interface::{InterfaceDatabase, InterfaceInfo};
use spark::master::{
    self, Config, InstanceChannelsTx, Master, NeighborEvent,
    NeighborEventType, ProtocolInputChannelsRx,
};
use spark::neighbor::State;
use spark::packet::{
    HandshakeMsg, HelloFlags, HelloMsg, Packet, ReflectedNeighborInfo,
};
use spark::tasks::messages::ProtocolOutputMsg;
use spark::tasks::messages::input::{
    HelloIntervalMsg, NeighborTimerMsg, NetRxPacketMsg, ProtocolMsg,
    StateQueryMsg,
};
use tokio::sync::{mpsc, oneshot};

const IFNAME: &str = "eth0";
const IFINDEX: u32 = 1;
const NODE: &str = "node-a";
const PEER: &str = "node-b";
const DOMAIN: &str = "terra";

struct TestEngine {
    master: Master,
    neighbor_eventc: mpsc::UnboundedReceiver<NeighborEvent>,
    protocol_outputc: mpsc::Receiver<ProtocolOutputMsg>,
    _protocol_input_rx: ProtocolInputChannelsRx,
}

fn config() -> Config {
    Config {
        domain_name: DOMAIN.to_owned(),
        node_name: NODE.to_owned(),
        ..Default::default()
    }
}

fn setup(config: Config) -> TestEngine {
    let (neighbor_eventp, neighbor_eventc) = mpsc::unbounded_channel();
    let (protocol_input_tx, protocol_input_rx) =
        master::protocol_input_channels();
    let (protocol_outputp, protocol_outputc) = mpsc::channel(64);
    let tx = InstanceChannelsTx {
        neighbor_event: neighbor_eventp,
        protocol_input: protocol_input_tx,
        protocol_output: protocol_outputp,
    };
    let master = Master::new(config, tx).unwrap();

    TestEngine {
        master,
        neighbor_eventc,
        protocol_outputc,
        _protocol_input_rx: protocol_input_rx,
    }
}

impl TestEngine {
    fn track_interface(&mut self, networks: &[&str]) {
        let db = InterfaceDatabase {
            node_name: self.master.config.node_name.clone(),
            interfaces: BTreeMap::from([(
                IFNAME.to_owned(),
                InterfaceInfo {
                    up: true,
                    ifindex: IFINDEX,
                    networks: networks
                        .iter()
                        .map(|network| network.parse().unwrap())
                        .collect(),
                },
            )]),
        };
        self.master.process_interface_update(db).unwrap();
    }

    fn inject(&mut self, packet: Packet) {
        let msg = NetRxPacketMsg {
            ifindex: IFINDEX,
            src: "fe80::2".parse().unwrap(),
            bytes: 128,
            recv_ts_us: Utc::now().timestamp_micros(),
            packet: Ok(packet),
        };
        self.master
            .process_protocol_msg(ProtocolMsg::NetRxPacket(msg));
    }

    fn hello_tick(&mut self) {
        let msg = HelloIntervalMsg {
            ifname: IFNAME.to_owned(),
            in_fast_init: false,
        };
        self.master
            .process_protocol_msg(ProtocolMsg::HelloInterval(msg));
    }

    fn neighbor_state(&self) -> Option<State> {
        self.master
            .neighbors
            .get(IFNAME)
            .and_then(|neighbors| neighbors.get(PEER))
            .map(|neighbor| neighbor.state)
    }

    fn expect_event(&mut self, event_type: NeighborEventType) -> NeighborEvent {
        let event = self
            .neighbor_eventc
            .try_recv()
            .expect("expected a neighbor event");
        assert_eq!(event.event_type, event_type);
        event
    }

    fn expect_no_event(&mut self) {
        assert!(self.neighbor_eventc.try_recv().is_err());
    }

    async fn recv_tx_packet(&mut self) -> Packet {
        let msg =
            tokio::time::timeout(
                Duration::from_secs(5),
                self.protocol_outputc.recv(),
            )
            .await
            .expect("timed out waiting for an outbound packet")
            .expect("tx channel closed");
        match msg {
            ProtocolOutputMsg::NetTxPacket(msg) => msg.packet,
        }
    }

    // Drives the adjacency with the peer up to ESTABLISHED.
    fn bring_up(&mut self, networks: &[&str]) {
        self.track_interface(networks);

        // Send one hello so the peer-reflected sequence number of zero is
        // behind ours.
        self.hello_tick();

        self.inject(peer_hello(1, false, HelloFlags::empty()));
        assert_eq!(self.neighbor_state(), Some(State::Warm));

        self.inject(peer_hello(1, true, HelloFlags::empty()));
        assert_eq!(self.neighbor_state(), Some(State::Negotiate));

        self.inject(peer_handshake("10.0.0.2", true));
        assert_eq!(self.neighbor_state(), Some(State::Established));

        self.expect_event(NeighborEventType::NeighborUp);
    }
}

fn peer_hello(seq_num: u64, reflect: bool, flags: HelloFlags) -> Packet {
    let now = Utc::now().timestamp_micros();
    let mut neighbor_infos = BTreeMap::new();
    if reflect {
        // The peer echoes our sent timestamp and its receive timestamp.
        neighbor_infos.insert(
            NODE.to_owned(),
            ReflectedNeighborInfo::new(0, now - 10_000, now - 5_000),
        );
    }
    Packet::Hello(HelloMsg {
        domain_name: DOMAIN.to_owned(),
        node_name: PEER.to_owned(),
        ifname: "eth9".to_owned(),
        seq_num,
        version: 1,
        flags,
        sent_ts_us: now,
        neighbor_infos,
    })
}

fn peer_handshake(v4: &str, is_adj_established: bool) -> Packet {
    Packet::Handshake(HandshakeMsg {
        node_name: PEER.to_owned(),
        is_adj_established,
        hold_time: 10_000,
        graceful_restart_time: 30_000,
        transport_address_v6: "fe80::2".parse().unwrap(),
        transport_address_v4: v4.parse().unwrap(),
        ctrl_port: 2018,
        kvstore_cmd_port: 60002,
        area: "0".to_owned(),
        neighbor_node_name: Some(NODE.to_owned()),
    })
}

// ===== Tests =====

#[tokio::test]
async fn test_adjacency_bring_up() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    // The adjacency is fully established.
    let neighbor = &engine.master.neighbors[IFNAME][PEER];
    assert!(engine.master.active_neighbors[IFNAME].contains(PEER));
    assert!(engine.master.allocated_labels.contains(&neighbor.label));
    assert!(neighbor.heartbeat_hold_timer.is_some());
    assert!(neighbor.negotiate_interval.is_none());
    assert!(neighbor.negotiate_hold_timer.is_none());
    assert_eq!(neighbor.transport_address_v6, Some("fe80::2".parse().unwrap()));
    assert!(engine.master.counters.get("spark.hello.packets_sent") > 0);

    // The negotiated hold times take the larger of each side's values.
    assert_eq!(neighbor.heartbeat_hold_time, Duration::from_secs(10));
    assert_eq!(neighbor.graceful_restart_hold_time, Duration::from_secs(30));

    // The first valid RTT sample initializes the smoothed value.
    assert!(neighbor.rtt.is_some());
    assert!(neighbor.rtt_latest >= Duration::from_millis(5));
}

#[tokio::test]
async fn test_domain_mismatch() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    let hello = Packet::Hello(HelloMsg {
        domain_name: "other".to_owned(),
        node_name: PEER.to_owned(),
        ifname: "eth9".to_owned(),
        seq_num: 1,
        version: 1,
        flags: HelloFlags::empty(),
        sent_ts_us: Utc::now().timestamp_micros(),
        neighbor_infos: BTreeMap::new(),
    });
    engine.inject(hello);

    assert_eq!(engine.neighbor_state(), None);
    assert_eq!(
        engine
            .master
            .counters
            .get("spark.invalid_keepalive.different_domain"),
        1
    );
}

#[tokio::test]
async fn test_looped_packet() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    let hello = Packet::Hello(HelloMsg {
        domain_name: DOMAIN.to_owned(),
        node_name: NODE.to_owned(),
        ifname: IFNAME.to_owned(),
        seq_num: 1,
        version: 1,
        flags: HelloFlags::empty(),
        sent_ts_us: Utc::now().timestamp_micros(),
        neighbor_infos: BTreeMap::new(),
    });
    engine.inject(hello);

    assert!(engine.master.neighbors[IFNAME].is_empty());
    assert_eq!(
        engine
            .master
            .counters
            .get("spark.invalid_keepalive.looped_packet"),
        1
    );
}

#[tokio::test]
async fn test_unsupported_version() {
    let mut engine = setup(Config {
        lowest_supported_version: 2,
        ..config()
    });
    engine.track_interface(&["fe80::1/64"]);

    engine.inject(peer_hello(1, false, HelloFlags::empty()));

    assert_eq!(engine.neighbor_state(), None);
    assert_eq!(
        engine
            .master
            .counters
            .get("spark.invalid_keepalive.invalid_version"),
        1
    );
}

#[tokio::test]
async fn test_stale_incarnation_guard() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    // Without any hello sent, our sequence number is still zero, so the
    // peer reflecting zero means it saw a previous incarnation of us.
    engine.inject(peer_hello(1, false, HelloFlags::empty()));
    engine.inject(peer_hello(2, true, HelloFlags::empty()));

    let neighbor = &engine.master.neighbors[IFNAME][PEER];
    assert_eq!(neighbor.state, State::Warm);
    assert!(neighbor.negotiate_interval.is_none());
    assert!(neighbor.negotiate_hold_timer.is_none());
}

#[tokio::test]
async fn test_v4_subnet_violation() {
    let mut engine = setup(Config {
        enable_v4: true,
        ..config()
    });
    engine.track_interface(&["fe80::1/64", "10.0.0.1/30"]);
    engine.hello_tick();

    engine.inject(peer_hello(1, false, HelloFlags::empty()));
    engine.inject(peer_hello(1, true, HelloFlags::empty()));
    assert_eq!(engine.neighbor_state(), Some(State::Negotiate));

    // The peer's V4 address is outside our /30.
    engine.inject(peer_handshake("10.1.0.2", true));

    assert_eq!(engine.neighbor_state(), Some(State::Warm));
    assert_eq!(
        engine
            .master
            .counters
            .get("spark.invalid_keepalive.different_subnet"),
        1
    );
    engine.expect_no_event();

    let neighbor = &engine.master.neighbors[IFNAME][PEER];
    assert!(neighbor.negotiate_interval.is_none());
    assert!(neighbor.negotiate_hold_timer.is_none());
}

#[tokio::test]
async fn test_handshake_reply_storm_guard() {
    let mut engine = setup(Config {
        enable_v4: true,
        ..config()
    });
    engine.track_interface(&["fe80::1/64", "10.0.0.1/30"]);
    engine.hello_tick();
    engine.inject(peer_hello(1, false, HelloFlags::empty()));
    engine.inject(peer_hello(1, true, HelloFlags::empty()));

    // First handshake: invalid V4 subnet, but the peer hasn't formed the
    // adjacency, so we reply first (still negotiating) and then fall back
    // to WARM.
    engine.inject(peer_handshake("10.1.0.2", false));
    assert_eq!(engine.neighbor_state(), Some(State::Warm));

    // Second handshake: we reply claiming the adjacency is established,
    // breaking the solicitation loop.
    engine.inject(peer_handshake("10.1.0.2", false));

    // Outbound traffic: our hello, then the two handshake replies.
    let packet = engine.recv_tx_packet().await;
    assert!(packet.as_hello().is_some());
    let packet = engine.recv_tx_packet().await;
    assert!(!packet.as_handshake().unwrap().is_adj_established);
    let packet = engine.recv_tx_packet().await;
    assert!(packet.as_handshake().unwrap().is_adj_established);
}

#[tokio::test]
async fn test_heartbeat_timeout() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);
    let label = engine.master.neighbors[IFNAME][PEER].label;

    let msg = NeighborTimerMsg {
        ifname: IFNAME.to_owned(),
        neighbor_node_name: PEER.to_owned(),
    };
    engine
        .master
        .process_protocol_msg(ProtocolMsg::HeartbeatHoldTimer(msg));

    engine.expect_event(NeighborEventType::NeighborDown);
    assert_eq!(engine.neighbor_state(), None);
    assert!(!engine.master.allocated_labels.contains(&label));
    assert!(!engine.master.active_neighbors.contains_key(IFNAME));
}

#[tokio::test]
async fn test_graceful_restart() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    // The peer announces its shutdown.
    engine.inject(peer_hello(1, true, HelloFlags::RESTARTING));
    engine.expect_event(NeighborEventType::NeighborRestarting);
    assert_eq!(engine.neighbor_state(), Some(State::Restart));
    {
        let neighbor = &engine.master.neighbors[IFNAME][PEER];
        assert!(neighbor.heartbeat_hold_timer.is_none());
        assert!(neighbor.graceful_restart_hold_timer.is_some());
    }

    // A hello from before the restart boundary is ignored.
    engine.inject(peer_hello(0, true, HelloFlags::empty()));
    engine.expect_no_event();
    assert_eq!(engine.neighbor_state(), Some(State::Restart));

    // The peer comes back with a fresh sequence number.
    engine.inject(peer_hello(2, true, HelloFlags::empty()));
    engine.expect_event(NeighborEventType::NeighborRestarted);
    assert_eq!(engine.neighbor_state(), Some(State::Established));
    {
        let neighbor = &engine.master.neighbors[IFNAME][PEER];
        assert!(neighbor.heartbeat_hold_timer.is_some());
        assert!(neighbor.graceful_restart_hold_timer.is_none());
    }
}

#[tokio::test]
async fn test_graceful_restart_expiry() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    engine.inject(peer_hello(1, true, HelloFlags::RESTARTING));
    engine.expect_event(NeighborEventType::NeighborRestarting);

    // The peer never returns.
    let msg = NeighborTimerMsg {
        ifname: IFNAME.to_owned(),
        neighbor_node_name: PEER.to_owned(),
    };
    engine
        .master
        .process_protocol_msg(ProtocolMsg::GrHoldTimer(msg));

    engine.expect_event(NeighborEventType::NeighborDown);
    assert_eq!(engine.neighbor_state(), None);
}

#[tokio::test]
async fn test_adjacency_drop_on_mutual_info_loss() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    // The peer stops reflecting us; it no longer wants the adjacency.
    engine.inject(peer_hello(2, false, HelloFlags::empty()));

    engine.expect_event(NeighborEventType::NeighborDown);
    assert_eq!(engine.neighbor_state(), None);
    assert!(!engine.master.active_neighbors.contains_key(IFNAME));
}

#[tokio::test]
async fn test_interface_removal() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);
    let label = engine.master.neighbors[IFNAME][PEER].label;

    // The interface disappears from the snapshot.
    let db = InterfaceDatabase {
        node_name: NODE.to_owned(),
        interfaces: BTreeMap::new(),
    };
    engine.master.process_interface_update(db).unwrap();

    engine.expect_event(NeighborEventType::NeighborDown);
    assert!(engine.master.interfaces.is_empty());
    assert!(engine.master.neighbors.is_empty());
    assert!(!engine.master.allocated_labels.contains(&label));
    assert!(engine.master.active_neighbors.is_empty());
}

#[tokio::test]
async fn test_reconciliation_idempotence() {
    let mut engine = setup(config());
    let db = InterfaceDatabase {
        node_name: NODE.to_owned(),
        interfaces: BTreeMap::from([(
            IFNAME.to_owned(),
            InterfaceInfo {
                up: true,
                ifindex: IFINDEX,
                networks: vec!["fe80::1/64".parse().unwrap()],
            },
        )]),
    };

    engine.master.process_interface_update(db.clone()).unwrap();
    engine.bring_up(&["fe80::1/64"]);

    // Re-applying the same snapshot changes nothing: no events, no churn.
    engine.master.process_interface_update(db).unwrap();
    engine.expect_no_event();
    assert_eq!(engine.master.interfaces.len(), 1);
    assert_eq!(engine.neighbor_state(), Some(State::Established));
}

#[tokio::test]
async fn test_node_name_mismatch_is_fatal() {
    let mut engine = setup(config());
    let db = InterfaceDatabase {
        node_name: "somebody-else".to_owned(),
        interfaces: BTreeMap::new(),
    };
    assert!(engine.master.process_interface_update(db).is_err());
}

#[tokio::test]
async fn test_seq_num_increments() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);
    assert_eq!(engine.master.my_seq_num, 0);

    engine.hello_tick();
    engine.hello_tick();
    assert_eq!(engine.master.my_seq_num, 2);

    // Heartbeats are skipped entirely while no adjacency exists, without
    // burning a sequence number.
    engine.master.process_protocol_msg(ProtocolMsg::HeartbeatInterval(
        spark::tasks::messages::input::HeartbeatIntervalMsg {
            ifname: IFNAME.to_owned(),
        },
    ));
    assert_eq!(engine.master.my_seq_num, 2);
    assert_eq!(
        engine.master.counters.get("spark.heartbeat.packets_sent"),
        0
    );
}

#[tokio::test]
async fn test_heartbeat_after_adjacency() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);
    let seq_num = engine.master.my_seq_num;

    engine.master.process_protocol_msg(ProtocolMsg::HeartbeatInterval(
        spark::tasks::messages::input::HeartbeatIntervalMsg {
            ifname: IFNAME.to_owned(),
        },
    ));

    assert_eq!(engine.master.my_seq_num, seq_num + 1);
    assert_eq!(
        engine.master.counters.get("spark.heartbeat.packets_sent"),
        1
    );
}

#[tokio::test]
async fn test_oversized_outbound_hello() {
    let mut engine = setup(Config {
        domain_name: "d".repeat(2000),
        ..config()
    });
    engine.track_interface(&["fe80::1/64"]);

    // The hello exceeds the minimum IPv6 MTU and is dropped before it
    // reaches the socket, but the sequence number advances regardless.
    engine.hello_tick();
    assert_eq!(engine.master.my_seq_num, 1);
    assert_eq!(engine.master.counters.get("spark.hello.packets_sent"), 0);
}

#[tokio::test]
async fn test_solicited_hello_reply() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    engine.inject(peer_hello(1, false, HelloFlags::SOLICIT_RESPONSE));

    assert_eq!(engine.master.counters.get("spark.hello.packets_sent"), 1);
}

#[tokio::test]
async fn test_rate_limiting() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    for seq_num in 0..60 {
        engine.inject(peer_hello(seq_num, false, HelloFlags::empty()));
    }

    let recv = engine.master.counters.get("spark.hello_packet_recv");
    let dropped = engine.master.counters.get("spark.hello_packet_dropped");
    let processed =
        engine.master.counters.get("spark.hello_packet_processed");
    assert_eq!(recv, 60);
    assert!(dropped >= 1);
    assert_eq!(processed, recv - dropped);
}

#[tokio::test]
async fn test_area_resolution() {
    use spark::area::AreaCfg;

    let mut engine = setup(Config {
        areas: vec![AreaCfg {
            area_id: "7".to_owned(),
            neighbor_regexes: vec!["node-.*".to_owned()],
            interface_regexes: vec!["eth.*".to_owned()],
        }],
        ..config()
    });
    engine.track_interface(&["fe80::1/64"]);
    engine.hello_tick();

    engine.inject(peer_hello(1, false, HelloFlags::empty()));
    assert_eq!(engine.master.neighbors[IFNAME][PEER].area, "7");
}

#[tokio::test]
async fn test_area_refusal() {
    use spark::area::AreaCfg;

    let mut engine = setup(Config {
        areas: vec![AreaCfg {
            area_id: "7".to_owned(),
            neighbor_regexes: vec!["spine-.*".to_owned()],
            interface_regexes: vec![],
        }],
        ..config()
    });
    engine.track_interface(&["fe80::1/64"]);

    engine.inject(peer_hello(1, false, HelloFlags::empty()));

    assert_eq!(engine.neighbor_state(), None);
    assert_eq!(engine.master.counters.get("spark.neighbor_no_area"), 1);
}

#[tokio::test]
async fn test_state_query() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    let (responsep, mut responsec) = oneshot::channel();
    let msg = StateQueryMsg {
        ifname: IFNAME.to_owned(),
        neighbor_node_name: PEER.to_owned(),
        responsep,
    };
    engine.master.process_protocol_msg(ProtocolMsg::StateQuery(msg));
    assert_eq!(responsec.try_recv().unwrap(), Some(State::Established));

    let (responsep, mut responsec) = oneshot::channel();
    let msg = StateQueryMsg {
        ifname: IFNAME.to_owned(),
        neighbor_node_name: "nobody".to_owned(),
        responsep,
    };
    engine.master.process_protocol_msg(ProtocolMsg::StateQuery(msg));
    assert_eq!(responsec.try_recv().unwrap(), None);
}

#[tokio::test]
async fn test_global_counters() {
    let mut engine = setup(config());
    engine.bring_up(&["fe80::1/64"]);

    engine.master.process_protocol_msg(ProtocolMsg::CounterUpdate(
        spark::tasks::messages::input::CounterUpdateMsg {},
    ));

    let counters = &engine.master.counters;
    assert_eq!(counters.get("spark.num_tracked_interfaces"), 1);
    assert_eq!(counters.get("spark.num_tracked_neighbors"), 1);
    assert_eq!(counters.get("spark.num_adjacent_neighbors"), 1);
    assert_eq!(counters.get("spark.tracked_adjacent_neighbors_diff"), 0);
    assert_eq!(
        counters.get("spark.my_seq_num"),
        engine.master.my_seq_num as i64
    );
    assert_eq!(
        counters.get(&format!("spark.seq_num.{PEER}")),
        engine.master.neighbors[IFNAME][PEER].seq_num as i64
    );
    assert!(counters.get(&format!("spark.rtt_latest_us.{PEER}")) > 0);
    assert!(counters.get(&format!("spark.rtt_us.{PEER}.{IFNAME}")) > 0);
}

#[tokio::test]
async fn test_unknown_interface_packet() {
    let mut engine = setup(config());
    engine.track_interface(&["fe80::1/64"]);

    let msg = NetRxPacketMsg {
        ifindex: 99,
        src: "fe80::2".parse().unwrap(),
        bytes: 64,
        recv_ts_us: Utc::now().timestamp_micros(),
        packet: Ok(peer_hello(1, false, HelloFlags::empty())),
    };
    engine
        .master
        .process_protocol_msg(ProtocolMsg::NetRxPacket(msg));

    assert_eq!(engine.neighbor_state(), None);
    assert_eq!(engine.master.counters.get("spark.hello_packet_recv"), 1);
}
