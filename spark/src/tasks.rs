//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::sync::Arc;
use std::time::Duration;

use spark_utils::Sender;
use spark_utils::socket::{AsyncFd, Socket};
use spark_utils::task::{IntervalTask, Task, TimeoutTask};
use tracing::{Instrument, debug_span};

use crate::network;

//
// Spark tasks diagram:
//
//                                 +--------------+
//                  net_rx (1x) -> |              | -> (1x) net_tx
//          hello_interval (Nx) -> |              |
//      heartbeat_interval (Nx) -> |              |
//      negotiate_interval (Nx) -> |    master    | -> (1x) neighbor events
//           hold timers (3xNx) -> |              |
//         counter_update (1x) --> |              |
//                                 +--------------+
//                                        ^ (1x) interface updates
//                                        |
//                                 +--------------+
//                                 | link monitor |
//                                 +--------------+
//

// Spark inter-task message types.
pub mod messages {
    use serde::{Deserialize, Serialize};

    // Type aliases.
    pub type ProtocolInputMsg = input::ProtocolMsg;
    pub type ProtocolOutputMsg = output::ProtocolMsg;

    // Input messages (child task -> main task).
    pub mod input {
        use std::net::Ipv6Addr;

        use tokio::sync::oneshot;

        use super::*;
        use crate::neighbor::State;
        use crate::packet::{DecodeError, Packet};

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub enum ProtocolMsg {
            NetRxPacket(NetRxPacketMsg),
            HelloInterval(HelloIntervalMsg),
            HeartbeatInterval(HeartbeatIntervalMsg),
            NegotiateInterval(NegotiateIntervalMsg),
            NegotiateHoldTimer(NeighborTimerMsg),
            HeartbeatHoldTimer(NeighborTimerMsg),
            GrHoldTimer(NeighborTimerMsg),
            CounterUpdate(CounterUpdateMsg),
            #[serde(skip)]
            StateQuery(StateQueryMsg),
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct NetRxPacketMsg {
            pub ifindex: u32,
            pub src: Ipv6Addr,
            pub bytes: usize,
            pub recv_ts_us: i64,
            pub packet: Result<Packet, DecodeError>,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct HelloIntervalMsg {
            pub ifname: String,
            pub in_fast_init: bool,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct HeartbeatIntervalMsg {
            pub ifname: String,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct NegotiateIntervalMsg {
            pub ifname: String,
            pub neighbor_node_name: String,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct NeighborTimerMsg {
            pub ifname: String,
            pub neighbor_node_name: String,
        }

        #[derive(Debug)]
        #[derive(Deserialize, Serialize)]
        pub struct CounterUpdateMsg {}

        // Cross-task neighbor state query.
        #[derive(Debug)]
        pub struct StateQueryMsg {
            pub ifname: String,
            pub neighbor_node_name: String,
            pub responsep: oneshot::Sender<Option<State>>,
        }
    }

    // Output messages (main task -> child task).
    pub mod output {
        use std::net::Ipv6Addr;

        use bytes::Bytes;

        use super::*;
        #[cfg(feature = "testing")]
        use crate::packet::Packet;

        #[derive(Debug)]
        #[derive(Serialize)]
        pub enum ProtocolMsg {
            NetTxPacket(NetTxPacketMsg),
        }

        #[derive(Debug)]
        #[derive(Serialize)]
        pub struct NetTxPacketMsg {
            pub ifname: String,
            pub ifindex: u32,
            pub src: Ipv6Addr,
            pub buf: Bytes,
            #[cfg(feature = "testing")]
            pub packet: Packet,
        }
    }
}

// ===== Spark tasks =====

// Network Rx task.
pub(crate) fn net_rx(
    socket: Arc<AsyncFd<Socket>>,
    net_packet_rxp: &Sender<messages::input::NetRxPacketMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("input");
        let _span2_guard = span2.enter();

        let net_packet_rxp = net_packet_rxp.clone();
        Task::spawn_supervised(move || {
            let socket = socket.clone();
            let net_packet_rxp = net_packet_rxp.clone();
            async move {
                let _ = network::read_loop(socket, net_packet_rxp).await;
            }
            .in_current_span()
        })
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Network Tx task.
#[allow(unused_mut)]
pub(crate) fn net_tx(
    socket: Arc<AsyncFd<Socket>>,
    udp_port: u16,
    mut net_tx_packetc: spark_utils::UnboundedReceiver<
        messages::output::NetTxPacketMsg,
    >,
    #[cfg(feature = "testing")] proto_output_tx: &Sender<
        messages::ProtocolOutputMsg,
    >,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let span1 = debug_span!("network");
        let _span1_guard = span1.enter();
        let span2 = debug_span!("output");
        let _span2_guard = span2.enter();

        Task::spawn(
            async move {
                network::write_loop(socket, udp_port, net_tx_packetc).await;
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        let proto_output_tx = proto_output_tx.clone();
        Task::spawn(async move {
            // Relay message to the test framework.
            while let Some(msg) = net_tx_packetc.recv().await {
                let msg = messages::ProtocolOutputMsg::NetTxPacket(msg);
                let _ = proto_output_tx.send(msg).await;
            }
        })
    }
}

// Sends periodic hello ticks for one interface.
//
// The first tick is delayed by one fast period so the kernel has a chance
// to finish link-local autoconfiguration before the first hello goes out.
// While the fast-init window lasts, ticks come at the fast period and are
// flagged so the resulting hellos solicit immediate replies. Both regimes
// apply a +-20% uniform jitter.
pub(crate) fn hello_interval(
    ifname: &str,
    hello_time: Duration,
    fast_init_hello_time: Duration,
    hello_intervalp: &Sender<messages::input::HelloIntervalMsg>,
) -> Task<()> {
    #[cfg(not(feature = "testing"))]
    {
        let ifname = ifname.to_owned();
        let hello_intervalp = hello_intervalp.clone();
        Task::spawn(
            async move {
                let start = tokio::time::Instant::now();
                tokio::time::sleep(jittered(fast_init_hello_time)).await;
                loop {
                    let in_fast_init =
                        start.elapsed() <= 6 * fast_init_hello_time;
                    let msg = messages::input::HelloIntervalMsg {
                        ifname: ifname.clone(),
                        in_fast_init,
                    };
                    if hello_intervalp.send(msg).await.is_err() {
                        break;
                    }

                    let period = if in_fast_init {
                        fast_init_hello_time
                    } else {
                        hello_time
                    };
                    tokio::time::sleep(jittered(period)).await;
                }
            }
            .in_current_span(),
        )
    }
    #[cfg(feature = "testing")]
    {
        Task::spawn(async move { std::future::pending().await })
    }
}

// Sends periodic heartbeat ticks for one interface.
pub(crate) fn heartbeat_interval(
    ifname: &str,
    heartbeat_time: Duration,
    heartbeat_intervalp: &Sender<messages::input::HeartbeatIntervalMsg>,
) -> IntervalTask {
    let ifname = ifname.to_owned();
    let heartbeat_intervalp = heartbeat_intervalp.clone();
    IntervalTask::new(heartbeat_time, false, move || {
        let ifname = ifname.clone();
        let heartbeat_intervalp = heartbeat_intervalp.clone();
        async move {
            let msg = messages::input::HeartbeatIntervalMsg { ifname };
            let _ = heartbeat_intervalp.send(msg).await;
        }
    })
}

// Sends periodic handshake ticks while a neighbor is in NEGOTIATE.
pub(crate) fn negotiate_interval(
    ifname: &str,
    neighbor_node_name: &str,
    handshake_time: Duration,
    negotiate_intervalp: &Sender<messages::input::NegotiateIntervalMsg>,
) -> IntervalTask {
    let ifname = ifname.to_owned();
    let neighbor_node_name = neighbor_node_name.to_owned();
    let negotiate_intervalp = negotiate_intervalp.clone();
    IntervalTask::new(handshake_time, false, move || {
        let ifname = ifname.clone();
        let neighbor_node_name = neighbor_node_name.clone();
        let negotiate_intervalp = negotiate_intervalp.clone();
        async move {
            let msg = messages::input::NegotiateIntervalMsg {
                ifname,
                neighbor_node_name,
            };
            let _ = negotiate_intervalp.send(msg).await;
        }
    })
}

// Neighbor hold timer of the given flavor. The message carries the
// (interface, neighbor) key only; the main task looks the neighbor up when
// the timer fires and ignores the expiry if it is gone.
pub(crate) fn neighbor_hold_timer(
    ifname: &str,
    neighbor_node_name: &str,
    holdtime: Duration,
    hold_timerp: &Sender<messages::input::NeighborTimerMsg>,
) -> TimeoutTask {
    let ifname = ifname.to_owned();
    let neighbor_node_name = neighbor_node_name.to_owned();
    let hold_timerp = hold_timerp.clone();
    TimeoutTask::new(holdtime, move || async move {
        let msg = messages::input::NeighborTimerMsg {
            ifname,
            neighbor_node_name,
        };
        let _ = hold_timerp.send(msg).await;
    })
}

// Periodic global counter refresh.
pub(crate) fn counter_update_interval(
    interval: Duration,
    counter_updatep: &Sender<messages::input::CounterUpdateMsg>,
) -> IntervalTask {
    let counter_updatep = counter_updatep.clone();
    IntervalTask::new(interval, false, move || {
        let counter_updatep = counter_updatep.clone();
        async move {
            let msg = messages::input::CounterUpdateMsg {};
            let _ = counter_updatep.send(msg).await;
        }
    })
}

// ===== helper functions =====

#[cfg(not(feature = "testing"))]
fn jittered(duration: Duration) -> Duration {
    use rand::Rng;

    let base = duration.as_millis() as i64;
    let jitter = rand::rng().random_range(-base / 5..=base / 5);
    Duration::from_millis((base + jitter).max(1) as u64)
}
