//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use spark_utils::socket::{AsyncFd, Socket};
use spark_utils::task::{IntervalTask, Task};
use spark_utils::{Receiver, Sender, UnboundedSender};
use tokio::sync::{mpsc, oneshot};

use crate::area::{AreaCfg, AreaTable};
use crate::consts::{
    COUNTER_UPDATE_INTERVAL, MIN_IPV6_MTU, NUM_RESTARTING_PKT_SENT,
    SR_LOCAL_RANGE,
};
use crate::debug::Debug;
use crate::error::{Error, IoError};
use crate::events;
use crate::interface::{Interface, InterfaceDatabase, InterfaceNetworks};
use crate::neighbor::{Neighbor, State};
use crate::packet::{
    HandshakeMsg, HeartbeatMsg, HelloFlags, HelloMsg, Packet,
    ReflectedNeighborInfo,
};
use crate::rate_limit::RateLimiter;
use crate::tasks;
use crate::tasks::messages::input::{
    CounterUpdateMsg, HeartbeatIntervalMsg, HelloIntervalMsg,
    NegotiateIntervalMsg, NeighborTimerMsg, NetRxPacketMsg, StateQueryMsg,
};
use crate::tasks::messages::ProtocolInputMsg;
#[cfg(feature = "testing")]
use crate::tasks::messages::ProtocolOutputMsg;
use crate::tasks::messages::output::NetTxPacketMsg;
use crate::{interface, network};

#[derive(Debug)]
pub struct Master {
    // Engine configuration.
    pub config: Arc<Config>,
    // Shared neighbor discovery socket.
    pub socket: Arc<AsyncFd<Socket>>,
    // Sequence number, incremented on every hello or heartbeat sent.
    pub my_seq_num: u64,
    // Tracked interfaces.
    pub interfaces: BTreeMap<String, Interface>,
    // Tracked neighbors, per interface.
    pub neighbors: BTreeMap<String, BTreeMap<String, Neighbor>>,
    // Established neighbors, per interface.
    pub active_neighbors: BTreeMap<String, BTreeSet<String>>,
    // Segment Routing labels currently in use.
    pub allocated_labels: BTreeSet<u32>,
    // Area deduction table.
    pub area_table: AreaTable,
    // Hello arrival rate limiter.
    pub rate_limiter: RateLimiter,
    // Counters.
    pub counters: Counters,
    // Instance Tx channels.
    pub tx: InstanceChannelsTx,
    // Network Tx channel and child tasks.
    net_tx_packetp: UnboundedSender<NetTxPacketMsg>,
    _net_rx_task: Task<()>,
    _net_tx_task: Task<()>,
    _counter_update_task: IntervalTask,
}

//
// Engine configuration.
//
// All times are validated at startup; the hold time must leave room for at
// least three keepalives so transient packet loss can't tear adjacencies
// down.
//
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Config {
    pub domain_name: String,
    pub node_name: String,
    pub udp_port: u16,
    // Graceful restart hold time advertised to peers.
    pub hold_time: Duration,
    pub keepalive_time: Duration,
    pub fast_init_keepalive_time: Duration,
    pub hello_time: Duration,
    pub fast_init_hello_time: Duration,
    pub handshake_time: Duration,
    pub heartbeat_time: Duration,
    pub negotiate_hold_time: Duration,
    pub heartbeat_hold_time: Duration,
    pub ip_tos: Option<u8>,
    pub enable_v4: bool,
    pub enable_flood_optimization: bool,
    pub kvstore_cmd_port: i32,
    pub ctrl_port: i32,
    pub version: u32,
    pub lowest_supported_version: u32,
    pub areas: Vec<AreaCfg>,
}

// Flat counter and gauge store, refreshed at the points required by the
// observability contract and exposed for operators and tests.
#[derive(Debug, Default)]
pub struct Counters(BTreeMap<String, i64>);

// Neighbor event published to the upstream consumer.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborEvent {
    pub event_type: NeighborEventType,
    pub ifname: String,
    pub neighbor: NeighborInfo,
    pub rtt_us: i64,
    pub label: u32,
    pub support_flood_optimization: bool,
    pub area: String,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum NeighborEventType {
    NeighborUp,
    NeighborDown,
    NeighborRestarting,
    NeighborRestarted,
    NeighborRttChange,
}

// Snapshot of the originating neighbor carried inside an event.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct NeighborInfo {
    pub domain_name: String,
    pub node_name: String,
    pub remote_ifname: String,
    pub transport_address_v4: Option<Ipv4Addr>,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub ctrl_port: i32,
    pub kvstore_cmd_port: i32,
    pub hold_time_ms: i64,
}

// Instance output channels.
#[derive(Clone, Debug)]
pub struct InstanceChannelsTx {
    // Neighbor events to the upstream consumer.
    pub neighbor_event: UnboundedSender<NeighborEvent>,
    // Protocol input back-channels, cloned into timers.
    pub protocol_input: ProtocolInputChannelsTx,
    #[cfg(feature = "testing")]
    pub protocol_output: Sender<ProtocolOutputMsg>,
}

#[derive(Clone, Debug)]
pub struct ProtocolInputChannelsTx {
    pub net_packet_rx: Sender<NetRxPacketMsg>,
    pub hello_interval: Sender<HelloIntervalMsg>,
    pub heartbeat_interval: Sender<HeartbeatIntervalMsg>,
    pub negotiate_interval: Sender<NegotiateIntervalMsg>,
    pub negotiate_hold_timer: Sender<NeighborTimerMsg>,
    pub heartbeat_hold_timer: Sender<NeighborTimerMsg>,
    pub gr_hold_timer: Sender<NeighborTimerMsg>,
    pub counter_update: Sender<CounterUpdateMsg>,
    pub state_query: Sender<StateQueryMsg>,
}

#[derive(Debug)]
pub struct ProtocolInputChannelsRx {
    pub net_packet_rx: Receiver<NetRxPacketMsg>,
    pub hello_interval: Receiver<HelloIntervalMsg>,
    pub heartbeat_interval: Receiver<HeartbeatIntervalMsg>,
    pub negotiate_interval: Receiver<NegotiateIntervalMsg>,
    pub negotiate_hold_timer: Receiver<NeighborTimerMsg>,
    pub heartbeat_hold_timer: Receiver<NeighborTimerMsg>,
    pub gr_hold_timer: Receiver<NeighborTimerMsg>,
    pub counter_update: Receiver<CounterUpdateMsg>,
    pub state_query: Receiver<StateQueryMsg>,
}

// Instance input channels consumed by the event loop.
#[derive(Debug)]
pub struct InstanceChannelsRx {
    pub protocol_input: ProtocolInputChannelsRx,
    pub interface_upd: Receiver<InterfaceDatabase>,
    pub shutdown: Receiver<()>,
}

// Handle for interacting with a spawned engine.
#[derive(Debug)]
pub struct SparkHandle {
    pub state_queryp: Sender<StateQueryMsg>,
    pub shutdownp: Sender<()>,
    _task: Task<()>,
}

// ===== impl Master =====

impl Master {
    pub fn new(
        config: Config,
        tx: InstanceChannelsTx,
    ) -> Result<Master, Error> {
        config.validate()?;
        let area_table = AreaTable::new(&config.areas)?;

        // Initialize the shared UDP socket and its Rx/Tx tasks.
        let socket = network::socket(config.udp_port, config.ip_tos)
            .and_then(AsyncFd::new)
            .map(Arc::new)
            .map_err(IoError::SocketError)?;
        let net_rx_task =
            tasks::net_rx(socket.clone(), &tx.protocol_input.net_packet_rx);
        let (net_tx_packetp, net_tx_packetc) = mpsc::unbounded_channel();
        let net_tx_task = tasks::net_tx(
            socket.clone(),
            config.udp_port,
            net_tx_packetc,
            #[cfg(feature = "testing")]
            &tx.protocol_output,
        );
        let counter_update_task = tasks::counter_update_interval(
            COUNTER_UPDATE_INTERVAL,
            &tx.protocol_input.counter_update,
        );

        Ok(Master {
            config: Arc::new(config),
            socket,
            my_seq_num: 0,
            interfaces: Default::default(),
            neighbors: Default::default(),
            active_neighbors: Default::default(),
            allocated_labels: Default::default(),
            area_table,
            rate_limiter: RateLimiter::new(Instant::now()),
            counters: Default::default(),
            tx,
            net_tx_packetp,
            _net_rx_task: net_rx_task,
            _net_tx_task: net_tx_task,
            _counter_update_task: counter_update_task,
        })
    }

    // Engine event loop. All mutable state is owned by this task; child
    // tasks communicate exclusively through the input channels.
    pub async fn run(mut self, mut rx: InstanceChannelsRx) {
        loop {
            tokio::select! {
                msg = rx.interface_upd.recv() => match msg {
                    Some(db) => {
                        // A multicast join failure or a foreign node name
                        // violates the engine's tracking invariants and is
                        // fatal.
                        if let Err(error) = self.process_interface_update(db)
                        {
                            error.log();
                            return;
                        }
                    }
                    None => break,
                },
                msg = rx.protocol_input.recv() => match msg {
                    Some(msg) => self.process_protocol_msg(msg),
                    None => break,
                },
                _ = rx.shutdown.recv() => break,
            }
        }

        self.shutdown();
    }

    // Processes a message from one of the child tasks.
    pub fn process_protocol_msg(&mut self, msg: ProtocolInputMsg) {
        if let Err(error) = match msg {
            ProtocolInputMsg::NetRxPacket(msg) => {
                events::process_packet(self, msg)
            }
            ProtocolInputMsg::HelloInterval(msg) => {
                events::process_hello_interval(self, msg)
            }
            ProtocolInputMsg::HeartbeatInterval(msg) => {
                events::process_heartbeat_interval(self, msg)
            }
            ProtocolInputMsg::NegotiateInterval(msg) => {
                events::process_negotiate_interval(self, msg)
            }
            ProtocolInputMsg::NegotiateHoldTimer(msg) => {
                events::process_negotiate_hold_expiry(self, msg)
            }
            ProtocolInputMsg::HeartbeatHoldTimer(msg) => {
                events::process_heartbeat_hold_expiry(self, msg)
            }
            ProtocolInputMsg::GrHoldTimer(msg) => {
                events::process_gr_hold_expiry(self, msg)
            }
            ProtocolInputMsg::CounterUpdate(_) => {
                self.update_global_counters();
                Ok(())
            }
            ProtocolInputMsg::StateQuery(msg) => {
                events::process_state_query(self, msg)
            }
        } {
            error.log();
        }
    }

    //
    // Reconciles the desired interface set from a link monitor snapshot
    // against the tracked set: removals first, then additions, then
    // updates. Applying the same snapshot twice is a no-op.
    //
    pub fn process_interface_update(
        &mut self,
        db: InterfaceDatabase,
    ) -> Result<(), Error> {
        if db.node_name != self.config.node_name {
            return Err(Error::NodeNameMismatch(
                self.config.node_name.clone(),
                db.node_name,
            ));
        }

        let mut desired = db
            .interfaces
            .iter()
            .filter_map(|(ifname, info)| {
                interface::eligible_networks(info, self.config.enable_v4)
                    .map(|networks| (ifname.clone(), networks))
            })
            .collect::<BTreeMap<_, _>>();

        let to_del = self
            .interfaces
            .keys()
            .filter(|ifname| !desired.contains_key(*ifname))
            .cloned()
            .collect::<Vec<_>>();
        let to_add = desired
            .keys()
            .filter(|ifname| !self.interfaces.contains_key(*ifname))
            .cloned()
            .collect::<Vec<_>>();
        let to_update = desired
            .keys()
            .filter(|ifname| self.interfaces.contains_key(*ifname))
            .cloned()
            .collect::<Vec<_>>();

        for ifname in to_del {
            self.remove_interface(&ifname);
        }
        for ifname in to_add {
            let networks = desired.remove(&ifname).unwrap();
            self.add_interface(ifname, networks)?;
        }
        for ifname in to_update {
            let networks = desired.remove(&ifname).unwrap();
            self.update_interface(&ifname, networks)?;
        }

        Ok(())
    }

    // Stops tracking an interface, bringing down all of its neighbors.
    fn remove_interface(&mut self, ifname: &str) {
        if let Some(neighbors) = self.neighbors.remove(ifname) {
            for neighbor in neighbors.values() {
                self.allocated_labels.remove(&neighbor.label);

                // A neighbor whose transport addresses were never learned
                // hasn't been announced upstream, so there is nothing to
                // bring down.
                if !neighbor.transport_populated(self.config.enable_v4) {
                    continue;
                }
                events::notify_neighbor_event(
                    &self.tx,
                    NeighborEventType::NeighborDown,
                    ifname,
                    neighbor,
                    self.config.enable_flood_optimization,
                );
            }
        }
        self.active_neighbors.remove(ifname);

        if let Some(iface) = self.interfaces.remove(ifname) {
            // On error, log and continue: the interface is likely already
            // gone from the kernel.
            if let Err(error) =
                network::leave_multicast(self.socket.get_ref(), iface.ifindex)
            {
                error.log();
            }
        }
    }

    // Starts tracking an interface: joins the multicast group and arms the
    // periodic hello and heartbeat timers. A join failure here is
    // propagated to the caller.
    fn add_interface(
        &mut self,
        ifname: String,
        networks: InterfaceNetworks,
    ) -> Result<(), Error> {
        debug_assert_ne!(networks.ifindex, 0);

        network::join_multicast(self.socket.get_ref(), networks.ifindex)?;

        Debug::InterfaceAdd(&ifname, networks.ifindex).log();
        let mut iface = Interface::new(ifname.clone(), networks);
        iface.heartbeat_interval = Some(tasks::heartbeat_interval(
            &ifname,
            self.config.heartbeat_time,
            &self.tx.protocol_input.heartbeat_interval,
        ));
        iface.hello_task = Some(tasks::hello_interval(
            &ifname,
            self.config.hello_time,
            self.config.fast_init_hello_time,
            &self.tx.protocol_input.hello_interval,
        ));

        self.neighbors.entry(ifname.clone()).or_default();
        self.interfaces.insert(ifname, iface);
        Ok(())
    }

    // Updates a tracked interface in place. When the ifindex changed, the
    // multicast membership moves with it; failure to join the new ifindex
    // is propagated.
    fn update_interface(
        &mut self,
        ifname: &str,
        networks: InterfaceNetworks,
    ) -> Result<(), Error> {
        let iface = self.interfaces.get_mut(ifname).unwrap();
        if iface.same_networks(&networks) {
            return Ok(());
        }

        if iface.ifindex != networks.ifindex {
            if let Err(error) =
                network::leave_multicast(self.socket.get_ref(), iface.ifindex)
            {
                error.log();
            }
            network::join_multicast(
                self.socket.get_ref(),
                networks.ifindex,
            )?;
        }

        Debug::InterfaceUpdate(ifname, networks.ifindex).log();
        iface.ifindex = networks.ifindex;
        iface.v4_network = networks.v4_network;
        iface.v6_linklocal_network = networks.v6_linklocal_network;
        Ok(())
    }

    // Builds and sends a hello on the given interface, reflecting every
    // tracked neighbor. The sequence number is incremented whether or not
    // the packet makes it out.
    pub(crate) fn send_hello(
        &mut self,
        ifname: &str,
        in_fast_init: bool,
        restarting: bool,
    ) {
        let Some(iface) = self.interfaces.get(ifname) else {
            tracing::debug!(%ifname, "interface is no longer tracked");
            return;
        };
        let ifindex = iface.ifindex;
        let src = iface.v6_linklocal_network.ip();

        let mut flags = HelloFlags::empty();
        if in_fast_init {
            flags.insert(HelloFlags::SOLICIT_RESPONSE);
        }
        if restarting {
            flags.insert(HelloFlags::RESTARTING);
        }

        let neighbor_infos = self
            .neighbors
            .get(ifname)
            .into_iter()
            .flatten()
            .map(|(name, nbr)| {
                (
                    name.clone(),
                    ReflectedNeighborInfo::new(
                        nbr.seq_num,
                        nbr.neighbor_timestamp_us,
                        nbr.local_timestamp_us,
                    ),
                )
            })
            .collect();

        let hello = HelloMsg {
            domain_name: self.config.domain_name.clone(),
            node_name: self.config.node_name.clone(),
            ifname: ifname.to_owned(),
            seq_num: self.my_seq_num,
            version: self.config.version,
            flags,
            sent_ts_us: Utc::now().timestamp_micros(),
            neighbor_infos,
        };

        self.my_seq_num += 1;
        self.send_packet(
            ifname,
            ifindex,
            src,
            Packet::Hello(hello),
            "spark.hello",
        );
    }

    // Builds and sends a handshake targeted at the given neighbor.
    pub(crate) fn send_handshake(
        &mut self,
        ifname: &str,
        neighbor_node_name: &str,
        neighbor_area: &str,
        is_adj_established: bool,
    ) {
        let Some(iface) = self.interfaces.get(ifname) else {
            tracing::debug!(%ifname, "interface is no longer tracked");
            return;
        };
        let ifindex = iface.ifindex;
        let src = iface.v6_linklocal_network.ip();

        let handshake = HandshakeMsg {
            node_name: self.config.node_name.clone(),
            is_adj_established,
            hold_time: self.config.heartbeat_hold_time.as_millis() as i64,
            graceful_restart_time: self.config.hold_time.as_millis() as i64,
            transport_address_v6: src,
            transport_address_v4: iface.v4_network.ip(),
            ctrl_port: self.config.ctrl_port,
            kvstore_cmd_port: self.config.kvstore_cmd_port,
            area: neighbor_area.to_owned(),
            neighbor_node_name: Some(neighbor_node_name.to_owned()),
        };

        self.send_packet(
            ifname,
            ifindex,
            src,
            Packet::Handshake(handshake),
            "spark.handshake",
        );
    }

    // Builds and sends a heartbeat on the given interface. Skipped
    // entirely while no adjacency is established there.
    pub(crate) fn send_heartbeat(&mut self, ifname: &str) {
        if self
            .active_neighbors
            .get(ifname)
            .is_none_or(|active| active.is_empty())
        {
            return;
        }
        let Some(iface) = self.interfaces.get(ifname) else {
            tracing::debug!(%ifname, "interface is no longer tracked");
            return;
        };
        let ifindex = iface.ifindex;
        let src = iface.v6_linklocal_network.ip();

        let heartbeat = HeartbeatMsg::new(
            self.config.node_name.clone(),
            self.my_seq_num,
        );

        self.my_seq_num += 1;
        self.send_packet(
            ifname,
            ifindex,
            src,
            Packet::Heartbeat(heartbeat),
            "spark.heartbeat",
        );
    }

    // Encodes and hands a packet to the Tx task, enforcing the payload
    // bound and updating the per-message-type counters.
    fn send_packet(
        &mut self,
        ifname: &str,
        ifindex: u32,
        src: Ipv6Addr,
        packet: Packet,
        counter_prefix: &str,
    ) {
        let buf = packet.encode();
        if buf.len() > MIN_IPV6_MTU {
            IoError::PacketTooBig(buf.len()).log();
            return;
        }

        Debug::PacketTx(ifname, &packet).log();
        self.counters
            .add(&format!("{counter_prefix}.bytes_sent"), buf.len() as i64);
        self.counters
            .add(&format!("{counter_prefix}.packets_sent"), 1);

        let msg = NetTxPacketMsg {
            ifname: ifname.to_owned(),
            ifindex,
            src,
            buf: buf.freeze(),
            #[cfg(feature = "testing")]
            packet,
        };
        let _ = self.net_tx_packetp.send(msg);
    }

    // Allocates a Segment Routing label for a new neighbor: the ifindex
    // offset into the local range when free, otherwise the first free
    // label probing down from the top of the range.
    pub(crate) fn allocate_label(&mut self, ifindex: u32) -> Result<u32, Error> {
        let label = SR_LOCAL_RANGE.start() + ifindex;
        if self.allocated_labels.insert(label) {
            return Ok(label);
        }

        let mut label = *SR_LOCAL_RANGE.end();
        while !self.allocated_labels.insert(label) {
            if label == *SR_LOCAL_RANGE.start() {
                return Err(Error::LabelExhausted);
            }
            label -= 1;
        }
        Ok(label)
    }

    // Maps an incoming packet's ifindex back to a tracked interface.
    pub(crate) fn find_interface_by_ifindex(
        &self,
        ifindex: u32,
    ) -> Option<&str> {
        self.interfaces
            .values()
            .find(|iface| iface.ifindex == ifindex)
            .map(|iface| iface.name.as_str())
    }

    // Refreshes the global and per-neighbor gauges.
    pub fn update_global_counters(&mut self) {
        let Master {
            interfaces,
            neighbors,
            counters,
            my_seq_num,
            ..
        } = self;

        let mut tracked_count = 0;
        let mut adjacent_count = 0;
        let mut pending_timers = 2 * interfaces.len() as i64 + 1;
        for (ifname, neighbors) in neighbors {
            tracked_count += neighbors.len() as i64;
            for neighbor in neighbors.values() {
                adjacent_count +=
                    (neighbor.state == State::Established) as i64;
                pending_timers += [
                    neighbor.negotiate_interval.is_some(),
                    neighbor.negotiate_hold_timer.is_some(),
                    neighbor.heartbeat_hold_timer.is_some(),
                    neighbor.graceful_restart_hold_timer.is_some(),
                ]
                .into_iter()
                .filter(|armed| *armed)
                .count() as i64;

                counters.set(
                    format!(
                        "spark.rtt_us.{}.{}",
                        neighbor.node_name, ifname
                    ),
                    neighbor
                        .rtt
                        .map(|rtt| rtt.as_micros() as i64)
                        .unwrap_or(0),
                );
                counters.set(
                    format!("spark.rtt_latest_us.{}", neighbor.node_name),
                    neighbor.rtt_latest.as_micros() as i64,
                );
                counters.set(
                    format!("spark.seq_num.{}", neighbor.node_name),
                    neighbor.seq_num as i64,
                );
            }
        }

        counters.set(
            "spark.num_tracked_interfaces".to_owned(),
            interfaces.len() as i64,
        );
        counters.set("spark.num_tracked_neighbors".to_owned(), tracked_count);
        counters
            .set("spark.num_adjacent_neighbors".to_owned(), adjacent_count);
        counters.set(
            "spark.tracked_adjacent_neighbors_diff".to_owned(),
            tracked_count - adjacent_count,
        );
        counters.set("spark.my_seq_num".to_owned(), *my_seq_num as i64);
        counters.set("spark.pending_timers".to_owned(), pending_timers);
    }

    // Announces the impending shutdown so peers enter graceful restart
    // instead of tearing adjacencies down. Duplicates are sent in case
    // some packets get lost.
    fn shutdown(&mut self) {
        let ifnames = self.interfaces.keys().cloned().collect::<Vec<_>>();
        for _ in 0..NUM_RESTARTING_PKT_SENT {
            for ifname in &ifnames {
                self.send_hello(ifname, false, true);
            }
        }
    }
}

// ===== impl Config =====

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.keepalive_time.is_zero() {
            return Err(Error::InvalidTimerConfig(
                "keepalive time can't be zero",
            ));
        }
        if self.fast_init_keepalive_time.is_zero() {
            return Err(Error::InvalidTimerConfig(
                "fast-init keepalive time can't be zero",
            ));
        }
        if self.fast_init_keepalive_time > self.keepalive_time {
            return Err(Error::InvalidTimerConfig(
                "fast-init keepalive time can't exceed the keepalive time",
            ));
        }
        if self.hold_time < 3 * self.keepalive_time {
            return Err(Error::InvalidTimerConfig(
                "hold time must cover at least three keepalives",
            ));
        }
        if self.fast_init_hello_time > self.hello_time {
            return Err(Error::InvalidTimerConfig(
                "fast-init hello time can't exceed the hello time",
            ));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            domain_name: String::new(),
            node_name: String::new(),
            udp_port: 6666,
            hold_time: Duration::from_secs(30),
            keepalive_time: Duration::from_secs(2),
            fast_init_keepalive_time: Duration::from_millis(100),
            hello_time: Duration::from_secs(20),
            fast_init_hello_time: Duration::from_millis(500),
            handshake_time: Duration::from_millis(500),
            heartbeat_time: Duration::from_secs(2),
            negotiate_hold_time: Duration::from_secs(1),
            heartbeat_hold_time: Duration::from_secs(10),
            ip_tos: Some(192),
            enable_v4: false,
            enable_flood_optimization: true,
            kvstore_cmd_port: 60002,
            ctrl_port: 2018,
            version: 1,
            lowest_supported_version: 1,
            areas: Vec::new(),
        }
    }
}

// ===== impl Counters =====

impl Counters {
    pub(crate) fn add(&mut self, name: &str, value: i64) {
        match self.0.get_mut(name) {
            Some(counter) => *counter += value,
            None => {
                self.0.insert(name.to_owned(), value);
            }
        }
    }

    pub(crate) fn bump(&mut self, name: &str) {
        self.add(name, 1);
    }

    pub(crate) fn set(&mut self, name: impl Into<String>, value: i64) {
        self.0.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> i64 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, i64)> + '_ {
        self.0.iter().map(|(name, value)| (name.as_str(), *value))
    }
}

// ===== impl NeighborInfo =====

impl From<&Neighbor> for NeighborInfo {
    fn from(neighbor: &Neighbor) -> NeighborInfo {
        NeighborInfo {
            domain_name: neighbor.domain_name.clone(),
            node_name: neighbor.node_name.clone(),
            remote_ifname: neighbor.remote_ifname.clone(),
            transport_address_v4: neighbor.transport_address_v4,
            transport_address_v6: neighbor.transport_address_v6,
            ctrl_port: neighbor.ctrl_port,
            kvstore_cmd_port: neighbor.kvstore_cmd_port,
            hold_time_ms: neighbor.heartbeat_hold_time.as_millis() as i64,
        }
    }
}

// ===== impl ProtocolInputChannelsRx =====

impl ProtocolInputChannelsRx {
    pub async fn recv(&mut self) -> Option<ProtocolInputMsg> {
        tokio::select! {
            msg = self.net_packet_rx.recv() => {
                msg.map(ProtocolInputMsg::NetRxPacket)
            }
            msg = self.hello_interval.recv() => {
                msg.map(ProtocolInputMsg::HelloInterval)
            }
            msg = self.heartbeat_interval.recv() => {
                msg.map(ProtocolInputMsg::HeartbeatInterval)
            }
            msg = self.negotiate_interval.recv() => {
                msg.map(ProtocolInputMsg::NegotiateInterval)
            }
            msg = self.negotiate_hold_timer.recv() => {
                msg.map(ProtocolInputMsg::NegotiateHoldTimer)
            }
            msg = self.heartbeat_hold_timer.recv() => {
                msg.map(ProtocolInputMsg::HeartbeatHoldTimer)
            }
            msg = self.gr_hold_timer.recv() => {
                msg.map(ProtocolInputMsg::GrHoldTimer)
            }
            msg = self.counter_update.recv() => {
                msg.map(ProtocolInputMsg::CounterUpdate)
            }
            msg = self.state_query.recv() => {
                msg.map(ProtocolInputMsg::StateQuery)
            }
        }
    }
}

// ===== impl SparkHandle =====

impl SparkHandle {
    // Queries a neighbor's FSM state from outside the engine task.
    pub async fn neighbor_state(
        &self,
        ifname: &str,
        neighbor_node_name: &str,
    ) -> Option<State> {
        let (responsep, responsec) = oneshot::channel();
        let msg = StateQueryMsg {
            ifname: ifname.to_owned(),
            neighbor_node_name: neighbor_node_name.to_owned(),
            responsep,
        };
        self.state_queryp.send(msg).await.ok()?;
        responsec.await.ok().flatten()
    }
}

// ===== global functions =====

// Creates channels for all protocol input events.
pub fn protocol_input_channels()
-> (ProtocolInputChannelsTx, ProtocolInputChannelsRx) {
    let (net_packet_rxp, net_packet_rxc) = mpsc::channel(4);
    let (hello_intervalp, hello_intervalc) = mpsc::channel(4);
    let (heartbeat_intervalp, heartbeat_intervalc) = mpsc::channel(4);
    let (negotiate_intervalp, negotiate_intervalc) = mpsc::channel(4);
    let (negotiate_holdp, negotiate_holdc) = mpsc::channel(4);
    let (heartbeat_holdp, heartbeat_holdc) = mpsc::channel(4);
    let (gr_holdp, gr_holdc) = mpsc::channel(4);
    let (counter_updatep, counter_updatec) = mpsc::channel(4);
    let (state_queryp, state_queryc) = mpsc::channel(4);

    let tx = ProtocolInputChannelsTx {
        net_packet_rx: net_packet_rxp,
        hello_interval: hello_intervalp,
        heartbeat_interval: heartbeat_intervalp,
        negotiate_interval: negotiate_intervalp,
        negotiate_hold_timer: negotiate_holdp,
        heartbeat_hold_timer: heartbeat_holdp,
        gr_hold_timer: gr_holdp,
        counter_update: counter_updatep,
        state_query: state_queryp,
    };
    let rx = ProtocolInputChannelsRx {
        net_packet_rx: net_packet_rxc,
        hello_interval: hello_intervalc,
        heartbeat_interval: heartbeat_intervalc,
        negotiate_interval: negotiate_intervalc,
        negotiate_hold_timer: negotiate_holdc,
        heartbeat_hold_timer: heartbeat_holdc,
        gr_hold_timer: gr_holdc,
        counter_update: counter_updatec,
        state_query: state_queryc,
    };

    (tx, rx)
}

// Spawns a Spark engine consuming the given interface update stream and
// publishing neighbor events to the given queue.
pub fn spawn_spark_task(
    config: Config,
    interface_updc: Receiver<InterfaceDatabase>,
    neighbor_eventp: UnboundedSender<NeighborEvent>,
) -> Result<SparkHandle, Error> {
    let (protocol_input_tx, protocol_input_rx) = protocol_input_channels();
    let (shutdownp, shutdownc) = mpsc::channel(1);
    #[cfg(feature = "testing")]
    let (protocol_outputp, _protocol_outputc) = mpsc::channel(4);

    let state_queryp = protocol_input_tx.state_query.clone();
    let tx = InstanceChannelsTx {
        neighbor_event: neighbor_eventp,
        protocol_input: protocol_input_tx,
        #[cfg(feature = "testing")]
        protocol_output: protocol_outputp,
    };
    let master = Master::new(config, tx)?;

    let rx = InstanceChannelsRx {
        protocol_input: protocol_input_rx,
        interface_upd: interface_updc,
        shutdown: shutdownc,
    };
    let task = Task::spawn(master.run(rx));

    Ok(SparkHandle {
        state_queryp,
        shutdownp,
        _task: task,
    })
}
