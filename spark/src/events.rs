//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use ipnetwork::Ipv4Network;
use tracing::{trace, warn};

use crate::area::AreaResolveError;
use crate::consts::DEFAULT_AREA_ID;
use crate::debug::Debug;
use crate::error::Error;
use crate::master::{
    InstanceChannelsTx, Master, NeighborEvent, NeighborEventType,
};
use crate::neighbor::{self, Event, Neighbor, State};
use crate::packet::{HandshakeMsg, HeartbeatMsg, HelloFlags, HelloMsg, Packet};
use crate::tasks;
use crate::tasks::messages::input::{
    HeartbeatIntervalMsg, HelloIntervalMsg, NegotiateIntervalMsg,
    NeighborTimerMsg, NetRxPacketMsg, StateQueryMsg,
};

// ===== Packet input =====

pub(crate) fn process_packet(
    master: &mut Master,
    msg: NetRxPacketMsg,
) -> Result<(), Error> {
    master.counters.bump("spark.hello_packet_recv");
    master
        .counters
        .add("spark.hello_packet_recv_size", msg.bytes as i64);

    // Map the ingress ifindex back to a tracked interface.
    let Some(ifname) = master.find_interface_by_ifindex(msg.ifindex) else {
        return Err(Error::InterfaceNotFound(msg.ifindex));
    };
    let ifname = ifname.to_owned();

    // Per-(interface, source) rate limiting.
    if !master.rate_limiter.allow(&ifname, &msg.src, Instant::now()) {
        warn!(%ifname, src = %msg.src, "rate limiting hello packets");
        master.counters.bump("spark.hello_packet_dropped");
        return Ok(());
    }
    master.counters.bump("spark.hello_packet_processed");

    let packet = msg.packet.map_err(Error::PacketDecodeError)?;
    Debug::PacketRx(&ifname, &msg.src, &packet).log();

    match packet {
        Packet::Hello(hello) => {
            process_hello_msg(master, &ifname, hello, msg.recv_ts_us)
        }
        Packet::Handshake(handshake) => {
            process_handshake_msg(master, &ifname, handshake)
        }
        Packet::Heartbeat(heartbeat) => {
            process_heartbeat_msg(master, &ifname, heartbeat)
        }
    }
}

pub(crate) fn process_hello_msg(
    master: &mut Master,
    ifname: &str,
    hello: HelloMsg,
    my_recv_ts_us: i64,
) -> Result<(), Error> {
    let config = master.config.clone();
    let neighbor_name = hello.node_name.clone();

    // Packet sanity checks.
    if neighbor_name == config.node_name {
        trace!("ignoring self-looped hello packet");
        master
            .counters
            .bump("spark.invalid_keepalive.looped_packet");
        return Ok(());
    }
    if hello.domain_name != config.domain_name {
        warn!(
            neighbor = %neighbor_name, domain = %hello.domain_name,
            "ignoring hello packet from another domain",
        );
        master
            .counters
            .bump("spark.invalid_keepalive.different_domain");
        return Ok(());
    }
    if hello.version < config.lowest_supported_version {
        warn!(
            neighbor = %neighbor_name, version = %hello.version,
            "ignoring hello packet with unsupported version",
        );
        master
            .counters
            .bump("spark.invalid_keepalive.invalid_version");
        return Ok(());
    }

    // Track previously unseen neighbors, provided a unique area can be
    // deduced for them. Area deduction runs for unknown neighbors only;
    // area changes through reconfiguration aren't supported.
    let known = master
        .neighbors
        .get(ifname)
        .is_some_and(|neighbors| neighbors.contains_key(&neighbor_name));
    if !known {
        let area = match master.area_table.resolve(&neighbor_name, ifname) {
            Ok(area) => area.to_owned(),
            Err(error) => {
                warn!(
                    neighbor = %neighbor_name, ?error,
                    "failed to deduce neighbor area",
                );
                let counter = match error {
                    AreaResolveError::NoMatch => "spark.neighbor_no_area",
                    AreaResolveError::MultipleMatches => {
                        "spark.neighbor_multiple_area"
                    }
                };
                master.counters.bump(counter);
                return Ok(());
            }
        };

        let ifindex = master.interfaces.get(ifname).unwrap().ifindex;
        let label = master.allocate_label(ifindex)?;
        let neighbor = Neighbor::new(
            hello.domain_name.clone(),
            neighbor_name.clone(),
            hello.ifname.clone(),
            area,
            label,
            hello.seq_num,
            config.keepalive_time,
        );
        master
            .neighbors
            .get_mut(ifname)
            .unwrap()
            .insert(neighbor_name.clone(), neighbor);
    }

    // Update the timestamps used to build our reflected-neighbor entry,
    // and measure RTT when the peer has echoed a full exchange.
    let reflected = hello.neighbor_infos.get(&config.node_name).cloned();
    {
        let neighbor = master
            .neighbors
            .get_mut(ifname)
            .unwrap()
            .get_mut(&neighbor_name)
            .unwrap();
        neighbor.neighbor_timestamp_us = hello.sent_ts_us;
        neighbor.local_timestamp_us = my_recv_ts_us;

        if let Some(ts) = &reflected {
            update_neighbor_rtt(
                &master.tx,
                ifname,
                neighbor,
                my_recv_ts_us,
                ts.last_nbr_msg_sent_ts_us,
                ts.last_my_msg_rcvd_ts_us,
                hello.sent_ts_us,
            );
        }
    }

    // A peer in fast-init hasn't heard from us yet; reply immediately for
    // quick convergence.
    if hello.flags.contains(HelloFlags::SOLICIT_RESPONSE) {
        master.send_hello(ifname, false, false);
    }

    let state = master.neighbors[ifname][&neighbor_name].state;
    match state {
        State::Idle => {
            let neighbor = master
                .neighbors
                .get_mut(ifname)
                .unwrap()
                .get_mut(&neighbor_name)
                .unwrap();
            neighbor.state_change(ifname, Event::HelloRcvdNoInfo);
        }
        State::Warm => {
            let my_seq_num = master.my_seq_num;
            let neighbor = master
                .neighbors
                .get_mut(ifname)
                .unwrap()
                .get_mut(&neighbor_name)
                .unwrap();
            neighbor.seq_num = hello.seq_num;

            // Peer doesn't see us yet.
            let Some(ts) = &reflected else {
                return Ok(());
            };

            // Our own sequence number as seen by the peer can't be ahead
            // of the current one unless the peer is still reflecting our
            // previous incarnation. Wait for it to catch up with the
            // hellos of this incarnation.
            if ts.seq_num >= my_seq_num {
                trace!(
                    neighbor = %neighbor_name, reflected_seq_num = %ts.seq_num,
                    %my_seq_num, "peer still sees our previous incarnation",
                );
                return Ok(());
            }

            // Mutual visibility established; start negotiating.
            neighbor.negotiate_interval = Some(tasks::negotiate_interval(
                ifname,
                &neighbor_name,
                config.handshake_time,
                &master.tx.protocol_input.negotiate_interval,
            ));
            neighbor.negotiate_hold_timer = Some(tasks::neighbor_hold_timer(
                ifname,
                &neighbor_name,
                config.negotiate_hold_time,
                &master.tx.protocol_input.negotiate_hold_timer,
            ));
            neighbor.state_change(ifname, Event::HelloRcvdInfo);
        }
        State::Established => {
            let neighbor = master
                .neighbors
                .get_mut(ifname)
                .unwrap()
                .get_mut(&neighbor_name)
                .unwrap();
            neighbor.seq_num = hello.seq_num;

            if hello.flags.contains(HelloFlags::RESTARTING) {
                process_gr_msg(master, ifname, &neighbor_name);
                return Ok(());
            }

            if reflected.is_none() {
                // Our own entry vanished from the peer's hello; the peer
                // no longer wants the adjacency.
                neighbor.state_change(ifname, Event::HelloRcvdNoInfo);
                neighbor_down(
                    &master.tx,
                    &mut master.active_neighbors,
                    config.enable_flood_optimization,
                    ifname,
                    neighbor,
                );
                remove_neighbor(master, ifname, &neighbor_name);
            }
        }
        State::Restart => {
            let neighbor = master
                .neighbors
                .get_mut(ifname)
                .unwrap()
                .get_mut(&neighbor_name)
                .unwrap();

            // Peer doesn't see us yet.
            if reflected.is_none() {
                return Ok(());
            }

            // A sequence number below the recorded one means we missed
            // the restart boundary; leave cleanup to the hold timer.
            if hello.seq_num < neighbor.seq_num {
                warn!(
                    neighbor = %neighbor_name, seq_num = %hello.seq_num,
                    local_seq_num = %neighbor.seq_num,
                    "unexpected sequence number from restarting neighbor",
                );
                return Ok(());
            }
            neighbor.seq_num = hello.seq_num;

            // Peer is back from restart.
            notify_neighbor_event(
                &master.tx,
                NeighborEventType::NeighborRestarted,
                ifname,
                neighbor,
                config.enable_flood_optimization,
            );
            neighbor.heartbeat_hold_timer = Some(tasks::neighbor_hold_timer(
                ifname,
                &neighbor_name,
                neighbor.heartbeat_hold_time,
                &master.tx.protocol_input.heartbeat_hold_timer,
            ));
            neighbor.graceful_restart_hold_timer = None;
            neighbor.state_change(ifname, Event::HelloRcvdInfo);
        }
        State::Negotiate => (),
    }

    Ok(())
}

pub(crate) fn process_handshake_msg(
    master: &mut Master,
    ifname: &str,
    handshake: HandshakeMsg,
) -> Result<(), Error> {
    let config = master.config.clone();

    // Area negotiation is point-to-point; ignore handshakes targeted at
    // somebody else.
    if let Some(target) = &handshake.neighbor_node_name
        && *target != config.node_name
    {
        trace!(%target, "ignoring handshake targeted at another node");
        return Ok(());
    }

    // Under quick flapping messages can arrive out of order; a handshake
    // from an untracked neighbor is dropped.
    let neighbor_name = handshake.node_name.clone();
    let Some(neighbor) = master
        .neighbors
        .get_mut(ifname)
        .and_then(|neighbors| neighbors.get_mut(&neighbor_name))
    else {
        trace!(
            neighbor = %neighbor_name,
            "ignoring handshake from untracked neighbor",
        );
        return Ok(());
    };

    // Reply immediately while the peer hasn't formed the adjacency, so it
    // converges without waiting a full handshake period. When V4
    // validation has forced us out of NEGOTIATE, claim the adjacency is
    // established to stop the peer from soliciting more replies.
    let reply_is_adj = neighbor.state != State::Negotiate;
    let reply_area = neighbor.area.clone();
    if !handshake.is_adj_established {
        master.send_handshake(ifname, &neighbor_name, &reply_area, reply_is_adj);
    }

    let neighbor = master
        .neighbors
        .get_mut(ifname)
        .unwrap()
        .get_mut(&neighbor_name)
        .unwrap();

    // After a graceful restart the peer renegotiates while we still hold
    // the adjacency; treat its handshakes as proof of life.
    if let Some(timer) = neighbor.heartbeat_hold_timer.as_mut() {
        timer.reset(None);
    }

    // The handshake only advances the FSM out of NEGOTIATE. Getting here
    // in another state means the negotiate hold timer already fired or V4
    // validation pushed us back to WARM.
    if neighbor.state != State::Negotiate {
        trace!(
            neighbor = %neighbor_name, state = ?neighbor.state,
            "ignoring handshake outside negotiation",
        );
        return Ok(());
    }

    // Record the peer's transport addresses and ports, and settle the
    // hold times for this adjacency.
    neighbor.transport_address_v4 = (!handshake
        .transport_address_v4
        .is_unspecified())
    .then_some(handshake.transport_address_v4);
    neighbor.transport_address_v6 = (!handshake
        .transport_address_v6
        .is_unspecified())
    .then_some(handshake.transport_address_v6);
    neighbor.ctrl_port = handshake.ctrl_port;
    neighbor.kvstore_cmd_port = handshake.kvstore_cmd_port;
    neighbor.heartbeat_hold_time =
        Duration::from_millis(handshake.hold_time.max(0) as u64)
            .max(config.heartbeat_hold_time);
    neighbor.graceful_restart_hold_time =
        Duration::from_millis(handshake.graceful_restart_time.max(0) as u64)
            .max(config.hold_time);

    // The peer's V4 address must sit in our interface's V4 subnet.
    if config.enable_v4 {
        let v4_network = master.interfaces.get(ifname).unwrap().v4_network;
        if let Err(counter) =
            validate_v4_subnet(&v4_network, handshake.transport_address_v4)
        {
            master.counters.bump(counter);
            neighbor.state_change(ifname, Event::NegotiationFailure);
            neighbor.negotiate_interval = None;
            neighbor.negotiate_hold_timer = None;
            return Ok(());
        }
    }

    // Area agreement: handshake.area is the area the peer thinks we
    // should be in, neighbor.area the one we deduced for the peer. When
    // either side runs without area configuration the default area wins,
    // for backward compatibility.
    if neighbor.area != DEFAULT_AREA_ID && handshake.area != DEFAULT_AREA_ID {
        if neighbor.area != handshake.area {
            warn!(
                neighbor = %neighbor_name, local = %neighbor.area,
                remote = %handshake.area, "inconsistent area deduced",
            );
            neighbor.state_change(ifname, Event::NegotiationFailure);
            neighbor.negotiate_interval = None;
            neighbor.negotiate_hold_timer = None;
            return Ok(());
        }
    } else {
        neighbor.area = DEFAULT_AREA_ID.to_owned();
    }

    // Promote the adjacency.
    neighbor.state_change(ifname, Event::HandshakeRcvd);
    neighbor.negotiate_interval = None;
    neighbor.negotiate_hold_timer = None;
    neighbor.heartbeat_hold_timer = Some(tasks::neighbor_hold_timer(
        ifname,
        &neighbor_name,
        neighbor.heartbeat_hold_time,
        &master.tx.protocol_input.heartbeat_hold_timer,
    ));
    master
        .active_neighbors
        .entry(ifname.to_owned())
        .or_default()
        .insert(neighbor_name.clone());
    notify_neighbor_event(
        &master.tx,
        NeighborEventType::NeighborUp,
        ifname,
        neighbor,
        config.enable_flood_optimization,
    );

    Ok(())
}

pub(crate) fn process_heartbeat_msg(
    master: &mut Master,
    ifname: &str,
    heartbeat: HeartbeatMsg,
) -> Result<(), Error> {
    // While we renegotiate after a restart the peer isn't tracked yet and
    // its heartbeats are dropped.
    let Some(neighbor) = master
        .neighbors
        .get_mut(ifname)
        .and_then(|neighbors| neighbors.get_mut(&heartbeat.node_name))
    else {
        trace!(
            neighbor = %heartbeat.node_name,
            "ignoring heartbeat from untracked neighbor",
        );
        return Ok(());
    };

    if neighbor.state != State::Established {
        trace!(
            neighbor = %heartbeat.node_name, state = ?neighbor.state,
            "ignoring heartbeat outside established adjacency",
        );
        return Ok(());
    }

    if let Some(timer) = neighbor.heartbeat_hold_timer.as_mut() {
        timer.reset(None);
    }
    Ok(())
}

// ===== Timer input =====

pub(crate) fn process_hello_interval(
    master: &mut Master,
    msg: HelloIntervalMsg,
) -> Result<(), Error> {
    master.send_hello(&msg.ifname, msg.in_fast_init, false);
    Ok(())
}

pub(crate) fn process_heartbeat_interval(
    master: &mut Master,
    msg: HeartbeatIntervalMsg,
) -> Result<(), Error> {
    master.send_heartbeat(&msg.ifname);
    Ok(())
}

pub(crate) fn process_negotiate_interval(
    master: &mut Master,
    msg: NegotiateIntervalMsg,
) -> Result<(), Error> {
    let NegotiateIntervalMsg {
        ifname,
        neighbor_node_name,
    } = msg;

    let Some(neighbor) = master
        .neighbors
        .get(&ifname)
        .and_then(|neighbors| neighbors.get(&neighbor_node_name))
    else {
        return Ok(());
    };
    if neighbor.state != State::Negotiate {
        return Ok(());
    }

    let area = neighbor.area.clone();
    master.send_handshake(&ifname, &neighbor_node_name, &area, false);
    Ok(())
}

pub(crate) fn process_negotiate_hold_expiry(
    master: &mut Master,
    msg: NeighborTimerMsg,
) -> Result<(), Error> {
    let NeighborTimerMsg {
        ifname,
        neighbor_node_name,
    } = msg;

    // A firing that raced with neighbor removal or a state change is a
    // no-op.
    let Some(neighbor) = master
        .neighbors
        .get_mut(&ifname)
        .and_then(|neighbors| neighbors.get_mut(&neighbor_node_name))
    else {
        return Ok(());
    };
    if neighbor.state != State::Negotiate {
        return Ok(());
    }

    Debug::NegotiateTimerExpiry(&ifname, &neighbor_node_name).log();

    // Fall back to WARM rather than sit in NEGOTIATE forever.
    neighbor.state_change(&ifname, Event::NegotiateTimerExpire);
    neighbor.negotiate_interval = None;
    neighbor.negotiate_hold_timer = None;
    Ok(())
}

pub(crate) fn process_heartbeat_hold_expiry(
    master: &mut Master,
    msg: NeighborTimerMsg,
) -> Result<(), Error> {
    let NeighborTimerMsg {
        ifname,
        neighbor_node_name,
    } = msg;

    let Some(neighbor) = master
        .neighbors
        .get_mut(&ifname)
        .and_then(|neighbors| neighbors.get_mut(&neighbor_node_name))
    else {
        return Ok(());
    };
    if neighbor.state != State::Established {
        return Ok(());
    }

    Debug::HeartbeatTimerExpiry(&ifname, &neighbor_node_name).log();

    // The peer went silent; tear the adjacency down.
    neighbor.state_change(&ifname, Event::HeartbeatTimerExpire);
    neighbor_down(
        &master.tx,
        &mut master.active_neighbors,
        master.config.enable_flood_optimization,
        &ifname,
        neighbor,
    );
    remove_neighbor(master, &ifname, &neighbor_node_name);
    Ok(())
}

pub(crate) fn process_gr_hold_expiry(
    master: &mut Master,
    msg: NeighborTimerMsg,
) -> Result<(), Error> {
    let NeighborTimerMsg {
        ifname,
        neighbor_node_name,
    } = msg;

    let Some(neighbor) = master
        .neighbors
        .get_mut(&ifname)
        .and_then(|neighbors| neighbors.get_mut(&neighbor_node_name))
    else {
        return Ok(());
    };
    if neighbor.state != State::Restart {
        return Ok(());
    }

    Debug::GrTimerExpiry(&ifname, &neighbor_node_name).log();

    // The peer never came back from its restart.
    neighbor.state_change(&ifname, Event::GrTimerExpire);
    neighbor_down(
        &master.tx,
        &mut master.active_neighbors,
        master.config.enable_flood_optimization,
        &ifname,
        neighbor,
    );
    remove_neighbor(master, &ifname, &neighbor_node_name);
    Ok(())
}

// ===== Operator input =====

pub(crate) fn process_state_query(
    master: &mut Master,
    msg: StateQueryMsg,
) -> Result<(), Error> {
    let state = master
        .neighbors
        .get(&msg.ifname)
        .and_then(|neighbors| neighbors.get(&msg.neighbor_node_name))
        .map(|neighbor| neighbor.state);
    let _ = msg.responsep.send(state);
    Ok(())
}

// ===== helper functions =====

// Starts graceful restart handling for an established neighbor that
// announced its shutdown.
fn process_gr_msg(
    master: &mut Master,
    ifname: &str,
    neighbor_node_name: &str,
) {
    let neighbor = master
        .neighbors
        .get_mut(ifname)
        .unwrap()
        .get_mut(neighbor_node_name)
        .unwrap();

    notify_neighbor_event(
        &master.tx,
        NeighborEventType::NeighborRestarting,
        ifname,
        neighbor,
        false,
    );

    // Protect the adjacency for the negotiated hold window, and stop
    // expecting heartbeats while the peer is down.
    neighbor.graceful_restart_hold_timer = Some(tasks::neighbor_hold_timer(
        ifname,
        neighbor_node_name,
        neighbor.graceful_restart_hold_time,
        &master.tx.protocol_input.gr_hold_timer,
    ));
    neighbor.state_change(ifname, Event::HelloRcvdRestart);
    neighbor.heartbeat_hold_timer = None;
}

// Publishes a neighbor event to the upstream consumer.
pub(crate) fn notify_neighbor_event(
    tx: &InstanceChannelsTx,
    event_type: NeighborEventType,
    ifname: &str,
    neighbor: &Neighbor,
    support_flood_optimization: bool,
) {
    let event = NeighborEvent {
        event_type,
        ifname: ifname.to_owned(),
        neighbor: neighbor.into(),
        rtt_us: neighbor
            .rtt
            .map(|rtt| rtt.as_micros() as i64)
            .unwrap_or(0),
        label: neighbor.label,
        support_flood_optimization,
        area: neighbor.area.clone(),
    };
    let _ = tx.neighbor_event.send(event);
}

// Announces the loss of an adjacency and drops the neighbor from the
// active set.
fn neighbor_down(
    tx: &InstanceChannelsTx,
    active_neighbors: &mut BTreeMap<String, BTreeSet<String>>,
    support_flood_optimization: bool,
    ifname: &str,
    neighbor: &Neighbor,
) {
    notify_neighbor_event(
        tx,
        NeighborEventType::NeighborDown,
        ifname,
        neighbor,
        support_flood_optimization,
    );

    if let Some(active) = active_neighbors.get_mut(ifname) {
        active.remove(&neighbor.node_name);
        if active.is_empty() {
            active_neighbors.remove(ifname);
        }
    }
}

// Forgets a neighbor, releasing its label. Dropping the neighbor cancels
// all of its timers.
fn remove_neighbor(
    master: &mut Master,
    ifname: &str,
    neighbor_node_name: &str,
) {
    if let Some(neighbor) = master
        .neighbors
        .get_mut(ifname)
        .and_then(|neighbors| neighbors.remove(neighbor_node_name))
    {
        master.allocated_labels.remove(&neighbor.label);
    }
}

// Feeds one reflected-hello RTT sample through the step detector and
// updates the neighbor's RTT bookkeeping.
fn update_neighbor_rtt(
    tx: &InstanceChannelsTx,
    ifname: &str,
    neighbor: &mut Neighbor,
    my_recv_ts_us: i64,
    my_sent_ts_us: i64,
    nbr_recv_ts_us: i64,
    nbr_sent_ts_us: i64,
) {
    let Some(rtt_us) = neighbor::compute_rtt(
        my_recv_ts_us,
        my_sent_ts_us,
        nbr_recv_ts_us,
        nbr_sent_ts_us,
    ) else {
        trace!(
            neighbor = %neighbor.node_name,
            "discarding unusable rtt sample",
        );
        return;
    };

    let rtt = Duration::from_micros(rtt_us as u64);
    if let Some(new_rtt_us) = neighbor
        .step_detector
        .add_value(my_recv_ts_us / 1000, rtt_us)
    {
        // Only report RTT changes for adjacent neighbors.
        if neighbor.state == State::Established {
            neighbor.rtt = Some(Duration::from_micros(new_rtt_us as u64));
            Debug::RttChange(&neighbor.node_name, new_rtt_us).log();
            notify_neighbor_event(
                tx,
                NeighborEventType::NeighborRttChange,
                ifname,
                neighbor,
                false,
            );
        }
    }
    if neighbor.rtt.is_none() {
        neighbor.rtt = Some(rtt);
    }
    neighbor.rtt_latest = rtt;
}

// Validates that the peer's advertised V4 address lies in our interface's
// V4 subnet, returning the counter to bump on failure.
fn validate_v4_subnet(
    local: &Ipv4Network,
    addr: Ipv4Addr,
) -> Result<(), &'static str> {
    if addr.is_unspecified() {
        warn!("neighbor V4 address is not known");
        return Err("spark.invalid_keepalive.missing_v4_addr");
    }
    if !local.contains(addr) {
        warn!(
            %addr, local = %local,
            "neighbor V4 address is not in the local subnet",
        );
        return Err("spark.invalid_keepalive.different_subnet");
    }
    Ok(())
}
