//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;

use tracing::{debug, debug_span};

use crate::neighbor::State;
use crate::packet::Packet;

// Spark debug messages.
#[derive(Debug)]
pub enum Debug<'a> {
    InterfaceAdd(&'a str, u32),
    InterfaceDelete(&'a str),
    InterfaceUpdate(&'a str, u32),
    NeighborCreate(&'a str),
    NeighborDelete(&'a str),
    FsmTransition(&'a str, &'a str, State, State),
    PacketRx(&'a str, &'a Ipv6Addr, &'a Packet),
    PacketTx(&'a str, &'a Packet),
    NegotiateTimerExpiry(&'a str, &'a str),
    HeartbeatTimerExpiry(&'a str, &'a str),
    GrTimerExpiry(&'a str, &'a str),
    RttChange(&'a str, i64),
}

// ===== impl Debug =====

impl Debug<'_> {
    // Log debug message using the tracing API.
    pub(crate) fn log(&self) {
        match self {
            Debug::InterfaceAdd(ifname, ifindex)
            | Debug::InterfaceUpdate(ifname, ifindex) => {
                debug_span!("interface", name = %ifname).in_scope(|| {
                    debug!(%ifindex, "{}", self);
                });
            }
            Debug::InterfaceDelete(ifname) => {
                debug_span!("interface", name = %ifname).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::NeighborCreate(node_name)
            | Debug::NeighborDelete(node_name) => {
                debug_span!("neighbor", name = %node_name).in_scope(|| {
                    debug!("{}", self);
                });
            }
            Debug::FsmTransition(ifname, node_name, old_state, new_state) => {
                debug_span!("neighbor", name = %node_name).in_scope(|| {
                    debug!(%ifname, ?old_state, ?new_state, "{}", self);
                });
            }
            Debug::PacketRx(ifname, src, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("input").in_scope(|| {
                        debug!(%ifname, %src, ?packet, "{}", self);
                    })
                });
            }
            Debug::PacketTx(ifname, packet) => {
                debug_span!("network").in_scope(|| {
                    debug_span!("output").in_scope(|| {
                        debug!(%ifname, ?packet, "{}", self);
                    })
                });
            }
            Debug::NegotiateTimerExpiry(ifname, node_name)
            | Debug::HeartbeatTimerExpiry(ifname, node_name)
            | Debug::GrTimerExpiry(ifname, node_name) => {
                debug_span!("neighbor", name = %node_name).in_scope(|| {
                    debug!(%ifname, "{}", self);
                });
            }
            Debug::RttChange(node_name, rtt_us) => {
                debug_span!("neighbor", name = %node_name).in_scope(|| {
                    debug!(%rtt_us, "{}", self);
                });
            }
        }
    }
}

impl std::fmt::Display for Debug<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Debug::InterfaceAdd(..) => {
                write!(f, "interface added for tracking")
            }
            Debug::InterfaceDelete(..) => {
                write!(f, "interface removed from tracking")
            }
            Debug::InterfaceUpdate(..) => {
                write!(f, "interface updated")
            }
            Debug::NeighborCreate(..) => {
                write!(f, "neighbor created")
            }
            Debug::NeighborDelete(..) => {
                write!(f, "neighbor deleted")
            }
            Debug::FsmTransition(..) => {
                write!(f, "state transition")
            }
            Debug::PacketRx(..) => {
                write!(f, "packet received")
            }
            Debug::PacketTx(..) => {
                write!(f, "packet sent")
            }
            Debug::NegotiateTimerExpiry(..) => {
                write!(f, "negotiate hold timer expired")
            }
            Debug::HeartbeatTimerExpiry(..) => {
                write!(f, "heartbeat hold timer expired")
            }
            Debug::GrTimerExpiry(..) => {
                write!(f, "graceful restart hold timer expired")
            }
            Debug::RttChange(..) => {
                write!(f, "neighbor round-trip time changed")
            }
        }
    }
}
