//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use serde::{Deserialize, Serialize};
use spark_utils::ip::Ipv6AddrExt;
use spark_utils::task::{IntervalTask, Task};

use crate::debug::Debug;

//
// One tracked network interface.
//
// The engine owns exactly one hello timer and one heartbeat timer per
// tracked interface, and the shared socket is joined to the Spark
// multicast group on its ifindex for as long as it is tracked.
//
#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub ifindex: u32,
    pub v4_network: Ipv4Network,
    pub v6_linklocal_network: Ipv6Network,
    pub hello_task: Option<Task<()>>,
    pub heartbeat_interval: Option<IntervalTask>,
}

// Addresses selected for an interface from a snapshot, before the
// interface is (re)tracked.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InterfaceNetworks {
    pub ifindex: u32,
    pub v4_network: Ipv4Network,
    pub v6_linklocal_network: Ipv6Network,
}

// Snapshot of the system interfaces, produced by the link monitor.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceDatabase {
    pub node_name: String,
    pub interfaces: BTreeMap<String, InterfaceInfo>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceInfo {
    pub up: bool,
    pub ifindex: u32,
    pub networks: Vec<IpNetwork>,
}

// ===== impl Interface =====

impl Interface {
    pub(crate) fn new(name: String, networks: InterfaceNetworks) -> Interface {
        Interface {
            name,
            ifindex: networks.ifindex,
            v4_network: networks.v4_network,
            v6_linklocal_network: networks.v6_linklocal_network,
            hello_task: None,
            heartbeat_interval: None,
        }
    }

    pub(crate) fn same_networks(&self, networks: &InterfaceNetworks) -> bool {
        self.ifindex == networks.ifindex
            && self.v4_network == networks.v4_network
            && self.v6_linklocal_network == networks.v6_linklocal_network
    }
}

impl Drop for Interface {
    fn drop(&mut self) {
        Debug::InterfaceDelete(&self.name).log();
    }
}

// ===== global functions =====

//
// Selects the addresses making an interface acceptable for tracking.
//
// An interface qualifies iff it is up, has at least one IPv6 link-local
// network, and, when V4 is enabled, at least one IPv4 network. Among the
// qualifying addresses the lowest one is chosen deterministically, so both
// ends of a link converge on the same pair. When V4 is disabled a 0.0.0.0/32
// placeholder is recorded; it is never validated against a peer's subnet.
//
pub(crate) fn eligible_networks(
    info: &InterfaceInfo,
    enable_v4: bool,
) -> Option<InterfaceNetworks> {
    if !info.up {
        return None;
    }

    let v6_linklocal_network = info
        .networks
        .iter()
        .filter_map(|network| match network {
            IpNetwork::V6(network)
                if network.ip().is_unicast_linklocal() =>
            {
                Some(*network)
            }
            _ => None,
        })
        .min()?;

    let v4_networks = info.networks.iter().filter_map(|network| match network {
        IpNetwork::V4(network) => Some(*network),
        _ => None,
    });
    let v4_network = if enable_v4 {
        v4_networks.min()?
    } else {
        Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 32).unwrap()
    };

    Some(InterfaceNetworks {
        ifindex: info.ifindex,
        v4_network,
        v6_linklocal_network,
    })
}
