//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use spark_utils::task::{IntervalTask, TimeoutTask};

use crate::debug::Debug;
use crate::step_detector::StepDetector;

//
// One tracked neighbor on one interface.
//
// The neighbor owns its timers and its step detector; dropping the
// neighbor cancels everything it armed. Timer callbacks carry the
// (interface, neighbor) key and look the neighbor up when they fire, so a
// late firing after removal is a no-op.
//
#[derive(Debug)]
pub struct Neighbor {
    pub domain_name: String,
    pub node_name: String,
    pub remote_ifname: String,
    pub area: String,
    pub label: u32,
    pub seq_num: u64,
    pub state: State,
    pub step_detector: StepDetector,
    // Smoothed RTT, initialized from the first valid sample.
    pub rtt: Option<Duration>,
    // Raw value of the most recent sample.
    pub rtt_latest: Duration,
    // Sent timestamp of the peer's last hello.
    pub neighbor_timestamp_us: i64,
    // Our receive timestamp of the peer's last hello.
    pub local_timestamp_us: i64,
    // Capability fields advertised by the peer during handshake.
    pub transport_address_v4: Option<Ipv4Addr>,
    pub transport_address_v6: Option<Ipv6Addr>,
    pub ctrl_port: i32,
    pub kvstore_cmd_port: i32,
    // Negotiated hold times.
    pub heartbeat_hold_time: Duration,
    pub graceful_restart_hold_time: Duration,
    // Timers, armed according to the current state.
    pub negotiate_interval: Option<IntervalTask>,
    pub negotiate_hold_timer: Option<TimeoutTask>,
    pub heartbeat_hold_timer: Option<TimeoutTask>,
    pub graceful_restart_hold_timer: Option<TimeoutTask>,
}

// Neighbor FSM states.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum State {
    Idle,
    Warm,
    Negotiate,
    Established,
    Restart,
}

// Neighbor FSM events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum Event {
    HelloRcvdInfo,
    HelloRcvdNoInfo,
    HelloRcvdRestart,
    HeartbeatRcvd,
    HandshakeRcvd,
    HeartbeatTimerExpire,
    NegotiateTimerExpire,
    GrTimerExpire,
    NegotiationFailure,
}

//
// Dense transition table indexed by (state, event). Undefined entries mean
// the event isn't accepted in that state and is silently dropped.
//
#[rustfmt::skip]
const TRANSITIONS: [[Option<State>; 9]; 5] = {
    use State::*;
    [
        // Idle
        [Some(Warm), Some(Warm), None, None, None,
         None, None, None, None],
        // Warm
        [Some(Negotiate), None, None, None, None,
         None, None, None, None],
        // Negotiate
        [None, None, None, None, Some(Established),
         None, Some(Warm), None, Some(Warm)],
        // Established
        [None, Some(Idle), Some(Restart), Some(Established), None,
         Some(Idle), None, None, None],
        // Restart
        [Some(Established), None, None, None, None,
         None, None, Some(Idle), None],
    ]
};

// ===== impl Neighbor =====

impl Neighbor {
    // Creates a new neighbor in the Idle state.
    pub(crate) fn new(
        domain_name: String,
        node_name: String,
        remote_ifname: String,
        area: String,
        label: u32,
        seq_num: u64,
        sampling_period: Duration,
    ) -> Neighbor {
        let nbr = Neighbor {
            domain_name,
            node_name,
            remote_ifname,
            area,
            label,
            seq_num,
            state: State::Idle,
            step_detector: StepDetector::new(sampling_period),
            rtt: None,
            rtt_latest: Duration::ZERO,
            neighbor_timestamp_us: 0,
            local_timestamp_us: 0,
            transport_address_v4: None,
            transport_address_v6: None,
            ctrl_port: 0,
            kvstore_cmd_port: 0,
            heartbeat_hold_time: Duration::ZERO,
            graceful_restart_hold_time: Duration::ZERO,
            negotiate_interval: None,
            negotiate_hold_timer: None,
            heartbeat_hold_timer: None,
            graceful_restart_hold_timer: None,
        };
        Debug::NeighborCreate(&nbr.node_name).log();
        nbr
    }

    // Applies an FSM event, transitioning to the next state.
    //
    // An event the current state doesn't accept is a programming error at
    // the call site; it aborts debug builds and is dropped otherwise.
    pub(crate) fn state_change(&mut self, ifname: &str, event: Event) {
        let Some(new_state) = next_state(self.state, event) else {
            debug_assert!(
                false,
                "event {event:?} not accepted in state {:?}",
                self.state
            );
            return;
        };
        Debug::FsmTransition(ifname, &self.node_name, self.state, new_state)
            .log();
        self.state = new_state;
    }

    // Asserts the state expected by a timer expiry or wrapper routine.
    pub(crate) fn check_state(&self, expected: State) {
        debug_assert_eq!(
            self.state, expected,
            "neighbor {} in unexpected state",
            self.node_name
        );
    }

    // Returns whether the peer's transport addresses were learned, i.e.
    // whether a handshake ever completed. Neighbors without them are
    // removed without a down notification.
    pub(crate) fn transport_populated(&self, enable_v4: bool) -> bool {
        self.transport_address_v6.is_some()
            && (!enable_v4 || self.transport_address_v4.is_some())
    }
}

impl Drop for Neighbor {
    fn drop(&mut self) {
        Debug::NeighborDelete(&self.node_name).log();
    }
}

// ===== global functions =====

// Looks up the transition table.
pub(crate) fn next_state(state: State, event: Event) -> Option<State> {
    TRANSITIONS[state as usize][event as usize]
}

//
// Computes the round-trip time to a neighbor from the four timestamps of a
// reflected hello exchange, all in microseconds:
//
//   rtt = (my_recv - my_sent) - (nbr_sent - nbr_recv)
//
// The result is masked to millisecond accuracy. Microsecond accuracy is
// meaningless here: the measurement runs in user space, so scheduling
// noise alone exceeds it, and sub-millisecond RTTs don't affect routing
// decisions on the networks this targets.
//
pub(crate) fn compute_rtt(
    my_recv_ts_us: i64,
    my_sent_ts_us: i64,
    nbr_recv_ts_us: i64,
    nbr_sent_ts_us: i64,
) -> Option<i64> {
    if my_sent_ts_us == 0 || nbr_recv_ts_us == 0 {
        // Timestamps missing, peer hasn't echoed a full exchange yet.
        return None;
    }
    if nbr_sent_ts_us < nbr_recv_ts_us || my_recv_ts_us < my_sent_ts_us {
        return None;
    }

    let rtt = (my_recv_ts_us - my_sent_ts_us) - (nbr_sent_ts_us - nbr_recv_ts_us);
    if rtt < 0 {
        // Clock adjustment anomaly; later measurements will correct it.
        return None;
    }

    Some((rtt / 1000 * 1000).max(1000))
}
