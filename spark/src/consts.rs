//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::Ipv6Addr;
use std::ops::RangeInclusive;

// The minimum size of an IPv6 packet. Payloads are capped to this value so
// MTU size/discovery never becomes a concern.
pub const MIN_IPV6_MTU: usize = 1280;

// The acceptable hop limit, assuming packets are sent with this TTL.
pub const SPARK_HOP_LIMIT: u8 = 255;

// Well-known link-local multicast group all Spark messages are sent to.
pub const SPARK_MCAST_ADDR: Ipv6Addr =
    Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

// Area identifier assumed when no area configuration is present.
pub const DEFAULT_AREA_ID: &str = "0";

// Segment Routing local label range. Labels for neighbors are allocated
// from this range and freed when the neighbor is removed.
pub const SR_LOCAL_RANGE: RangeInclusive<u32> = 50000..=59999;

// Number of samples in the fast RTT sliding window.
pub const FAST_WINDOW_SIZE: usize = 10;

// Number of samples in the slow RTT sliding window.
pub const SLOW_WINDOW_SIZE: usize = 60;

// Lower RTT step threshold, in percentage.
pub const LO_THRESHOLD_PCT: u8 = 2;

// Upper RTT step threshold, in percentage.
pub const HI_THRESHOLD_PCT: u8 = 5;

// Absolute RTT step threshold, in microseconds.
pub const ABS_THRESHOLD_US: i64 = 500;

// Maximum number of hello packets accepted per second from one
// (interface, source address) pair.
pub const MAX_ALLOWED_PPS: u64 = 50;

// Number of bucketed time-series shared by all rate-limit lookups.
pub const NUM_TIME_SERIES: usize = 1024;

// Number of restarting packets sent per interface before going down.
pub const NUM_RESTARTING_PKT_SENT: usize = 3;

// Interval between global counter refreshes.
pub const COUNTER_UPDATE_INTERVAL: std::time::Duration =
    std::time::Duration::from_secs(5);
