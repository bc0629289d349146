//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::Ipv6Addr;
use std::time::{Duration, Instant};

use crate::consts::{MAX_ALLOWED_PPS, NUM_TIME_SERIES};

// Time series of event counts bucketed over a fixed horizon.
//
// Buckets form a ring over the horizon; advancing time past a bucket's
// window zeroes it before it is reused.
#[derive(Debug)]
pub struct BucketedTimeSeries {
    buckets: Vec<u64>,
    bucket_width: Duration,
    origin: Instant,
    latest_bucket: u64,
}

// Packet arrival rate limiter.
//
// A fixed-size vector of bucketed time series is shared by all interfaces;
// each (interface, source address) pair hashes into one of them.
#[derive(Debug)]
pub struct RateLimiter {
    series: Vec<BucketedTimeSeries>,
    max_pps: u64,
}

// ===== impl BucketedTimeSeries =====

impl BucketedTimeSeries {
    pub(crate) fn new(
        num_buckets: usize,
        horizon: Duration,
        now: Instant,
    ) -> BucketedTimeSeries {
        BucketedTimeSeries {
            buckets: vec![0; num_buckets],
            bucket_width: horizon / num_buckets as u32,
            origin: now,
            latest_bucket: 0,
        }
    }

    // Expires buckets that have fallen out of the horizon.
    pub(crate) fn update(&mut self, now: Instant) {
        let bucket = self.bucket_index(now);
        let num_buckets = self.buckets.len() as u64;
        if bucket > self.latest_bucket {
            let stale = (bucket - self.latest_bucket).min(num_buckets);
            for i in 0..stale {
                let idx = (self.latest_bucket + 1 + i) % num_buckets;
                self.buckets[idx as usize] = 0;
            }
            self.latest_bucket = bucket;
        }
    }

    pub(crate) fn add_value(&mut self, now: Instant, value: u64) {
        self.update(now);
        let idx = self.bucket_index(now) % self.buckets.len() as u64;
        self.buckets[idx as usize] += value;
    }

    pub(crate) fn count(&self) -> u64 {
        self.buckets.iter().sum()
    }

    fn bucket_index(&self, now: Instant) -> u64 {
        let elapsed = now.saturating_duration_since(self.origin);
        (elapsed.as_nanos() / self.bucket_width.as_nanos()) as u64
    }
}

// ===== impl RateLimiter =====

impl RateLimiter {
    pub(crate) fn new(now: Instant) -> RateLimiter {
        let num_buckets = (MAX_ALLOWED_PPS / 3) as usize;
        let horizon = Duration::from_secs(1);
        let series = (0..NUM_TIME_SERIES)
            .map(|_| BucketedTimeSeries::new(num_buckets, horizon, now))
            .collect();

        RateLimiter {
            series,
            max_pps: MAX_ALLOWED_PPS,
        }
    }

    // Checks whether a packet from the given source should be processed,
    // and records its arrival if so.
    pub(crate) fn allow(
        &mut self,
        ifname: &str,
        addr: &Ipv6Addr,
        now: Instant,
    ) -> bool {
        let mut hasher = DefaultHasher::new();
        (ifname, addr).hash(&mut hasher);
        let index = hasher.finish() as usize % self.series.len();

        let series = &mut self.series[index];
        series.update(now);
        if series.count() > self.max_pps {
            return false;
        }
        series.add_value(now, 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_expiry() {
        let now = Instant::now();
        let mut ts = BucketedTimeSeries::new(10, Duration::from_secs(1), now);

        ts.add_value(now, 3);
        ts.add_value(now + Duration::from_millis(500), 2);
        assert_eq!(ts.count(), 5);

        // The first bucket ages out, the second is still in the horizon.
        ts.update(now + Duration::from_millis(1050));
        assert_eq!(ts.count(), 2);

        // Everything ages out.
        ts.update(now + Duration::from_secs(2));
        assert_eq!(ts.count(), 0);
    }

    #[test]
    fn test_rate_limiter_cap() {
        let now = Instant::now();
        let mut rl = RateLimiter::new(now);
        let addr = "fe80::1".parse().unwrap();

        for _ in 0..=MAX_ALLOWED_PPS {
            assert!(rl.allow("eth0", &addr, now));
        }
        assert!(!rl.allow("eth0", &addr, now));

        // The window drains once the horizon passes.
        assert!(rl.allow("eth0", &addr, now + Duration::from_secs(2)));
    }
}
