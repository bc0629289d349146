//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::consts::{
    ABS_THRESHOLD_US, FAST_WINDOW_SIZE, HI_THRESHOLD_PCT, LO_THRESHOLD_PCT,
    SLOW_WINDOW_SIZE,
};

//
// Sliding-window outlier filter for RTT samples.
//
// Two moving means are maintained, a fast one reacting to recent samples
// and a slow one tracking the long-term baseline. A step is declared only
// when the means diverge beyond both a percentage band and an absolute
// microsecond threshold, which suppresses flapping on noisy links. Upward
// steps must clear the upper percentage threshold, downward steps the
// lower one.
//
#[derive(Debug)]
#[derive(Deserialize, Serialize)]
pub struct StepDetector {
    sampling_period: Duration,
    fast_window: VecDeque<i64>,
    slow_window: VecDeque<i64>,
    last_sample_ts: Option<i64>,
}

// ===== impl StepDetector =====

impl StepDetector {
    pub(crate) fn new(sampling_period: Duration) -> StepDetector {
        StepDetector {
            sampling_period,
            fast_window: VecDeque::with_capacity(FAST_WINDOW_SIZE),
            slow_window: VecDeque::with_capacity(SLOW_WINDOW_SIZE),
            last_sample_ts: None,
        }
    }

    // Feeds one RTT sample into both windows.
    //
    // Returns the new fast-window mean when a step is detected. Samples
    // arriving faster than half the expected sampling period are dropped.
    pub(crate) fn add_value(
        &mut self,
        ts_ms: i64,
        rtt_us: i64,
    ) -> Option<i64> {
        if let Some(last_ts) = self.last_sample_ts
            && ts_ms - last_ts < self.sampling_period.as_millis() as i64 / 2
        {
            return None;
        }
        self.last_sample_ts = Some(ts_ms);

        if self.fast_window.len() == FAST_WINDOW_SIZE {
            self.fast_window.pop_front();
        }
        self.fast_window.push_back(rtt_us);
        if self.slow_window.len() == SLOW_WINDOW_SIZE {
            self.slow_window.pop_front();
        }
        self.slow_window.push_back(rtt_us);

        // Means are only compared once the fast window has filled up, so
        // the first few samples after a restart cannot fire a step.
        if self.fast_window.len() < FAST_WINDOW_SIZE {
            return None;
        }

        let fast_mean = mean(&self.fast_window);
        let slow_mean = mean(&self.slow_window);
        let diff = (fast_mean - slow_mean).abs();
        let threshold_pct = if fast_mean > slow_mean {
            HI_THRESHOLD_PCT
        } else {
            LO_THRESHOLD_PCT
        };

        if diff > ABS_THRESHOLD_US
            && slow_mean != 0
            && diff * 100 / slow_mean > threshold_pct as i64
        {
            // Restart both windows so a single step fires exactly once.
            self.fast_window.clear();
            self.slow_window.clear();
            return Some(fast_mean);
        }

        None
    }
}

// ===== helper functions =====

fn mean(window: &VecDeque<i64>) -> i64 {
    window.iter().sum::<i64>() / window.len() as i64
}
