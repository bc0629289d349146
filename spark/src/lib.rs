//
// Copyright (c) The Spark Core Contributors
//
// SPDX-License-Identifier: MIT
//

#![cfg_attr(
    feature = "testing",
    allow(dead_code, unused_variables, unused_imports)
)]

pub mod area;
pub mod consts;
pub mod debug;
pub mod error;
pub mod events;
pub mod interface;
pub mod master;
pub mod neighbor;
pub mod network;
pub mod packet;
pub mod rate_limit;
pub mod step_detector;
pub mod tasks;
