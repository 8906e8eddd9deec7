/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::time::{Duration, Instant};

use crate::common::MAX_HOPS;

// first 8 bytes of the INT header, addresses of both ends
pub type FlowKey = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowState {
    pub last_seq: u64,
    pub prev_dst_ts: u64,
    pub last_seen: Instant,
}

impl FlowState {
    pub fn new(now: Instant) -> Self {
        Self {
            last_seq: 0,
            prev_dst_ts: 0,
            last_seen: now,
        }
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_seen) >= timeout
    }
}

/// Previous ingress timestamp per hop position, shared by every flow.
///
/// Position `n` of a path with `n` switch hops holds the sink itself, hence
/// one slot more than the number of supported hops. Jitter read from here is
/// only meaningful while a hop position maps to the same switch for all
/// flows crossing the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopJitterTable {
    prev_ingress: [u64; MAX_HOPS + 1],
}

impl Default for HopJitterTable {
    fn default() -> Self {
        Self {
            prev_ingress: [0; MAX_HOPS + 1],
        }
    }
}

impl HopJitterTable {
    // returns the jitter against the previous value and stores the new one
    pub fn update(&mut self, index: usize, ingress: u64) -> u64 {
        let slot = &mut self.prev_ingress[index];
        let jitter = ingress.wrapping_sub(*slot);
        *slot = ingress;
        jitter
    }
}
