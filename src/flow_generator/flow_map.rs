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

use std::num::NonZeroUsize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::{Duration, Instant};

use log::debug;
use lru::LruCache;

use super::flow_state::{FlowKey, FlowState, HopJitterTable};
use crate::{
    common::{HopMetric, IntPacket, L4Protocol, TelemetryRecord, MAX_HOPS},
    config::FlowTableConfig,
    utils::stats::{self, Countable, Counter, CounterType, CounterValue, RefCountable},
};

pub const TIMESTAMP_48BIT_MASK: u64 = (1 << 48) - 1;

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Default)]
pub struct FlowMapCounter {
    new: AtomicU64,     // flows seen for the first time
    evicted: AtomicU64, // flows dropped to make room
    expired: AtomicU64, // flows restarted after idle timeout
    concurrent: AtomicU64,
}

impl RefCountable for FlowMapCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "new-flows",
                CounterType::Counted,
                CounterValue::Unsigned(self.new.swap(0, Ordering::Relaxed)),
            ),
            (
                "evicted-flows",
                CounterType::Counted,
                CounterValue::Unsigned(self.evicted.swap(0, Ordering::Relaxed)),
            ),
            (
                "expired-flows",
                CounterType::Counted,
                CounterValue::Unsigned(self.expired.swap(0, Ordering::Relaxed)),
            ),
            (
                "flows",
                CounterType::Gauged,
                CounterValue::Unsigned(self.concurrent.load(Ordering::Relaxed)),
            ),
        ]
    }
}

/// Per-flow sequence and timing state plus the metric calculation on top of
/// it. Owned by the capture thread, not thread-safe.
pub struct FlowMap {
    flows: LruCache<FlowKey, FlowState>,
    hop_jitter: HopJitterTable,
    idle_timeout: Option<Duration>,
    timestamp_mask: u64,
    stats_counter: Arc<FlowMapCounter>,
}

impl FlowMap {
    pub fn new(
        config: &FlowTableConfig,
        timestamp_48bit: bool,
        stats_collector: &stats::Collector,
    ) -> Self {
        let stats_counter = Arc::new(FlowMapCounter::default());
        stats_collector.register_countable(
            "flow-map",
            Countable::Ref(Arc::downgrade(&stats_counter) as Weak<dyn RefCountable>),
            vec![],
        );
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            flows: LruCache::new(capacity),
            hop_jitter: HopJitterTable::default(),
            idle_timeout: if config.idle_timeout.is_zero() {
                None
            } else {
                Some(config.idle_timeout)
            },
            timestamp_mask: if timestamp_48bit {
                TIMESTAMP_48BIT_MASK
            } else {
                u64::MAX
            },
            stats_counter,
        }
    }

    fn take_state(&mut self, key: FlowKey, now: Instant) -> FlowState {
        match self.flows.pop(&key) {
            Some(state) if self.idle_timeout.map_or(true, |t| !state.is_idle(now, t)) => state,
            Some(_) => {
                self.stats_counter.expired.fetch_add(1, Ordering::Relaxed);
                FlowState::new(now)
            }
            None => {
                self.stats_counter.new.fetch_add(1, Ordering::Relaxed);
                FlowState::new(now)
            }
        }
    }

    fn put_state(&mut self, key: FlowKey, state: FlowState) {
        // key was popped before, anything returned is another flow pushed out
        if let Some((evicted, _)) = self.flows.push(key, state) {
            debug!("flow {:016x} evicted from full flow map", evicted);
            self.stats_counter.evicted.fetch_add(1, Ordering::Relaxed);
        }
        self.stats_counter
            .concurrent
            .store(self.flows.len() as u64, Ordering::Relaxed);
    }

    /// Turns one decoded report into a record and advances the flow and hop
    /// state. The state update happens after every read, so a packet never
    /// sees its own contribution.
    pub fn inject(&mut self, packet: &IntPacket, now: Instant) -> TelemetryRecord {
        let header = &packet.header;
        let hops = packet.hops();
        let mut state = self.take_state(packet.flow_key, now);

        let dst_ts = (header.tstamp_nanos as u64)
            .wrapping_add((header.tstamp_secs as u64).wrapping_mul(NANOS_PER_SEC))
            & self.timestamp_mask;
        let orig_ts =
            hops.first().map(|h| h.ingress_tstamp).unwrap_or_default() & self.timestamp_mask;

        let (seq, reordering, protocol) = if header.seq == 0 {
            (state.last_seq.wrapping_add(1), 0, L4Protocol::Udp)
        } else {
            let raw = header.seq as u64;
            (
                raw,
                (raw as i64)
                    .wrapping_sub(state.last_seq as i64)
                    .wrapping_sub(1),
                L4Protocol::Tcp,
            )
        };

        let mut hop_metrics = Vec::with_capacity(MAX_HOPS + 1);
        let mut last_egress = 0u64;
        for (i, hop) in hops.iter().enumerate() {
            let link_delay = if i == 0 {
                0
            } else {
                last_egress.wrapping_sub(hop.ingress_tstamp) as i64
            };
            last_egress = hop.egress_tstamp;
            hop_metrics.push(HopMetric {
                hop_index: i as u8,
                hop_delay: hop.egress_tstamp.wrapping_sub(hop.ingress_tstamp),
                link_delay,
                hop_timestamp: hop.ingress_tstamp,
                hop_jitter: self.hop_jitter.update(i, hop.ingress_tstamp),
            });
        }
        // last switch to the sink
        hop_metrics.push(HopMetric {
            hop_index: hops.len() as u8,
            hop_delay: 0,
            link_delay: last_egress.wrapping_sub(dst_ts) as i64,
            hop_timestamp: dst_ts,
            hop_jitter: self.hop_jitter.update(hops.len(), dst_ts),
        });

        let record = TelemetryRecord {
            src_ip: header.src_addr,
            dst_ip: header.dst_addr,
            src_port: header.ingress_port,
            dst_port: header.egress_port,
            protocol,
            orig_ts,
            dst_ts,
            seq,
            delay: dst_ts.wrapping_sub(orig_ts),
            sink_jitter: dst_ts.wrapping_sub(state.prev_dst_ts),
            reordering,
            hops: hop_metrics,
        };

        state.last_seq = seq;
        state.prev_dst_ts = dst_ts;
        state.last_seen = now;
        self.put_state(packet.flow_key, state);

        record
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.flows.len()
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::int_header::tests::PacketBuilder;

    fn new_flow_map(capacity: usize, idle_timeout: Duration, ts48: bool) -> FlowMap {
        let collector = stats::Collector::new(Duration::from_secs(10));
        FlowMap::new(
            &FlowTableConfig {
                capacity,
                idle_timeout,
            },
            ts48,
            &collector,
        )
    }

    fn inject(map: &mut FlowMap, builder: &PacketBuilder, now: Instant) -> TelemetryRecord {
        let packet = IntPacket::decode(&builder.build()).unwrap();
        map.inject(&packet, now)
    }

    #[test]
    fn reordering_between_consecutive_sequences() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let now = Instant::now();
        let mut builder = PacketBuilder {
            seq: 100,
            ..Default::default()
        };
        let first = inject(&mut map, &builder, now);
        assert_eq!(first.seq, 100);
        assert_eq!(first.reordering, 99);
        assert_eq!(first.protocol, L4Protocol::Tcp);

        for (seq, expected) in [(101, 0), (105, 3), (103, -3), (104, 0)] {
            builder.seq = seq;
            let record = inject(&mut map, &builder, now);
            assert_eq!(record.seq, seq as u64);
            assert_eq!(record.reordering, expected, "seq {}", seq);
        }
    }

    #[test]
    fn sequenceless_flow_counts_up() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let now = Instant::now();
        let builder = PacketBuilder::default();
        let first = inject(&mut map, &builder, now);
        assert_eq!(first.seq, 1);
        assert_eq!(first.reordering, 0);
        assert_eq!(first.protocol, L4Protocol::Udp);
        let second = inject(&mut map, &builder, now);
        assert_eq!(second.seq, 2);
        assert_eq!(second.reordering, 0);
    }

    #[test]
    fn flows_are_tracked_separately() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let now = Instant::now();
        let a = PacketBuilder::default();
        let b = PacketBuilder {
            src: Ipv4Addr::new(10, 0, 0, 3),
            ..Default::default()
        };
        assert_eq!(inject(&mut map, &a, now).seq, 1);
        assert_eq!(inject(&mut map, &a, now).seq, 2);
        assert_eq!(inject(&mut map, &b, now).seq, 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn timestamps_and_delays() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let now = Instant::now();
        let mut builder = PacketBuilder {
            tstamp_secs: 2,
            tstamp_nanos: 5000,
            hops: vec![(1000, 1100), (1300, 1500), (1600, 1650)],
            ..Default::default()
        };
        let record = inject(&mut map, &builder, now);
        let dst_ts = 2_000_005_000;
        assert_eq!(record.dst_ts, dst_ts);
        assert_eq!(record.orig_ts, 1000);
        assert_eq!(record.delay, dst_ts - 1000);
        // first packet jitters against zero
        assert_eq!(record.sink_jitter, dst_ts);

        assert_eq!(record.hops.len(), 4);
        let indexes: Vec<u8> = record.hops.iter().map(|h| h.hop_index).collect();
        assert_eq!(indexes, vec![0, 1, 2, 3]);
        assert_eq!(record.hops[0].hop_delay, 100);
        assert_eq!(record.hops[0].link_delay, 0);
        assert_eq!(record.hops[1].hop_delay, 200);
        assert_eq!(record.hops[1].link_delay, 1100 - 1300);
        assert_eq!(record.hops[2].link_delay, 1500 - 1600);
        assert_eq!(record.hops[2].hop_timestamp, 1600);
        assert_eq!(record.hops[3].hop_delay, 0);
        assert_eq!(record.hops[3].link_delay, 1650 - dst_ts as i64);
        assert_eq!(record.hops[3].hop_timestamp, dst_ts);
        assert_eq!(record.hops[3].hop_jitter, dst_ts);

        builder.tstamp_nanos += 700;
        builder.hops = vec![(1040, 1100), (1300, 1500), (1600, 1650)];
        let record = inject(&mut map, &builder, now);
        assert_eq!(record.sink_jitter, 700);
        assert_eq!(record.hops[0].hop_jitter, 40);
        assert_eq!(record.hops[1].hop_jitter, 0);
        assert_eq!(record.hops[3].hop_jitter, 700);
    }

    #[test]
    fn hop_jitter_is_shared_across_flows() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let now = Instant::now();
        let a = PacketBuilder {
            hops: vec![(500, 600)],
            ..Default::default()
        };
        let b = PacketBuilder {
            src: Ipv4Addr::new(10, 9, 9, 9),
            hops: vec![(800, 900)],
            ..Default::default()
        };
        inject(&mut map, &a, now);
        let record = inject(&mut map, &b, now);
        assert_eq!(record.hops[0].hop_jitter, 300);
    }

    #[test]
    fn zero_hops_has_only_sink_hop() {
        let mut map = new_flow_map(16, Duration::ZERO, false);
        let record = inject(
            &mut map,
            &PacketBuilder {
                tstamp_nanos: 10,
                ..Default::default()
            },
            Instant::now(),
        );
        assert_eq!(record.orig_ts, 0);
        assert_eq!(record.delay, 10);
        assert_eq!(record.hops.len(), 1);
        assert_eq!(record.hops[0].hop_index, 0);
        assert_eq!(record.hops[0].link_delay, -10);
    }

    #[test]
    fn timestamps_masked_to_48_bits() {
        let mut map = new_flow_map(16, Duration::ZERO, true);
        let now = Instant::now();
        for (secs, nanos, ingress) in [
            (u32::MAX, u32::MAX, u64::MAX),
            (0x12345678, 999_999_999, 0xffff_0000_0000_0001),
            (1, 0, 1 << 48),
        ] {
            let record = inject(
                &mut map,
                &PacketBuilder {
                    tstamp_secs: secs,
                    tstamp_nanos: nanos,
                    hops: vec![(ingress, ingress)],
                    ..Default::default()
                },
                now,
            );
            assert!(record.orig_ts <= TIMESTAMP_48BIT_MASK);
            assert!(record.dst_ts <= TIMESTAMP_48BIT_MASK);
        }

        let mut unmasked = new_flow_map(16, Duration::ZERO, false);
        let record = inject(
            &mut unmasked,
            &PacketBuilder {
                hops: vec![(u64::MAX, u64::MAX)],
                ..Default::default()
            },
            now,
        );
        assert_eq!(record.orig_ts, u64::MAX);
    }

    #[test]
    fn least_recent_flow_evicted() {
        let mut map = new_flow_map(2, Duration::ZERO, false);
        let now = Instant::now();
        let flows: Vec<PacketBuilder> = (1..=3)
            .map(|i| PacketBuilder {
                src: Ipv4Addr::new(10, 0, 1, i),
                ..Default::default()
            })
            .collect();
        inject(&mut map, &flows[0], now);
        inject(&mut map, &flows[1], now);
        inject(&mut map, &flows[0], now);
        inject(&mut map, &flows[2], now);
        assert_eq!(map.len(), 2);
        assert_eq!(map.stats_counter.evicted.load(Ordering::Relaxed), 1);

        // flow 1 was the least recent and restarts from scratch
        assert_eq!(inject(&mut map, &flows[1], now).seq, 1);
        assert_eq!(inject(&mut map, &flows[2], now).seq, 2);
    }

    #[test]
    fn idle_flow_restarts() {
        let mut map = new_flow_map(16, Duration::from_secs(30), false);
        let start = Instant::now();
        let builder = PacketBuilder::default();
        assert_eq!(inject(&mut map, &builder, start).seq, 1);
        assert_eq!(inject(&mut map, &builder, start + Duration::from_secs(10)).seq, 2);
        assert_eq!(inject(&mut map, &builder, start + Duration::from_secs(60)).seq, 1);
        assert_eq!(map.stats_counter.expired.load(Ordering::Relaxed), 1);
        assert_eq!(map.stats_counter.new.load(Ordering::Relaxed), 1);
    }
}
