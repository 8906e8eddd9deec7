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

pub mod device;
pub mod recv_engine;

pub use device::{DeviceConfigurator, DeviceError, RuleLogDevice};
pub use recv_engine::{PacketSource, UdpSource};

use std::io;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Weak,
};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::{
    common::{DecodeError, IntPacket},
    config::Config,
    flow_generator::FlowMap,
    sender::ExporterPool,
    utils::stats::{self, Countable, Counter, CounterType, CounterValue, RefCountable},
};

const RELEASE_BATCH: u64 = 32;
const DROP_LOG_INTERVAL: u64 = 1000;

/// Cumulative packet totals, owned by the capture loop and handed back when
/// it ends.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PacketTotals {
    pub packets: u64,
    pub sampled: u64,
    pub dropped: u64,
    pub decode_errors: u64,
}

#[derive(Default)]
pub struct DispatcherCounter {
    rx: AtomicU64,
    sampled: AtomicU64,
    dropped: AtomicU64,
    decode_errors: AtomicU64,
}

impl RefCountable for DispatcherCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "sampled",
                CounterType::Counted,
                CounterValue::Unsigned(self.sampled.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                CounterType::Counted,
                CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
            ),
            (
                "decode-errors",
                CounterType::Counted,
                CounterValue::Unsigned(self.decode_errors.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}

pub struct PacketHandler {
    flow_map: FlowMap,
    exporter: Option<ExporterPool>,
    totals: PacketTotals,
    counter: Arc<DispatcherCounter>,

    payload_offset: usize,
    sampling_rate: u64,
    verbose: bool,
}

impl PacketHandler {
    pub fn new(config: &Config, exporter: Option<ExporterPool>, stats: &stats::Collector) -> Self {
        let counter = Arc::new(DispatcherCounter::default());
        stats.register_countable(
            "dispatcher",
            Countable::Ref(Arc::downgrade(&counter) as Weak<dyn RefCountable>),
            vec![],
        );
        Self {
            flow_map: FlowMap::new(&config.flow_table, config.timestamp_48bit, stats),
            exporter,
            totals: PacketTotals::default(),
            counter,
            payload_offset: config.capture.payload_offset,
            sampling_rate: config.sampling_rate.max(1),
            verbose: config.verbose,
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<IntPacket, DecodeError> {
        match payload.get(self.payload_offset..) {
            Some(header) => IntPacket::decode(header),
            None => Err(DecodeError::Truncated {
                need: self.payload_offset,
                have: payload.len(),
            }),
        }
    }

    pub fn handle(&mut self, payload: &[u8], now: Instant) {
        let index = self.totals.packets;
        self.totals.packets += 1;
        self.counter.rx.fetch_add(1, Ordering::Relaxed);

        let packet = match self.decode(payload) {
            Ok(p) => p,
            Err(e) => {
                self.totals.decode_errors += 1;
                self.counter.decode_errors.fetch_add(1, Ordering::Relaxed);
                debug!("packet {} skipped: {}", index, e);
                return;
            }
        };
        let record = self.flow_map.inject(&packet, now);
        if self.verbose {
            println!("{}\n", record);
        }

        if index % self.sampling_rate != 0 {
            return;
        }
        let Some(exporter) = self.exporter.as_mut() else {
            return;
        };
        self.totals.sampled += 1;
        self.counter.sampled.fetch_add(1, Ordering::Relaxed);
        if !exporter.dispatch(record) {
            self.totals.dropped += 1;
            self.counter.dropped.fetch_add(1, Ordering::Relaxed);
            if self.totals.dropped % DROP_LOG_INTERVAL == 0 {
                warn!(
                    "{} records dropped, exporter queues are full",
                    self.totals.dropped
                );
            }
        }
    }

    pub fn totals(&self) -> PacketTotals {
        self.totals
    }

    #[cfg(test)]
    fn flow_map(&self) -> &FlowMap {
        &self.flow_map
    }

    // stops the exporters after their last flush
    fn finish(&mut self) -> PacketTotals {
        if let Some(mut exporter) = self.exporter.take() {
            exporter.stop();
        }
        self.totals
    }
}

/// The capture loop: pulls payloads from the source until terminated, then
/// stops the exporters and reports the totals. A failing source ends the
/// loop early, the exporters are stopped all the same.
pub struct Dispatcher<S: PacketSource> {
    source: S,
    handler: PacketHandler,
    terminated: Arc<AtomicBool>,
}

impl<S: PacketSource> Dispatcher<S> {
    pub fn new(source: S, handler: PacketHandler, terminated: Arc<AtomicBool>) -> Self {
        Self {
            source,
            handler,
            terminated,
        }
    }

    pub fn run(mut self) -> io::Result<PacketTotals> {
        info!("dispatcher started");
        let mut unreleased = 0u64;
        let mut failure = None;
        while !self.terminated.load(Ordering::Relaxed) {
            match self.source.recv() {
                Ok(Some(payload)) => {
                    self.handler.handle(payload, Instant::now());
                    unreleased += 1;
                    if unreleased >= RELEASE_BATCH {
                        self.source.release();
                        unreleased = 0;
                    }
                }
                Ok(None) => {
                    if unreleased > 0 {
                        self.source.release();
                        unreleased = 0;
                    }
                }
                Err(e) => {
                    error!("capture source failed: {}", e);
                    failure = Some(e);
                    break;
                }
            }
        }
        self.source.release();
        let totals = self.handler.finish();
        info!("dispatcher stopped: {:?}", totals);
        match failure {
            Some(e) => Err(e),
            None => Ok(totals),
        }
    }
}
