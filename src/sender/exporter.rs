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

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};

use super::{
    line_protocol,
    transport::{HttpTransport, Protocol, Transport, UdpTransport},
    ExportError, SenderCounter,
};
use crate::{
    common::TelemetryRecord,
    config::{CollectorConfig, ExporterConfig},
    utils::stats::{Collector, Countable, RefCountable, StatsOption},
};
use public::queue::{self, Error, Receiver, Sender};

const BUFFER_LEN: usize = 1 << 16;

/// Offers `msg` to each sender once, beginning at `start`. Returns the index
/// that accepted it, or the message back when every queue refused.
pub fn probe_send<T>(senders: &[Sender<T>], start: usize, msg: T) -> Result<usize, T> {
    let n = senders.len();
    let mut msg = msg;
    for i in 0..n {
        let index = (start + i) % n;
        match senders[index].send(msg) {
            Ok(()) => return Ok(index),
            Err(Error::Full(m)) | Err(Error::Terminated(Some(m))) => msg = m,
            Err(Error::Terminated(None)) | Err(Error::Empty) => unreachable!(),
        }
    }
    Err(msg)
}

/// N exporter workers, each draining its own ring. Records are spread
/// round-robin from the single capture thread, which never blocks here.
pub struct ExporterPool {
    senders: Vec<Sender<TelemetryRecord>>,
    cursor: usize,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl ExporterPool {
    /// Builds one transport per worker before starting any of them, so an
    /// unsupported protocol or unresolvable collector fails the whole pool.
    pub fn start(
        collector: &CollectorConfig,
        exporter: &ExporterConfig,
        stats: &Collector,
    ) -> Result<Self, ExportError> {
        let protocol: Protocol = collector.protocol.parse()?;
        let mut transports: Vec<Box<dyn Transport>> = Vec::with_capacity(exporter.workers);
        for _ in 0..exporter.workers {
            let transport: Box<dyn Transport> = match protocol {
                Protocol::Udp => Box::new(UdpTransport::new(&collector.host, collector.port)?),
                Protocol::Http => Box::new(HttpTransport::new(collector)?),
            };
            transports.push(transport);
        }
        info!(
            "exporting to {}://{}:{} with {} workers",
            protocol, collector.host, collector.port, exporter.workers
        );
        Ok(Self::with_transports(exporter, transports, stats))
    }

    pub fn with_transports(
        config: &ExporterConfig,
        transports: Vec<Box<dyn Transport>>,
        stats: &Collector,
    ) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let mut senders = Vec::with_capacity(transports.len());
        let mut threads = Vec::with_capacity(transports.len());
        for (id, transport) in transports.into_iter().enumerate() {
            let (sender, receiver, counter) = queue::bounded(config.queue_size.max(1));
            stats.register_countable(
                "queue",
                Countable::Owned(Box::new(counter)),
                vec![
                    StatsOption::Tag("module", "capture-to-exporter".to_owned()),
                    StatsOption::Tag("index", id.to_string()),
                ],
            );
            let worker = ExporterWorker::new(id, receiver, transport, running.clone(), config);
            stats.register_countable(
                "exporter",
                Countable::Ref(Arc::downgrade(&worker.counter) as Weak<dyn RefCountable>),
                vec![StatsOption::Tag("id", id.to_string())],
            );
            let handle = thread::Builder::new()
                .name(format!("int-exporter-{}", id))
                .spawn(move || {
                    let mut worker = worker;
                    worker.process()
                })
                .unwrap();
            senders.push(sender);
            threads.push(handle);
        }
        Self {
            senders,
            cursor: 0,
            running,
            threads,
        }
    }

    /// Hands a record to the next worker. Returns false when every ring is
    /// full and the record was dropped.
    pub fn dispatch(&mut self, record: TelemetryRecord) -> bool {
        if self.senders.is_empty() {
            return false;
        }
        let start = self.cursor;
        self.cursor = (self.cursor + 1) % self.senders.len();
        probe_send(&self.senders, start, record).is_ok()
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Stops every worker after a last flush of its pending batch. Records
    /// still queued are discarded.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::Relaxed) {
            return;
        }
        info!("stopping {} exporter workers", self.threads.len());
        self.senders.clear();
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        info!("stopped exporter workers");
    }
}

impl Drop for ExporterPool {
    fn drop(&mut self) {
        self.stop();
    }
}

// Idle flush deadline measured from the last pop. One poll interval is kept
// as headroom for sleep overshoot so the batch leaves within
// `idle_flush_polls * poll_interval`.
fn idle_flush_after(poll_interval: Duration, idle_flush_polls: u32) -> Duration {
    match poll_interval.checked_mul(idle_flush_polls.max(1)) {
        Some(timeout) => timeout.saturating_sub(poll_interval),
        None => Duration::MAX,
    }
}

struct ExporterWorker {
    id: usize,
    input: Receiver<TelemetryRecord>,
    transport: Box<dyn Transport>,
    counter: Arc<SenderCounter>,
    running: Arc<AtomicBool>,

    batch_size: usize,
    poll_interval: Duration,
    // a partial batch is sent once the ring stayed empty this long after the last pop
    flush_after: Duration,
    hop_metrics: bool,

    buffer: String,
    pending: usize,
}

impl ExporterWorker {
    fn new(
        id: usize,
        input: Receiver<TelemetryRecord>,
        transport: Box<dyn Transport>,
        running: Arc<AtomicBool>,
        config: &ExporterConfig,
    ) -> Self {
        Self {
            id,
            input,
            transport,
            counter: Arc::new(SenderCounter::default()),
            running,
            batch_size: config.batch_size.max(1),
            poll_interval: config.poll_interval,
            flush_after: idle_flush_after(config.poll_interval, config.idle_flush_polls),
            hop_metrics: config.hop_metrics,
            buffer: String::with_capacity(BUFFER_LEN),
            pending: 0,
        }
    }

    fn process(&mut self) {
        info!("exporter worker {} started", self.id);
        let mut last_pop = Instant::now();
        while self.running.load(Ordering::Relaxed) {
            match self.input.recv() {
                Ok(record) => {
                    last_pop = Instant::now();
                    self.counter.rx.fetch_add(1, Ordering::Relaxed);
                    line_protocol::encode(&record, self.hop_metrics, &mut self.buffer);
                    self.pending += 1;
                    if self.pending >= self.batch_size {
                        self.flush();
                    }
                }
                Err(Error::Empty) => {
                    if self.pending == 0 {
                        thread::sleep(self.poll_interval);
                        continue;
                    }
                    let idle = last_pop.elapsed();
                    if idle >= self.flush_after {
                        debug!(
                            "exporter worker {} idle flush of {} records",
                            self.id, self.pending
                        );
                        self.flush();
                    } else {
                        // never sleep past the flush point
                        thread::sleep(self.poll_interval.min(self.flush_after - idle));
                    }
                }
                Err(Error::Terminated(..)) => break,
                Err(Error::Full(_)) => unreachable!(),
            }
        }
        self.flush();
        info!("exporter worker {} stopped", self.id);
    }

    // the batch is cleared whatever the outcome, failed batches are not retried
    fn flush(&mut self) {
        if self.pending == 0 {
            return;
        }
        match self.transport.send(self.buffer.as_bytes()) {
            Ok(()) => {
                self.counter.tx.fetch_add(1, Ordering::Relaxed);
                self.counter
                    .tx_bytes
                    .fetch_add(self.buffer.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                if self.counter.dropped.load(Ordering::Relaxed) == 0 {
                    error!(
                        "exporter worker {} failed to send {} records: {}",
                        self.id, self.pending, e
                    );
                } else {
                    warn!("exporter worker {} send failed: {}", self.id, e);
                }
                self.counter.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.buffer.clear();
        self.pending = 0;
    }
}
