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

pub mod exporter;
pub mod line_protocol;
pub mod transport;

pub use exporter::ExporterPool;
pub use transport::{HttpTransport, Protocol, Transport, TransportError, UdpTransport};

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};

/// Failures while building the exporter pool, all fatal at startup.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported export protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("failed to resolve collector {addr}: {source}")]
    Resolve { addr: String, source: io::Error },
    #[error("invalid collector uri {0}")]
    InvalidUri(String),
    #[error("exporter setup failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Default)]
pub struct SenderCounter {
    pub rx: AtomicU64,
    pub tx: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub dropped: AtomicU64,
}

impl RefCountable for SenderCounter {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "rx",
                CounterType::Counted,
                CounterValue::Unsigned(self.rx.swap(0, Ordering::Relaxed)),
            ),
            (
                "tx",
                CounterType::Counted,
                CounterValue::Unsigned(self.tx.swap(0, Ordering::Relaxed)),
            ),
            (
                "tx-bytes",
                CounterType::Counted,
                CounterValue::Unsigned(self.tx_bytes.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped-batches",
                CounterType::Counted,
                CounterValue::Unsigned(self.dropped.swap(0, Ordering::Relaxed)),
            ),
        ]
    }
}
