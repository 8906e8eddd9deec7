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

use anyhow::Result;
use clap::{ArgAction, Parser};
use log::error;
use signal_hook::{consts::TERM_SIGNALS, iterator::Signals};

use ::int_sink::{config::Config, sink};

/// INT telemetry sink: decodes INT reports and exports per-flow metrics
#[derive(Parser)]
#[clap(version)]
struct Opts {
    /// Specify config file location, defaults are used when absent
    #[clap(short = 'f', long)]
    config_file: Option<String>,

    /// Device id to configure
    #[clap(short = 'd', long)]
    device_id: Option<u32>,

    /// Address to capture INT reports on
    #[clap(short = 'e', long)]
    listen: Option<String>,

    /// Collector host, export is disabled when not set
    #[clap(short = 'c', long)]
    collector_host: Option<String>,

    /// Collector port
    #[clap(short = 'p', long)]
    collector_port: Option<u16>,

    /// Collector protocol, udp or http
    #[clap(short = 'r', long)]
    collector_protocol: Option<String>,

    /// Collector user name
    #[clap(short = 'u', long)]
    username: Option<String>,

    /// Collector password
    #[clap(short = 's', long)]
    password: Option<String>,

    /// Records per batch
    #[clap(short = 'b', long)]
    batch: Option<usize>,

    /// Write logs to this file instead of stderr
    #[clap(short = 'l', long)]
    log_file: Option<String>,

    /// Export one of every N packets
    #[clap(short = 'm', long)]
    sampling_rate: Option<u64>,

    /// Number of exporter workers
    #[clap(short = 'i', long)]
    workers: Option<usize>,

    /// Flow allow-list file, one `a.b.c.d port` per line
    #[clap(short = 'F', long)]
    flow_filter: Option<String>,

    /// Print every decoded record
    #[clap(short, long, action = ArgAction::SetTrue)]
    verbose: bool,

    /// Hardware timestamps wrap at 48 bits
    #[clap(short = 't', long, action = ArgAction::SetTrue)]
    timestamp_48bit: bool,

    /// Skip device configuration
    #[clap(short = 'k', long, action = ArgAction::SetTrue)]
    skip_device_config: bool,
}

impl Opts {
    fn apply(self, config: &mut Config) {
        if let Some(v) = self.device_id {
            config.capture.device_id = v;
        }
        if let Some(v) = self.listen {
            config.capture.listen_address = v;
        }
        if let Some(v) = self.collector_host {
            config.collector.host = v;
        }
        if let Some(v) = self.collector_port {
            config.collector.port = v;
        }
        if let Some(v) = self.collector_protocol {
            config.collector.protocol = v;
        }
        if let Some(v) = self.username {
            config.collector.username = v;
        }
        if let Some(v) = self.password {
            config.collector.password = v;
        }
        if let Some(v) = self.batch {
            config.exporter.batch_size = v;
        }
        if let Some(v) = self.log_file {
            config.log_file = v;
        }
        if let Some(v) = self.sampling_rate {
            config.sampling_rate = v;
        }
        if let Some(v) = self.workers {
            config.exporter.workers = v;
        }
        if let Some(v) = self.flow_filter {
            config.flow_filter_file = v;
        }
        config.verbose |= self.verbose;
        config.timestamp_48bit |= self.timestamp_48bit;
        if self.skip_device_config {
            config.configure_device = false;
        }
    }
}

// returns on a termination signal, or as soon as capture dies on its own
fn wait_on_signals(s: &sink::Sink) -> Result<()> {
    let mut signals = Signals::new(TERM_SIGNALS)?;
    let handle = signals.handle();
    s.on_capture_exit(move || handle.close());
    signals.forever().next();
    signals.handle().close();
    Ok(())
}

fn main() -> Result<()> {
    let opts = Opts::parse();
    let mut config = match opts.config_file.as_ref() {
        Some(path) => Config::load_from_file(path)?,
        None => Config::default(),
    };
    opts.apply(&mut config);

    let _logger = sink::init_logger(&config)?;
    let mut s = match sink::Sink::start(&config) {
        Ok(s) => s,
        Err(e) => {
            error!("startup failed: {:#}", e);
            return Err(e);
        }
    };
    wait_on_signals(&s)?;
    let totals = s.stop()?;

    println!("\ntotal - {}", totals.packets);
    println!("drop - {}", totals.dropped);
    println!("decode errors - {}", totals.decode_errors);
    Ok(())
}
