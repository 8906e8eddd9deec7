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

use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, Result};
use flexi_logger::{
    colored_opt_format, Age, Cleanup, Criterion, FileSpec, Logger, LoggerHandle, Naming,
};
use log::{error, info, warn};

use crate::{
    config::{load_flow_filters, Config},
    dispatcher::{
        DeviceConfigurator, Dispatcher, PacketHandler, PacketSource, PacketTotals, RuleLogDevice,
        UdpSource,
    },
    sender::ExporterPool,
    utils::stats,
};

const DEFAULT_LOG_RETENTION: usize = 7;

/// Sets up the global logger. Logs go to `log-file` when configured, to
/// standard error otherwise.
pub fn init_logger(config: &Config) -> Result<LoggerHandle> {
    let logger = Logger::try_with_env_or_str(&config.log_level)?.format(colored_opt_format);
    let logger = if config.log_file.is_empty() {
        logger
    } else {
        logger
            .log_to_file(FileSpec::try_from(&config.log_file)?)
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(DEFAULT_LOG_RETENTION),
            )
            .append()
    };
    Ok(logger.start()?)
}

#[derive(Default)]
struct CaptureExit {
    exited: bool,
    hook: Option<Box<dyn FnOnce() + Send>>,
}

pub struct Sink {
    terminated: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<io::Result<PacketTotals>>>,
    exit: Arc<Mutex<CaptureExit>>,
    stats_collector: Arc<stats::Collector>,
    listen_addr: SocketAddr,
}

impl Sink {
    pub fn start(config: &Config) -> Result<Self> {
        let mut device = RuleLogDevice::new(config.capture.device_id);
        Self::start_with_device(config, &mut device)
    }

    /// Startup order: device rules, exporters, capture. Any failure on the
    /// way aborts before the capture loop runs.
    pub fn start_with_device(config: &Config, device: &mut dyn DeviceConfigurator) -> Result<Self> {
        config.validate()?;
        info!("static config {:#?}", config);

        let filters = if config.flow_filter_file.is_empty() {
            vec![]
        } else {
            load_flow_filters(&config.flow_filter_file)?
        };
        if config.configure_device {
            device.configure(&filters).map_err(|e| {
                anyhow!(
                    "device {} configuration failed: {}",
                    config.capture.device_id,
                    e
                )
            })?;
        } else {
            info!("device configuration skipped");
        }

        let stats_collector = Arc::new(stats::Collector::new(config.stats_interval));
        let exporter = if config.collector.host.is_empty() {
            warn!("collector host not set, records will not be exported");
            None
        } else {
            Some(ExporterPool::start(
                &config.collector,
                &config.exporter,
                &stats_collector,
            )?)
        };

        let source = UdpSource::bind(&config.capture.listen_address).map_err(|e| {
            anyhow!(
                "capture on {} unavailable: {}",
                config.capture.listen_address,
                e
            )
        })?;
        let listen_addr = source.local_addr()?;
        let handler = PacketHandler::new(config, exporter, &stats_collector);
        Self::run_capture(source, handler, stats_collector, listen_addr)
    }

    fn run_capture<S: PacketSource + 'static>(
        source: S,
        handler: PacketHandler,
        stats_collector: Arc<stats::Collector>,
        listen_addr: SocketAddr,
    ) -> Result<Self> {
        let terminated = Arc::new(AtomicBool::new(false));
        let exit = Arc::new(Mutex::new(CaptureExit::default()));
        let dispatcher = Dispatcher::new(source, handler, terminated.clone());
        let thread_exit = exit.clone();
        let handle = thread::Builder::new()
            .name("int-dispatcher".to_owned())
            .spawn(move || {
                let result = dispatcher.run();
                let hook = {
                    let mut exit = thread_exit.lock().unwrap();
                    exit.exited = true;
                    exit.hook.take()
                };
                if let Some(hook) = hook {
                    hook();
                }
                result
            })?;
        stats_collector.start();
        info!("int sink started");

        Ok(Self {
            terminated,
            dispatcher: Some(handle),
            exit,
            stats_collector,
            listen_addr,
        })
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Runs `f` once the capture loop has ended, whether stopped or failed.
    /// Runs it right away when the loop is already gone.
    pub fn on_capture_exit<F: FnOnce() + Send + 'static>(&self, f: F) {
        let mut exit = self.exit.lock().unwrap();
        if exit.exited {
            drop(exit);
            f();
        } else {
            exit.hook = Some(Box::new(f));
        }
    }

    /// Stops capture before the next packet, then the exporters, and returns
    /// the cumulative totals. Fails when the capture loop had already ended
    /// on a source error.
    pub fn stop(&mut self) -> Result<PacketTotals> {
        self.terminated.store(true, Ordering::Relaxed);
        let result = match self.dispatcher.take().map(|h| h.join()) {
            Some(Ok(Ok(totals))) => Ok(totals),
            Some(Ok(Err(e))) => Err(anyhow!("capture failed: {}", e)),
            Some(Err(_)) => Err(anyhow!("dispatcher thread panicked")),
            None => Ok(PacketTotals::default()),
        };
        self.stats_collector.stop();
        info!("int sink stopped");
        result
    }
}

impl Drop for Sink {
    fn drop(&mut self) {
        if self.dispatcher.is_some() {
            if let Err(e) = self.stop() {
                error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::UdpSocket;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use super::*;
    use crate::common::int_header::tests::PacketBuilder;
    use crate::config::FlowFilter;
    use crate::dispatcher::DeviceError;

    struct BrokenDevice;

    impl DeviceConfigurator for BrokenDevice {
        fn configure(&mut self, _: &[FlowFilter]) -> Result<(), DeviceError> {
            Err(DeviceError::Unavailable(3))
        }
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.capture.listen_address = "127.0.0.1:0".to_owned();
        config
    }

    #[test]
    fn device_failure_aborts_startup() {
        let result = Sink::start_with_device(&local_config(), &mut BrokenDevice);
        assert!(result.is_err());

        let mut config = local_config();
        config.configure_device = false;
        let mut sink = Sink::start_with_device(&config, &mut BrokenDevice).unwrap();
        sink.stop().unwrap();
    }

    #[test]
    fn filters_reach_device() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.1.1.1 17000").unwrap();
        let mut config = local_config();
        config.flow_filter_file = file.path().to_string_lossy().to_string();

        let mut device = RuleLogDevice::new(1);
        let mut sink = Sink::start_with_device(&config, &mut device).unwrap();
        assert_eq!(device.installed().len(), 4);
        sink.stop().unwrap();
    }

    #[test]
    fn unsupported_protocol_aborts_startup() {
        let mut config = local_config();
        config.collector.host = "127.0.0.1".to_owned();
        config.collector.protocol = "ftp".to_owned();
        assert!(Sink::start(&config).is_err());
    }

    #[test]
    fn exports_captured_reports() {
        let collector = UdpSocket::bind("127.0.0.1:0").unwrap();
        collector
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut config = local_config();
        config.collector.host = "127.0.0.1".to_owned();
        config.collector.port = collector.local_addr().unwrap().port();
        config.exporter.batch_size = 10;
        config.exporter.poll_interval = Duration::from_millis(1);
        config.exporter.hop_metrics = false;

        let mut sink = Sink::start(&config).unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        let report = PacketBuilder {
            seq: 7,
            ..Default::default()
        }
        .build();
        client.send_to(&report, sink.listen_addr()).unwrap();

        let mut buf = [0u8; 2048];
        let n = collector.recv(&mut buf).unwrap();
        let text = String::from_utf8_lossy(&buf[..n]).to_string();
        assert!(text.starts_with("int_telemetry,srcip=10.0.0.1,dstip=10.0.0.2,"));
        assert!(text.contains("seq=7,"));

        let start = Instant::now();
        let totals = sink.stop().unwrap();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(totals.packets, 1);
        assert_eq!(totals.sampled, 1);
        assert_eq!(totals.dropped, 0);
    }

    struct VanishingSource;

    impl PacketSource for VanishingSource {
        fn recv(&mut self) -> io::Result<Option<&[u8]>> {
            Err(io::Error::new(io::ErrorKind::NotConnected, "device gone"))
        }

        fn release(&mut self) {}
    }

    fn failed_sink() -> Sink {
        let config = local_config();
        let stats_collector = Arc::new(stats::Collector::new(config.stats_interval));
        let handler = PacketHandler::new(&config, None, &stats_collector);
        Sink::run_capture(
            VanishingSource,
            handler,
            stats_collector,
            "127.0.0.1:0".parse().unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn capture_failure_fires_exit_hook() {
        let mut sink = failed_sink();
        let (tx, rx) = mpsc::channel();
        sink.on_capture_exit(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(2)).is_ok());
        assert!(sink.stop().is_err());
    }

    #[test]
    fn exit_hook_registered_late_runs_at_once() {
        let mut sink = failed_sink();
        let start = Instant::now();
        while !sink.exit.lock().unwrap().exited {
            assert!(start.elapsed() < Duration::from_secs(2));
            thread::sleep(Duration::from_millis(1));
        }
        let (tx, rx) = mpsc::channel();
        sink.on_capture_exit(move || tx.send(()).unwrap());
        assert!(rx.try_recv().is_ok());
        assert!(sink.stop().is_err());
    }
}
