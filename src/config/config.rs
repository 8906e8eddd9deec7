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

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_DATABASE: &str = "int_telemetry";
pub const DEFAULT_QUEUE_SIZE: usize = 100000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("yaml config invalid: {0}")]
    YamlConfigInvalid(String),
    #[error("config invalid: {0}")]
    Invalid(String),
    #[error("flow filter file {path:?} invalid: {reason}")]
    FlowFilter { path: PathBuf, reason: String },
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub capture: CaptureConfig,
    pub collector: CollectorConfig,
    pub exporter: ExporterConfig,
    pub flow_table: FlowTableConfig,
    pub log_file: String,
    pub log_level: String,
    // export one of every `sampling_rate` packets
    pub sampling_rate: u64,
    pub flow_filter_file: String,
    pub verbose: bool,
    pub timestamp_48bit: bool,
    pub configure_device: bool,
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            collector: CollectorConfig::default(),
            exporter: ExporterConfig::default(),
            flow_table: FlowTableConfig::default(),
            log_file: String::new(),
            log_level: "info".to_owned(),
            sampling_rate: 1,
            flow_filter_file: String::new(),
            verbose: false,
            timestamp_48bit: false,
            configure_device: true,
            stats_interval: Duration::from_secs(10),
        }
    }
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))?;
        Self::load(&contents)
    }

    pub fn load<C: AsRef<str>>(contents: C) -> Result<Self, ConfigError> {
        let contents = contents.as_ref();
        if contents.trim().is_empty() {
            // parsing empty string leads to EOF error
            return Ok(Self::default());
        }
        serde_yaml::from_str(contents).map_err(|e| ConfigError::YamlConfigInvalid(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            (self.sampling_rate >= 1, "sampling-rate must be at least 1"),
            (
                self.exporter.batch_size >= 1,
                "exporter.batch-size must be at least 1",
            ),
            (self.exporter.workers >= 1, "exporter.workers must be at least 1"),
            (
                self.exporter.queue_size >= 1,
                "exporter.queue-size must be at least 1",
            ),
            (
                self.exporter.idle_flush_polls >= 1,
                "exporter.idle-flush-polls must be at least 1",
            ),
            (
                self.flow_table.capacity >= 1,
                "flow-table.capacity must be at least 1",
            ),
        ];
        match checks.iter().find(|(ok, _)| !ok) {
            Some((_, reason)) => Err(ConfigError::Invalid(reason.to_string())),
            None => Ok(()),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CaptureConfig {
    pub device_id: u32,
    pub listen_address: String,
    // bytes in front of the INT header, e.g. outer headers kept by the source
    pub payload_offset: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device_id: 0,
            listen_address: "0.0.0.0:17000".to_owned(),
            payload_offset: 0,
        }
    }
}

#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct CollectorConfig {
    // export is disabled when empty
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub username: String,
    pub password: String,
    pub database: String,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 8089,
            protocol: "udp".to_owned(),
            username: String::new(),
            password: String::new(),
            database: DEFAULT_DATABASE.to_owned(),
            timeout: Duration::from_secs(3),
        }
    }
}

impl fmt::Debug for CollectorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &"******")
            .field("database", &self.database)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExporterConfig {
    // records per batch
    pub batch_size: usize,
    pub workers: usize,
    pub queue_size: usize,
    pub idle_flush_polls: u32,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    pub hop_metrics: bool,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            workers: 1,
            queue_size: DEFAULT_QUEUE_SIZE,
            idle_flush_polls: 10,
            poll_interval: Duration::from_micros(100),
            hop_metrics: true,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowTableConfig {
    pub capacity: usize,
    // zero disables idle expiry
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
}

impl Default for FlowTableConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 20,
            idle_timeout: Duration::ZERO,
        }
    }
}
