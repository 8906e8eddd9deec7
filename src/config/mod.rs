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

mod config;
pub mod flow_filter;

pub use config::{
    CaptureConfig, CollectorConfig, Config, ConfigError, ExporterConfig, FlowTableConfig,
    DEFAULT_DATABASE, DEFAULT_QUEUE_SIZE,
};
pub use flow_filter::{load_flow_filters, FlowFilter};
