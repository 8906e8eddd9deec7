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

use log::info;
use thiserror::Error;

use crate::config::FlowFilter;

pub const TABLE_ETH_MAP: &str = "table_eth_map";
pub const TABLE_CHA_MAP: &str = "table_cha_map";
pub const TABLE_INFLUX: &str = "table_influx";

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} not available")]
    Unavailable(u32),
    #[error("table {table} rejected rule: {reason}")]
    RuleRejected { table: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleKey {
    SrcAddr([u8; 4]),
    DstPort([u8; 2]),
}

impl fmt::Display for RuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleKey::SrcAddr(k) => write!(f, "ip.srcAddr={:02x?}", k),
            RuleKey::DstPort(k) => write!(f, "udp.dprt={:02x?}", k),
        }
    }
}

/// One match-action entry of the sink pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub table: &'static str,
    pub keys: Vec<RuleKey>,
    pub action: &'static str,
    pub default: bool,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.table)?;
        if self.default {
            write!(f, "default")?;
        } else {
            for (i, k) in self.keys.iter().enumerate() {
                if i > 0 {
                    write!(f, ",")?;
                }
                write!(f, "{}", k)?;
            }
        }
        write!(f, " -> {}", self.action)
    }
}

/// Rules the sink needs installed before capture: forward INT carriers of
/// allowed flows to the host and drop the rest.
pub fn sink_rules(filters: &[FlowFilter]) -> Vec<Rule> {
    let mut rules = vec![
        Rule {
            table: TABLE_ETH_MAP,
            keys: vec![],
            action: "NoAction",
            default: true,
        },
        Rule {
            table: TABLE_CHA_MAP,
            keys: vec![],
            action: "map_to_chan",
            default: true,
        },
        Rule {
            table: TABLE_INFLUX,
            keys: vec![],
            action: "pkt_drop",
            default: true,
        },
    ];
    for filter in filters {
        let key = filter.device_key();
        rules.push(Rule {
            table: TABLE_INFLUX,
            keys: vec![
                RuleKey::SrcAddr([key[0], key[1], key[2], key[3]]),
                RuleKey::DstPort([key[4], key[5]]),
            ],
            action: "fill_influx",
            default: false,
        });
    }
    rules
}

/// Programs the forwarding device once at startup.
pub trait DeviceConfigurator {
    fn configure(&mut self, filters: &[FlowFilter]) -> Result<(), DeviceError>;
}

/// Renders the rule set and logs it without touching hardware. Stands in
/// where no programmable device driver is linked.
#[derive(Debug, Default)]
pub struct RuleLogDevice {
    pub device_id: u32,
    installed: Vec<Rule>,
}

impl RuleLogDevice {
    pub fn new(device_id: u32) -> Self {
        Self {
            device_id,
            installed: vec![],
        }
    }

    pub fn installed(&self) -> &[Rule] {
        &self.installed
    }
}

impl DeviceConfigurator for RuleLogDevice {
    fn configure(&mut self, filters: &[FlowFilter]) -> Result<(), DeviceError> {
        self.installed = sink_rules(filters);
        for rule in self.installed.iter() {
            info!("device {} rule {}", self.device_id, rule);
        }
        info!(
            "device {} configured with {} flow filters",
            self.device_id,
            filters.len()
        );
        Ok(())
    }
}
