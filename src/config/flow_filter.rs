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
use std::net::Ipv4Addr;
use std::path::Path;
use std::str::FromStr;

use super::ConfigError;

pub const DEVICE_KEY_LEN: usize = 6;

/// One allow-list entry, matched by the device on source address and
/// destination port of the carrier packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowFilter {
    pub src_ip: Ipv4Addr,
    pub dst_port: u16,
}

impl FlowFilter {
    // octets reversed, then the port in little-endian
    pub fn device_key(&self) -> [u8; DEVICE_KEY_LEN] {
        let [a, b, c, d] = self.src_ip.octets();
        let [lo, hi] = self.dst_port.to_le_bytes();
        [d, c, b, a, lo, hi]
    }
}

impl fmt::Display for FlowFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.src_ip, self.dst_port)
    }
}

impl FromStr for FlowFilter {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut fields = s.split_whitespace();
        let (Some(ip), Some(port), None) = (fields.next(), fields.next(), fields.next()) else {
            return Err(format!("expected `<ipv4> <port>`, got {:?}", s));
        };
        let src_ip = ip
            .parse::<Ipv4Addr>()
            .map_err(|e| format!("bad address {:?}: {}", ip, e))?;
        let dst_port = port
            .parse::<u16>()
            .map_err(|e| format!("bad port {:?}: {}", port, e))?;
        Ok(Self { src_ip, dst_port })
    }
}

pub fn parse_flow_filters(path: &Path, contents: &str) -> Result<Vec<FlowFilter>, ConfigError> {
    let mut filters = vec![];
    for (i, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let filter = line.parse().map_err(|reason| ConfigError::FlowFilter {
            path: path.to_path_buf(),
            reason: format!("line {}: {}", i + 1, reason),
        })?;
        filters.push(filter);
    }
    Ok(filters)
}

pub fn load_flow_filters<P: AsRef<Path>>(path: P) -> Result<Vec<FlowFilter>, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::FlowFilter {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    parse_flow_filters(path, &contents)
}
