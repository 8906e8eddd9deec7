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
use std::net::Ipv4Addr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            L4Protocol::Tcp => write!(f, "TCP"),
            L4Protocol::Udp => write!(f, "UDP"),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HopMetric {
    pub hop_index: u8,
    pub hop_delay: u64,
    // propagation from the previous switch, negative when clocks disagree
    pub link_delay: i64,
    pub hop_timestamp: u64,
    pub hop_jitter: u64,
}

/// One processed INT report, the unit handed from the capture thread to the
/// exporters. Hop metrics include the trailing sink hop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: L4Protocol,
    pub orig_ts: u64,
    pub dst_ts: u64,
    pub seq: u64,
    pub delay: u64,
    pub sink_jitter: u64,
    pub reordering: i64,
    pub hops: Vec<HopMetric>,
}

// console rendering for verbose mode
impl fmt::Display for TelemetryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Orig TS       => {}", self.orig_ts)?;
        writeln!(f, "Dest TS       => {}", self.dst_ts)?;
        writeln!(f, "Seq           => {}", self.seq)?;
        writeln!(f, "Delay         => {}", self.delay)?;
        writeln!(f, "Sink Jitter   => {}", self.sink_jitter)?;
        writeln!(f, "Reordering    => {}", self.reordering)?;
        writeln!(f, "Protocol      => {}", self.protocol)?;
        writeln!(f, "IP Src        => {}", self.src_ip)?;
        writeln!(f, "IP Dst        => {}", self.dst_ip)?;
        writeln!(f, "Src Port      => {}", self.src_port)?;
        write!(f, "Dst Port      => {}", self.dst_port)?;
        for hop in self.hops.iter() {
            write!(
                f,
                "\nHop {:<9} => delay {} link {} ts {} jitter {}",
                hop.hop_index, hop.hop_delay, hop.link_delay, hop.hop_timestamp, hop.hop_jitter
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_rendering() {
        let record = TelemetryRecord {
            src_ip: Ipv4Addr::new(192, 168, 1, 10),
            dst_ip: Ipv4Addr::new(192, 168, 1, 20),
            src_port: 5000,
            dst_port: 6000,
            protocol: L4Protocol::Udp,
            orig_ts: 10,
            dst_ts: 30,
            seq: 1,
            delay: 20,
            sink_jitter: 30,
            reordering: 0,
            hops: vec![HopMetric {
                hop_index: 0,
                hop_delay: 0,
                link_delay: -20,
                hop_timestamp: 30,
                hop_jitter: 30,
            }],
        };
        let text = record.to_string();
        assert!(text.starts_with("Orig TS       => 10\n"));
        assert!(text.contains("IP Src        => 192.168.1.10\n"));
        assert!(text.contains("Protocol      => UDP\n"));
        assert!(text.ends_with("Hop 0         => delay 0 link -20 ts 30 jitter 30"));
    }
}
