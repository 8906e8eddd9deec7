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

// Time-series line protocol:
//   measurement,tag=v,tag=v field=v,field=v timestamp
// Tag values here are addresses and numbers, none need escaping.

use std::fmt::Write;

use crate::common::TelemetryRecord;

pub const MEASUREMENT: &str = "int_telemetry";
pub const HOP_MEASUREMENT: &str = "int_hop";

fn write_tags(record: &TelemetryRecord, out: &mut String) {
    let _ = write!(
        out,
        "srcip={},dstip={},srcp={},dstp={}",
        record.src_ip, record.dst_ip, record.src_port, record.dst_port
    );
}

/// Appends the lines of one record to `out`, every line newline terminated.
pub fn encode(record: &TelemetryRecord, hop_metrics: bool, out: &mut String) {
    out.push_str(MEASUREMENT);
    out.push(',');
    write_tags(record, out);
    let _ = writeln!(
        out,
        " origts={},dstts={},seq={},delay={},sink_jitter={},reordering={} {}",
        record.orig_ts,
        record.dst_ts,
        record.seq,
        record.delay,
        record.sink_jitter,
        record.reordering,
        record.dst_ts
    );

    if !hop_metrics {
        return;
    }
    for hop in record.hops.iter() {
        out.push_str(HOP_MEASUREMENT);
        out.push(',');
        write_tags(record, out);
        let _ = writeln!(
            out,
            ",hop={} hop_delay={},link_delay={},hop_ts={},hop_jitter={} {}",
            hop.hop_index,
            hop.hop_delay,
            hop.link_delay,
            hop.hop_timestamp,
            hop.hop_jitter,
            record.dst_ts
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::common::{HopMetric, L4Protocol};

    pub(crate) fn new_record(seq: u64) -> TelemetryRecord {
        TelemetryRecord {
            src_ip: Ipv4Addr::new(192, 168, 0, 1),
            dst_ip: Ipv4Addr::new(192, 168, 0, 2),
            src_port: 17000,
            dst_port: 17001,
            protocol: L4Protocol::Tcp,
            orig_ts: 1000,
            dst_ts: 5000,
            seq,
            delay: 4000,
            sink_jitter: 250,
            reordering: -2,
            hops: vec![
                HopMetric {
                    hop_index: 0,
                    hop_delay: 100,
                    link_delay: 0,
                    hop_timestamp: 1000,
                    hop_jitter: 5,
                },
                HopMetric {
                    hop_index: 1,
                    hop_delay: 0,
                    link_delay: -3900,
                    hop_timestamp: 5000,
                    hop_jitter: 7,
                },
            ],
        }
    }

    #[test]
    fn baseline_line() {
        let mut out = String::new();
        encode(&new_record(42), false, &mut out);
        assert_eq!(
            out,
            "int_telemetry,srcip=192.168.0.1,dstip=192.168.0.2,srcp=17000,dstp=17001 \
             origts=1000,dstts=5000,seq=42,delay=4000,sink_jitter=250,reordering=-2 5000\n"
        );
    }

    #[test]
    fn hop_lines_follow_record() {
        let mut out = String::new();
        encode(&new_record(1), true, &mut out);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("int_telemetry,"));
        assert_eq!(
            lines[1],
            "int_hop,srcip=192.168.0.1,dstip=192.168.0.2,srcp=17000,dstp=17001,hop=0 \
             hop_delay=100,link_delay=0,hop_ts=1000,hop_jitter=5 5000"
        );
        assert_eq!(
            lines[2],
            "int_hop,srcip=192.168.0.1,dstip=192.168.0.2,srcp=17000,dstp=17001,hop=1 \
             hop_delay=0,link_delay=-3900,hop_ts=5000,hop_jitter=7 5000"
        );
        assert!(out.ends_with('\n'));
    }

    #[test]
    fn encode_appends() {
        let mut out = String::new();
        encode(&new_record(1), false, &mut out);
        encode(&new_record(2), false, &mut out);
        assert_eq!(out.lines().count(), 2);
        assert!(out.lines().nth(1).unwrap().contains("seq=2,"));
    }
}
