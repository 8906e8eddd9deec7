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

//! INT report header as written by the sink-facing switch.
//!
//! ```text
//!  0               4               8       10      12  13  14      16
//! +---------------+---------------+-------+-------+---+---+-------+
//! |   src addr    |   dst addr    | in pt | eg pt |len|hln| rsvd  |
//! +---------------+---------------+-------+-------+---+---+-------+
//! 16              20              24                              32
//! +---------------+---------------+-------------------------------+
//! |  tstamp secs  | tstamp nanos  |         delay (unused)        |
//! +---------------+---------------+-------------------------------+
//! 32              36
//! +---------------+
//! |      seq      |  followed by `len / hln` hop entries of 24 bytes
//! +---------------+
//!
//! hop entry:
//!  0               4       6       8                16               24
//! +---------------+-------+-------+----------------+----------------+
//! |   switch id   | in pt | eg pt | ingress tstamp | egress tstamp  |
//! +---------------+-------+-------+----------------+----------------+
//! ```
//!
//! Every multi-byte field is big-endian.

use std::net::Ipv4Addr;

use thiserror::Error;

use public::bytes::{read_u16_be, read_u32_be, read_u64_be};

pub const FLOW_HEADER_LEN: usize = 36;
pub const HOP_META_LEN: usize = 24;
// the jitter table keeps one extra slot for the sink itself
pub const MAX_HOPS: usize = 10;

const FLOW_KEY_LEN: usize = 8;

const OFFSET_SRC_ADDR: usize = 0;
const OFFSET_DST_ADDR: usize = 4;
const OFFSET_INGRESS_PORT: usize = 8;
const OFFSET_EGRESS_PORT: usize = 10;
const OFFSET_META_LEN: usize = 12;
const OFFSET_HOP_META_LEN: usize = 13;
const OFFSET_TSTAMP_SECS: usize = 16;
const OFFSET_TSTAMP_NANOS: usize = 20;
const OFFSET_DELAY: usize = 24;
const OFFSET_SEQ: usize = 32;

const OFFSET_SWITCH_ID: usize = 0;
const OFFSET_HOP_INGRESS_PORT: usize = 4;
const OFFSET_HOP_EGRESS_PORT: usize = 6;
const OFFSET_HOP_INGRESS_TSTAMP: usize = 8;
const OFFSET_HOP_EGRESS_TSTAMP: usize = 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("int packet truncated: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("int hop metadata unit length is zero")]
    ZeroHopUnitLength,
    #[error("int hop count {0} exceeds supported maximum {MAX_HOPS}")]
    TooManyHops(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowHeader {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub ingress_port: u16,
    pub egress_port: u16,
    pub meta_len: u8,
    pub hop_meta_len: u8,
    // hardware clock, seconds and nanoseconds parts
    pub tstamp_secs: u32,
    pub tstamp_nanos: u32,
    pub delay: u64,
    pub seq: u32,
}

impl FlowHeader {
    // caller guarantees bs.len() >= FLOW_HEADER_LEN
    fn parse(bs: &[u8]) -> Self {
        Self {
            src_addr: Ipv4Addr::from(read_u32_be(&bs[OFFSET_SRC_ADDR..])),
            dst_addr: Ipv4Addr::from(read_u32_be(&bs[OFFSET_DST_ADDR..])),
            ingress_port: read_u16_be(&bs[OFFSET_INGRESS_PORT..]),
            egress_port: read_u16_be(&bs[OFFSET_EGRESS_PORT..]),
            meta_len: bs[OFFSET_META_LEN],
            hop_meta_len: bs[OFFSET_HOP_META_LEN],
            tstamp_secs: read_u32_be(&bs[OFFSET_TSTAMP_SECS..]),
            tstamp_nanos: read_u32_be(&bs[OFFSET_TSTAMP_NANOS..]),
            delay: read_u64_be(&bs[OFFSET_DELAY..]),
            seq: read_u32_be(&bs[OFFSET_SEQ..]),
        }
    }

    pub fn hop_count(&self) -> Result<usize, DecodeError> {
        if self.hop_meta_len == 0 {
            return Err(DecodeError::ZeroHopUnitLength);
        }
        Ok((self.meta_len / self.hop_meta_len) as usize)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HopMeta {
    pub switch_id: u32,
    pub ingress_port: u16,
    pub egress_port: u16,
    pub ingress_tstamp: u64,
    pub egress_tstamp: u64,
}

impl HopMeta {
    // caller guarantees bs.len() >= HOP_META_LEN
    fn parse(bs: &[u8]) -> Self {
        Self {
            switch_id: read_u32_be(&bs[OFFSET_SWITCH_ID..]),
            ingress_port: read_u16_be(&bs[OFFSET_HOP_INGRESS_PORT..]),
            egress_port: read_u16_be(&bs[OFFSET_HOP_EGRESS_PORT..]),
            ingress_tstamp: read_u64_be(&bs[OFFSET_HOP_INGRESS_TSTAMP..]),
            egress_tstamp: read_u64_be(&bs[OFFSET_HOP_EGRESS_TSTAMP..]),
        }
    }
}

/// A decoded INT report. Hop entries are kept inline so that decoding does
/// not allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntPacket {
    pub flow_key: u64,
    pub header: FlowHeader,
    hops: [HopMeta; MAX_HOPS],
    hop_count: usize,
}

impl IntPacket {
    pub fn decode(bs: &[u8]) -> Result<Self, DecodeError> {
        if bs.len() < FLOW_HEADER_LEN {
            return Err(DecodeError::Truncated {
                need: FLOW_HEADER_LEN,
                have: bs.len(),
            });
        }
        let header = FlowHeader::parse(bs);
        let hop_count = header.hop_count()?;
        if hop_count > MAX_HOPS {
            return Err(DecodeError::TooManyHops(hop_count));
        }
        let need = FLOW_HEADER_LEN + hop_count * HOP_META_LEN;
        if bs.len() < need {
            return Err(DecodeError::Truncated {
                need,
                have: bs.len(),
            });
        }

        let mut hops = [HopMeta::default(); MAX_HOPS];
        for (i, chunk) in bs[FLOW_HEADER_LEN..need]
            .chunks_exact(HOP_META_LEN)
            .enumerate()
        {
            hops[i] = HopMeta::parse(chunk);
        }

        let mut key = [0u8; FLOW_KEY_LEN];
        key.copy_from_slice(&bs[..FLOW_KEY_LEN]);
        Ok(Self {
            flow_key: u64::from_be_bytes(key),
            header,
            hops,
            hop_count,
        })
    }

    pub fn hops(&self) -> &[HopMeta] {
        &self.hops[..self.hop_count]
    }

    pub fn hop_count(&self) -> usize {
        self.hop_count
    }
}
