// Copyright 2026 BadCompany
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Loopback engine wire format.
//!
//! SCTP-shaped packets: a 12-byte common header followed by TLV chunks padded
//! to four bytes. Every parser here works on untrusted input and reports
//! truncation or inconsistent lengths as `WireError` instead of panicking.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

use crate::harness_core::constants::wire::HEADER_LEN;

pub mod chunk {
    pub const DATA: u8 = 0;
    pub const INIT: u8 = 1;
    pub const INIT_ACK: u8 = 2;
    pub const SACK: u8 = 3;
    pub const HEARTBEAT: u8 = 4;
    pub const HEARTBEAT_ACK: u8 = 5;
    pub const ABORT: u8 = 6;
    pub const SHUTDOWN: u8 = 7;
    pub const SHUTDOWN_ACK: u8 = 8;
    pub const ERROR: u8 = 9;
    pub const COOKIE_ECHO: u8 = 10;
    pub const COOKIE_ACK: u8 = 11;
    pub const SHUTDOWN_COMPLETE: u8 = 14;
    pub const I_DATA: u8 = 0x40;
    pub const RE_CONFIG: u8 = 0x82;
}

pub mod param {
    pub const HEARTBEAT_INFO: u16 = 1;
    pub const STATE_COOKIE: u16 = 7;
    pub const SUPPORTED_EXTENSIONS: u16 = 0x8008;
}

pub mod cause {
    pub const INVALID_STREAM: u16 = 1;
    pub const MISSING_PARAM: u16 = 2;
    pub const STALE_COOKIE: u16 = 3;
    pub const UNRECOGNIZED_CHUNK: u16 = 6;
    pub const NO_USER_DATA: u16 = 9;
    pub const USER_ABORT: u16 = 12;
    pub const PROTOCOL_VIOLATION: u16 = 13;
}

pub mod flags {
    pub const DATA_END: u8 = 0x01;
    pub const DATA_BEGIN: u8 = 0x02;
    pub const DATA_UNORDERED: u8 = 0x04;
    /// Verification tag reflected (ABORT, SHUTDOWN COMPLETE)
    pub const T_BIT: u8 = 0x01;
}

pub const CHUNK_HEADER_LEN: usize = 4;
pub const INIT_FIXED_LEN: usize = 16;
pub const DATA_FIXED_LEN: usize = 12;
pub const SACK_FIXED_LEN: usize = 12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("Truncated {what}: need {need} bytes, have {have}")]
    Truncated {
        what: &'static str,
        need: usize,
        have: usize,
    },

    #[error("Invalid length {len} for {what}")]
    BadLength { what: &'static str, len: usize },
}

fn need(what: &'static str, buf: &[u8], len: usize) -> Result<(), WireError> {
    if buf.len() < len {
        return Err(WireError::Truncated {
            what,
            need: len,
            have: buf.len(),
        });
    }
    Ok(())
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

/// Serial number arithmetic on 32-bit TSNs.
pub fn tsn_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

pub fn tsn_le(a: u32, b: u32) -> bool {
    a == b || tsn_lt(a, b)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommonHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub vtag: u32,
    /// Checksum is offloaded: written as zero and never verified.
    pub checksum: u32,
}

impl CommonHeader {
    pub fn new(src_port: u16, dst_port: u16, vtag: u32) -> Self {
        Self {
            src_port,
            dst_port,
            vtag,
            checksum: 0,
        }
    }

    /// Splits `packet` into header and chunk area.
    pub fn parse(packet: &[u8]) -> Result<(Self, &[u8]), WireError> {
        need("common header", packet, HEADER_LEN)?;
        let (mut head, rest) = packet.split_at(HEADER_LEN);
        let header = Self {
            src_port: head.get_u16(),
            dst_port: head.get_u16(),
            vtag: head.get_u32(),
            checksum: head.get_u32(),
        };
        Ok((header, rest))
    }

    pub fn put(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u32(self.vtag);
        buf.put_u32(self.checksum);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk<'a> {
    pub kind: u8,
    pub flags: u8,
    /// Value without the chunk header and without padding
    pub value: &'a [u8],
}

/// Iterator over the chunks of a packet. Yields one error and then stops.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Chunks<'a> {
    pub fn new(area: &'a [u8]) -> Self {
        Self {
            rest: area,
            failed: false,
        }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Result<Chunk<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        if let Err(e) = need("chunk header", self.rest, CHUNK_HEADER_LEN) {
            self.failed = true;
            return Some(Err(e));
        }

        let mut head = &self.rest[..CHUNK_HEADER_LEN];
        let kind = head.get_u8();
        let flags = head.get_u8();
        let len = head.get_u16() as usize;

        if len < CHUNK_HEADER_LEN || len > self.rest.len() {
            self.failed = true;
            return Some(Err(WireError::BadLength { what: "chunk", len }));
        }

        let value = &self.rest[CHUNK_HEADER_LEN..len];
        // The last chunk may omit its padding.
        let advance = padded(len).min(self.rest.len());
        self.rest = &self.rest[advance..];
        Some(Ok(Chunk { kind, flags, value }))
    }
}

/// Type/length/value parameter or error cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tlv<'a> {
    pub kind: u16,
    pub value: &'a [u8],
}

/// Iterator over a parameter or error-cause list. Yields one error and then stops.
#[derive(Debug, Clone)]
pub struct Tlvs<'a> {
    rest: &'a [u8],
    failed: bool,
}

impl<'a> Tlvs<'a> {
    pub fn new(area: &'a [u8]) -> Self {
        Self {
            rest: area,
            failed: false,
        }
    }
}

impl<'a> Iterator for Tlvs<'a> {
    type Item = Result<Tlv<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.rest.is_empty() {
            return None;
        }
        if let Err(e) = need("parameter header", self.rest, 4) {
            self.failed = true;
            return Some(Err(e));
        }

        let mut head = &self.rest[..4];
        let kind = head.get_u16();
        let len = head.get_u16() as usize;
        if len < 4 || len > self.rest.len() {
            self.failed = true;
            return Some(Err(WireError::BadLength {
                what: "parameter",
                len,
            }));
        }

        let value = &self.rest[4..len];
        let advance = padded(len).min(self.rest.len());
        self.rest = &self.rest[advance..];
        Some(Ok(Tlv { kind, value }))
    }
}

/// Optional features negotiated through the supported-extensions parameter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    pub i_data: bool,
    pub re_config: bool,
}

impl Features {
    pub fn from_extension_list(list: &[u8]) -> Self {
        Self {
            i_data: list.contains(&chunk::I_DATA),
            re_config: list.contains(&chunk::RE_CONFIG),
        }
    }

    pub fn extension_list(&self) -> Vec<u8> {
        let mut list = Vec::new();
        if self.i_data {
            list.push(chunk::I_DATA);
        }
        if self.re_config {
            list.push(chunk::RE_CONFIG);
        }
        list
    }

    pub fn intersect(&self, other: &Features) -> Features {
        Features {
            i_data: self.i_data && other.i_data,
            re_config: self.re_config && other.re_config,
        }
    }

    pub fn to_bits(self) -> u8 {
        (self.i_data as u8) | ((self.re_config as u8) << 1)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self {
            i_data: bits & 1 != 0,
            re_config: bits & 2 != 0,
        }
    }
}

/// INIT or INIT ACK body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitChunk<'a> {
    pub init_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
    pub cookie: Option<&'a [u8]>,
    pub features: Features,
}

impl<'a> InitChunk<'a> {
    pub fn parse(value: &'a [u8]) -> Result<Self, WireError> {
        need("INIT", value, INIT_FIXED_LEN)?;
        let (mut fixed, params) = value.split_at(INIT_FIXED_LEN);
        let mut init = Self {
            init_tag: fixed.get_u32(),
            a_rwnd: fixed.get_u32(),
            outbound_streams: fixed.get_u16(),
            inbound_streams: fixed.get_u16(),
            initial_tsn: fixed.get_u32(),
            cookie: None,
            features: Features::default(),
        };

        for tlv in Tlvs::new(params) {
            let tlv = tlv?;
            match tlv.kind {
                param::STATE_COOKIE => init.cookie = Some(tlv.value),
                param::SUPPORTED_EXTENSIONS => {
                    init.features = Features::from_extension_list(tlv.value)
                }
                _ => {}
            }
        }
        Ok(init)
    }

    /// Encodes the chunk value (fixed part plus parameters).
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(INIT_FIXED_LEN + 64);
        buf.put_u32(self.init_tag);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.outbound_streams);
        buf.put_u16(self.inbound_streams);
        buf.put_u32(self.initial_tsn);
        if let Some(cookie) = self.cookie {
            put_tlv(&mut buf, param::STATE_COOKIE, cookie);
        }
        let extensions = self.features.extension_list();
        if !extensions.is_empty() {
            put_tlv(&mut buf, param::SUPPORTED_EXTENSIONS, &extensions);
        }
        buf.to_vec()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChunk<'a> {
    pub flags: u8,
    pub tsn: u32,
    pub stream: u16,
    pub ssn: u16,
    pub ppid: u32,
    pub payload: &'a [u8],
}

impl<'a> DataChunk<'a> {
    pub fn parse(flags: u8, value: &'a [u8]) -> Result<Self, WireError> {
        need("DATA", value, DATA_FIXED_LEN)?;
        let (mut fixed, payload) = value.split_at(DATA_FIXED_LEN);
        Ok(Self {
            flags,
            tsn: fixed.get_u32(),
            stream: fixed.get_u16(),
            ssn: fixed.get_u16(),
            ppid: fixed.get_u32(),
            payload,
        })
    }

    pub fn begins(&self) -> bool {
        self.flags & flags::DATA_BEGIN != 0
    }

    pub fn ends(&self) -> bool {
        self.flags & flags::DATA_END != 0
    }

    pub fn unordered(&self) -> bool {
        self.flags & flags::DATA_UNORDERED != 0
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(DATA_FIXED_LEN + self.payload.len());
        buf.put_u32(self.tsn);
        buf.put_u16(self.stream);
        buf.put_u16(self.ssn);
        buf.put_u32(self.ppid);
        buf.put_slice(self.payload);
        buf.to_vec()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    pub cum_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gaps: Vec<(u16, u16)>,
    pub dups: Vec<u32>,
}

impl SackChunk {
    pub fn parse(value: &[u8]) -> Result<Self, WireError> {
        need("SACK", value, SACK_FIXED_LEN)?;
        let (mut fixed, mut rest) = value.split_at(SACK_FIXED_LEN);
        let cum_tsn_ack = fixed.get_u32();
        let a_rwnd = fixed.get_u32();
        let num_gaps = fixed.get_u16() as usize;
        let num_dups = fixed.get_u16() as usize;

        let wanted = num_gaps * 4 + num_dups * 4;
        if rest.len() < wanted {
            return Err(WireError::Truncated {
                what: "SACK blocks",
                need: wanted,
                have: rest.len(),
            });
        }

        let gaps = (0..num_gaps)
            .map(|_| (rest.get_u16(), rest.get_u16()))
            .collect();
        let dups = (0..num_dups).map(|_| rest.get_u32()).collect();
        Ok(Self {
            cum_tsn_ack,
            a_rwnd,
            gaps,
            dups,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(SACK_FIXED_LEN + 4 * (self.gaps.len() + self.dups.len()));
        buf.put_u32(self.cum_tsn_ack);
        buf.put_u32(self.a_rwnd);
        buf.put_u16(self.gaps.len() as u16);
        buf.put_u16(self.dups.len() as u16);
        for (start, end) in &self.gaps {
            buf.put_u16(*start);
            buf.put_u16(*end);
        }
        for dup in &self.dups {
            buf.put_u32(*dup);
        }
        buf.to_vec()
    }
}

/// Appends a TLV with padding.
pub fn put_tlv(buf: &mut BytesMut, kind: u16, value: &[u8]) {
    let len = 4 + value.len();
    buf.put_u16(kind);
    buf.put_u16(len as u16);
    buf.put_slice(value);
    buf.put_bytes(0, padded(len) - len);
}

/// Single error cause as used in ABORT and ERROR chunks.
pub fn error_cause(code: u16, info: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(4 + info.len() + 3);
    put_tlv(&mut buf, code, info);
    buf.to_vec()
}

/// Assembles one outbound packet.
#[derive(Debug)]
pub struct PacketBuilder {
    buf: BytesMut,
    chunks: usize,
}

impl PacketBuilder {
    pub fn new(header: CommonHeader) -> Self {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + 64);
        header.put(&mut buf);
        Self { buf, chunks: 0 }
    }

    pub fn chunk(mut self, kind: u8, flags: u8, value: &[u8]) -> Self {
        self.push(kind, flags, value);
        self
    }

    pub fn push(&mut self, kind: u8, flags: u8, value: &[u8]) {
        let len = CHUNK_HEADER_LEN + value.len();
        self.buf.put_u8(kind);
        self.buf.put_u8(flags);
        self.buf.put_u16(len as u16);
        self.buf.put_slice(value);
        self.buf.put_bytes(0, padded(len) - len);
        self.chunks += 1;
    }

    pub fn is_empty(&self) -> bool {
        self.chunks == 0
    }

    pub fn finish(self) -> BytesMut {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_header_layout() {
        let pkt = PacketBuilder::new(CommonHeader::new(5000, 5001, 0xdeadbeef))
            .chunk(chunk::COOKIE_ACK, 0, &[])
            .finish();

        assert_eq!(
            &pkt[..12],
            &[0x13, 0x88, 0x13, 0x89, 0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0]
        );
        let (header, area) = CommonHeader::parse(&pkt).unwrap();
        assert_eq!(header, CommonHeader::new(5000, 5001, 0xdeadbeef));
        assert_eq!(area, &[chunk::COOKIE_ACK, 0, 0, 4]);
    }

    #[test]
    fn test_short_packet_is_truncated() {
        let err = CommonHeader::parse(&[0u8; 11]).unwrap_err();
        assert_eq!(
            err,
            WireError::Truncated {
                what: "common header",
                need: 12,
                have: 11
            }
        );
    }

    #[test]
    fn test_chunks_skip_padding() {
        let pkt = PacketBuilder::new(CommonHeader::new(1, 2, 3))
            .chunk(chunk::HEARTBEAT, 0, &[1, 2, 3, 4, 5])
            .chunk(chunk::COOKIE_ACK, 0, &[])
            .finish();
        let (_, area) = CommonHeader::parse(&pkt).unwrap();

        let chunks: Vec<_> = Chunks::new(area).collect::<Result<_, _>>().unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].value, &[1, 2, 3, 4, 5]);
        assert_eq!(chunks[1].kind, chunk::COOKIE_ACK);
    }

    #[test]
    fn test_chunk_length_beyond_packet_stops_iteration() {
        // 'S' 'C' then length "TP" = 0x5450
        let area = b"SCTPSCTP";
        let mut chunks = Chunks::new(area);
        assert_eq!(
            chunks.next(),
            Some(Err(WireError::BadLength {
                what: "chunk",
                len: 0x5450
            }))
        );
        assert_eq!(chunks.next(), None);
    }

    #[test]
    fn test_chunk_length_below_header_is_rejected() {
        let mut chunks = Chunks::new(&[0, 0, 0, 2, 0, 0, 0, 0]);
        assert!(matches!(chunks.next(), Some(Err(WireError::BadLength { len: 2, .. }))));
    }

    #[test]
    fn test_init_with_cookie_and_extensions() {
        let cookie = [9u8; 7];
        let init = InitChunk {
            init_tag: 42,
            a_rwnd: 65536,
            outbound_streams: 10,
            inbound_streams: 12,
            initial_tsn: 1000,
            cookie: Some(&cookie),
            features: Features {
                i_data: true,
                re_config: false,
            },
        };
        let value = init.encode();
        assert_eq!(value.len() % 4, 0);
        assert_eq!(InitChunk::parse(&value).unwrap(), init);
    }

    #[test]
    fn test_init_with_broken_parameter_fails() {
        let mut value = vec![0u8; INIT_FIXED_LEN];
        value.extend_from_slice(&[0, 7, 0, 200]);
        assert!(InitChunk::parse(&value).is_err());
    }

    #[test]
    fn test_sack_block_counts_are_bounded_by_length() {
        let mut value = vec![0u8; 8];
        value.extend_from_slice(&[0xff, 0xff, 0xff, 0xff]);
        let err = SackChunk::parse(&value).unwrap_err();
        assert!(matches!(err, WireError::Truncated { what: "SACK blocks", .. }));
    }

    #[test]
    fn test_sack_with_blocks() {
        let sack = SackChunk {
            cum_tsn_ack: 7,
            a_rwnd: 1024,
            gaps: vec![(2, 3), (5, 5)],
            dups: vec![6],
        };
        assert_eq!(SackChunk::parse(&sack.encode()).unwrap(), sack);
    }

    #[test]
    fn test_data_flags() {
        let data = DataChunk {
            flags: flags::DATA_BEGIN | flags::DATA_END,
            tsn: 1,
            stream: 0,
            ssn: 0,
            ppid: 51,
            payload: b"hi",
        };
        let encoded = data.encode();
        let parsed = DataChunk::parse(data.flags, &encoded).unwrap();
        assert!(parsed.begins() && parsed.ends() && !parsed.unordered());
        assert_eq!(parsed.payload, b"hi");
    }

    #[test]
    fn test_tsn_serial_arithmetic_wraps() {
        assert!(tsn_lt(u32::MAX, 0));
        assert!(tsn_lt(5, 6));
        assert!(!tsn_lt(6, 5));
        assert!(tsn_le(5, 5));
        assert!(!tsn_lt(0, u32::MAX));
    }

    #[test]
    fn test_features_bits() {
        let f = Features {
            i_data: false,
            re_config: true,
        };
        assert_eq!(Features::from_bits(f.to_bits()), f);
        assert_eq!(Features::from_extension_list(&f.extension_list()), f);
    }
}
