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

use std::io;
use std::sync::Arc;

use proptest::prelude::*;
use sctp_conn_fuzz::harness_core::traits::{InboundSource, OutboundSink, ProtocolEngine};
use sctp_conn_fuzz::harness_core::types::{EndpointId, Side};
use sctp_conn_fuzz::loopback::wire::{
    Chunks, CommonHeader, DataChunk, InitChunk, SackChunk, Tlvs,
};
use sctp_conn_fuzz::net::capture::HeaderSlots;
use sctp_conn_fuzz::LoopbackEngine;

struct Discard;

impl OutboundSink for Discard {
    fn output(&self, _endpoint: EndpointId, _packet: &[u8]) -> io::Result<()> {
        Ok(())
    }
}

proptest! {
    #[test]
    fn test_wire_parsers_never_panic(data in proptest::collection::vec(any::<u8>(), 0..512)) {
        if let Ok((_, area)) = CommonHeader::parse(&data) {
            for chunk in Chunks::new(area).flatten() {
                let _ = InitChunk::parse(chunk.value);
                let _ = SackChunk::parse(chunk.value);
                let _ = DataChunk::parse(chunk.flags, chunk.value);
                for _ in Tlvs::new(chunk.value) {}
            }
        }
    }

    #[test]
    fn test_engine_input_never_panics(
        packets in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..256), 1..8)
    ) {
        let engine = LoopbackEngine::default();
        engine.init(Arc::new(Discard), Arc::new(|_: &str| {})).unwrap();
        let endpoint = EndpointId::from_raw(1);
        engine.register_address(endpoint);
        for packet in &packets {
            engine.conn_input(endpoint, packet);
        }
    }

    #[test]
    fn test_capture_keeps_latest_header_per_side(
        sends in proptest::collection::vec(
            (any::<bool>(), proptest::collection::vec(any::<u8>(), 0..40)),
            0..32
        )
    ) {
        let slots = HeaderSlots::new();
        let mut client: Option<Vec<u8>> = None;
        let mut server: Option<Vec<u8>> = None;

        for (is_client, packet) in &sends {
            let side = if *is_client { Side::Client } else { Side::Server };
            slots.record(side, packet);
            if packet.len() >= 12 {
                let header = Some(packet[..12].to_vec());
                if *is_client { client = header } else { server = header }
            }
        }

        prop_assert_eq!(slots.snapshot(Side::Client).map(|h| h.to_vec()), client);
        prop_assert_eq!(slots.snapshot(Side::Server).map(|h| h.to_vec()), server);
    }
}
