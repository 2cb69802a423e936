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

//! Fuzz Injection.
//!
//! Wraps the fuzz input in the header most recently sent *towards* the target
//! and feeds it straight into the engine's inbound entry point, as if the peer
//! had sent it. The virtual channel and the relay loops are not involved.
//!
//! The header is replayed as captured; nothing in it is refreshed to match
//! the association's current state.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::harness_core::constants::wire::HEADER_LEN;
use crate::harness_core::errors::HarnessError;
use crate::harness_core::traits::InboundSource;
use crate::harness_core::types::{EndpointId, Side};
use crate::net::capture::{Header, HeaderSlots};

/// Header followed by the raw input.
pub fn build_packet(header: &Header, input: &[u8]) -> BytesMut {
    let mut pkt = BytesMut::with_capacity(HEADER_LEN + input.len());
    pkt.put_slice(header);
    pkt.put_slice(input);
    pkt
}

/// Delivers `input` to the engine instance behind `target` (playing `target_side`).
///
/// Returns the number of bytes handed to the engine. Engine faults while
/// parsing are not intercepted.
pub fn inject(
    inbound: &dyn InboundSource,
    headers: &HeaderSlots,
    target: EndpointId,
    target_side: Side,
    input: &[u8],
) -> Result<usize, HarnessError> {
    let source = target_side.peer();
    let header = headers
        .snapshot(source)
        .ok_or(HarnessError::HeaderNotCaptured(source))?;

    let pkt = build_packet(&header, input);
    trace!(
        "Injecting {} bytes into {} {} (header {})",
        pkt.len(),
        target_side,
        target,
        hex::encode(header)
    );
    inbound.conn_input(target, &pkt);
    Ok(pkt.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        packets: Mutex<Vec<(EndpointId, Vec<u8>)>>,
    }

    impl InboundSource for Recorder {
        fn conn_input(&self, endpoint: EndpointId, packet: &[u8]) {
            self.packets
                .lock()
                .unwrap()
                .push((endpoint, packet.to_vec()));
        }
    }

    #[test]
    fn test_uses_header_from_opposite_side() {
        let headers = HeaderSlots::new();
        headers.record(Side::Client, &[0xC1; 12]);
        headers.record(Side::Server, &[0x5E; 12]);
        let recorder = Recorder::default();
        let target = EndpointId::from_raw(9);

        let len = inject(&recorder, &headers, target, Side::Server, b"abc").unwrap();

        assert_eq!(len, 15);
        let packets = recorder.packets.lock().unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].0, target);
        assert_eq!(&packets[0].1[..12], &[0xC1; 12]);
        assert_eq!(&packets[0].1[12..], b"abc");
    }

    #[test]
    fn test_empty_input_delivers_header_only() {
        let headers = HeaderSlots::new();
        headers.record(Side::Server, &[7; 30]);
        let recorder = Recorder::default();

        let len = inject(&recorder, &headers, EndpointId::from_raw(1), Side::Client, &[]).unwrap();

        assert_eq!(len, HEADER_LEN);
        assert_eq!(recorder.packets.lock().unwrap()[0].1, vec![7; 12]);
    }

    #[test]
    fn test_missing_header_is_reported() {
        let headers = HeaderSlots::new();
        headers.record(Side::Server, &[1; 12]);
        let recorder = Recorder::default();

        let err = inject(&recorder, &headers, EndpointId::from_raw(1), Side::Server, b"x").unwrap_err();

        assert!(matches!(err, HarnessError::HeaderNotCaptured(Side::Client)));
        assert!(recorder.packets.lock().unwrap().is_empty());
    }
}
