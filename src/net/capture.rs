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

//! Header Capture.
//!
//! The outbound hook registered with the engine. Every packet the engine emits
//! passes through `CaptureSink::output`, which records its leading header in
//! the slot of the sending side and then writes the untouched packet to the
//! endpoint's connected socket.
//!
//! Each slot is a single-value mailbox: writers replace the whole header under
//! the slot's lock and readers take a copy, so a reader never observes a
//! header assembled from two different packets.

use std::collections::HashMap;
use std::io;
use std::sync::{Mutex, RwLock};

use tracing::trace;

use crate::harness_core::constants::wire::HEADER_LEN;
use crate::harness_core::traits::OutboundSink;
use crate::harness_core::types::{EndpointId, Side};
use crate::net::channel::ChannelEndpoint;

pub type Header = [u8; HEADER_LEN];

/// The two captured-header mailboxes, one per sending side.
#[derive(Debug, Default)]
pub struct HeaderSlots {
    client: Mutex<Option<Header>>,
    server: Mutex<Option<Header>>,
}

impl HeaderSlots {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, side: Side) -> &Mutex<Option<Header>> {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    /// Records the header of `packet` as sent by `side`.
    ///
    /// Packets shorter than a header leave the slot unchanged.
    pub fn record(&self, side: Side, packet: &[u8]) {
        let Some(prefix) = packet.get(..HEADER_LEN) else {
            trace!("Not capturing {}-byte packet from {}", packet.len(), side);
            return;
        };
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(prefix);
        trace!("Captured {} header {}", side, hex::encode(header));
        *self.slot(side).lock().unwrap_or_else(|e| e.into_inner()) = Some(header);
    }

    /// Copy of the most recent header sent by `side`.
    pub fn snapshot(&self, side: Side) -> Option<Header> {
        *self.slot(side).lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_populated(&self) -> bool {
        self.snapshot(Side::Client).is_some() && self.snapshot(Side::Server).is_some()
    }
}

/// `OutboundSink` that captures headers and forwards to the virtual channel.
#[derive(Debug, Default)]
pub struct CaptureSink {
    headers: HeaderSlots,
    routes: RwLock<HashMap<EndpointId, ChannelEndpoint>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `endpoint` a valid source for outbound packets.
    pub fn attach(&self, endpoint: ChannelEndpoint) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(endpoint.id(), endpoint);
    }

    pub fn detach_all(&self) {
        self.routes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn headers(&self) -> &HeaderSlots {
        &self.headers
    }
}

impl OutboundSink for CaptureSink {
    fn output(&self, endpoint: EndpointId, packet: &[u8]) -> io::Result<()> {
        let routes = self.routes.read().unwrap_or_else(|e| e.into_inner());
        let route = routes.get(&endpoint).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no channel endpoint for {}", endpoint),
            )
        })?;

        self.headers.record(route.side(), packet);
        route.send(packet).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::channel::open_channel;

    fn packet(tag: u8, len: usize) -> Vec<u8> {
        (0..len).map(|i| tag.wrapping_add(i as u8)).collect()
    }

    #[test]
    fn test_slots_start_empty() {
        let slots = HeaderSlots::new();
        assert!(slots.snapshot(Side::Client).is_none());
        assert!(slots.snapshot(Side::Server).is_none());
        assert!(!slots.is_populated());
    }

    #[test]
    fn test_record_keeps_most_recent_header_per_side() {
        let slots = HeaderSlots::new();
        slots.record(Side::Client, &packet(1, 40));
        slots.record(Side::Server, &packet(100, 20));
        slots.record(Side::Client, &packet(50, 12));

        assert_eq!(slots.snapshot(Side::Client).unwrap().to_vec(), packet(50, 12));
        assert_eq!(slots.snapshot(Side::Server).unwrap().to_vec(), packet(100, 12));
        assert!(slots.is_populated());
    }

    #[test]
    fn test_short_packet_does_not_clobber_slot() {
        let slots = HeaderSlots::new();
        slots.record(Side::Server, &packet(7, 16));
        slots.record(Side::Server, &packet(9, 11));
        assert_eq!(slots.snapshot(Side::Server).unwrap().to_vec(), packet(7, 12));
    }

    #[tokio::test]
    async fn test_sink_captures_and_forwards_unchanged() {
        let (client, server) = open_channel().await.unwrap();
        let sink = CaptureSink::new();
        sink.attach(client.clone());
        sink.attach(server.clone());

        let pkt = packet(3, 64);
        sink.output(client.id(), &pkt).unwrap();

        let mut buf = [0u8; 128];
        let n = server.socket().recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], pkt.as_slice());
        assert_eq!(sink.headers().snapshot(Side::Client).unwrap().to_vec(), packet(3, 12));
        assert!(sink.headers().snapshot(Side::Server).is_none());
    }

    #[test]
    fn test_unknown_endpoint_is_not_connected() {
        let sink = CaptureSink::new();
        let err = sink
            .output(EndpointId::from_raw(u64::MAX), &packet(0, 12))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
