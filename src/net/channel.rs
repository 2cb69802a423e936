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

//! Virtual Channel.
//!
//! Two loopback UDP sockets, each connected to the other, standing in for the
//! network path between the client and server engine instances.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::UdpSocket;
use tracing::debug;

use crate::harness_core::errors::HarnessError;
use crate::harness_core::types::{EndpointId, Side};

// Endpoint identities stay unique for the whole process so a stale packet
// from a torn-down channel can never be attributed to a new one.
static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One side of the virtual link.
#[derive(Debug, Clone)]
pub struct ChannelEndpoint {
    id: EndpointId,
    side: Side,
    socket: Arc<UdpSocket>,
    sender: Arc<std::net::UdpSocket>,
    local: SocketAddr,
    peer: SocketAddr,
}

impl ChannelEndpoint {
    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn socket(&self) -> &Arc<UdpSocket> {
        &self.socket
    }

    /// Sends to the connected peer from any thread.
    ///
    /// Goes straight to the kernel through the std handle, bypassing tokio's
    /// write readiness, so a freshly opened endpoint can transmit before the
    /// reactor has polled it.
    pub fn send(&self, packet: &[u8]) -> io::Result<usize> {
        self.sender.send(packet)
    }
}

fn bind_loopback() -> Result<(std::net::UdpSocket, SocketAddr), HarnessError> {
    let socket = std::net::UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
        .map_err(|e| HarnessError::Channel(format!("bind: {}", e)))?;
    let local = socket
        .local_addr()
        .map_err(|e| HarnessError::Channel(format!("getsockname: {}", e)))?;
    Ok((socket, local))
}

// The tokio handle shares the descriptor with the std handle; both end up
// non-blocking, which for a loopback datagram only matters when the send
// buffer is full.
fn endpoint(
    side: Side,
    sender: std::net::UdpSocket,
    local: SocketAddr,
    peer: SocketAddr,
) -> Result<ChannelEndpoint, HarnessError> {
    let receiver = sender
        .try_clone()
        .and_then(|clone| {
            clone.set_nonblocking(true)?;
            UdpSocket::from_std(clone)
        })
        .map_err(|e| HarnessError::Channel(format!("register {}: {}", side, e)))?;

    Ok(ChannelEndpoint {
        id: EndpointId::from_raw(NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed)),
        side,
        socket: Arc::new(receiver),
        sender: Arc::new(sender),
        local,
        peer,
    })
}

/// Opens the client/server endpoint pair.
///
/// Must run inside a Tokio runtime; the sockets stay registered with it.
pub async fn open_channel() -> Result<(ChannelEndpoint, ChannelEndpoint), HarnessError> {
    let (client, client_addr) = bind_loopback()?;
    let (server, server_addr) = bind_loopback()?;

    client
        .connect(server_addr)
        .map_err(|e| HarnessError::Channel(format!("connect client: {}", e)))?;
    server
        .connect(client_addr)
        .map_err(|e| HarnessError::Channel(format!("connect server: {}", e)))?;

    let client = endpoint(Side::Client, client, client_addr, server_addr)?;
    let server = endpoint(Side::Server, server, server_addr, client_addr)?;

    debug!(
        "Virtual channel open: {} {} <-> {} {}",
        client.id, client_addr, server.id, server_addr
    );
    Ok((client, server))
}
