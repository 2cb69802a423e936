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

//! Shared value types crossing the harness/engine boundary.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identity of one channel endpoint.
///
/// The engine uses it as the addressing key for everything it sends or
/// receives over the simulated network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u64);

impl EndpointId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep#{}", self.0)
    }
}

/// Which side of the virtual link an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    /// The side whose packets arrive at this one.
    pub fn peer(self) -> Self {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn parse_safe(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "client" | "c" => Some(Side::Client),
            "server" | "s" => Some(Side::Server),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// Address inside the simulated network: endpoint identity plus logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VirtualAddr {
    pub endpoint: EndpointId,
    pub port: u16,
}

impl VirtualAddr {
    pub fn new(endpoint: EndpointId, port: u16) -> Self {
        Self { endpoint, port }
    }
}

impl fmt::Display for VirtualAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.endpoint, self.port)
    }
}

/// Engine-level socket handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketId(pub u32);

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sock#{}", self.0)
    }
}

/// Per-message send parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendInfo {
    pub stream: u16,
    pub ppid: u32,
    pub unordered: bool,
    /// End of record. Only honoured when explicit EOR is enabled on the socket;
    /// otherwise every message is a complete record.
    pub eor: bool,
}

/// Metadata attached to a delivered message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RcvInfo {
    pub stream: u16,
    pub ssn: u16,
    pub tsn: u32,
    pub ppid: u32,
    pub unordered: bool,
}

/// What the engine hands to the upper layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery<'a> {
    Data { data: &'a [u8], info: RcvInfo },
    /// The association behind this socket is gone (abort or peer shutdown).
    Closed,
}

/// Upper-layer answer to a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveAction {
    Keep,
    Close,
}

/// Socket options the harness may toggle before bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOption {
    ExplicitEor(bool),
    FragmentInterleave(u32),
    InterleavingSupported(bool),
    StreamReset { reset_streams: bool, change_assoc: bool },
}
