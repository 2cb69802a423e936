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

//! Bundled loopback protocol engine.
//!
//! A compact SCTP-style engine (four-way cookie handshake, DATA/SACK with
//! fragmentation, graceful shutdown and ABORT) used by the binary and the
//! fuzz targets. The checksum field is written as zero and never verified,
//! as with checksum offload on a real stack.

pub mod cookie;
pub mod engine;
pub mod wire;

use std::time::Duration;

use crate::harness_core::constants::timeouts;

pub use engine::LoopbackEngine;

/// Engine limits
pub mod limits {
    pub const OUTBOUND_STREAMS: u16 = 10;
    pub const INBOUND_STREAMS: u16 = 10;
    pub const A_RWND: u32 = 128 * 1024;
    /// Largest DATA payload put in a single chunk
    pub const MAX_FRAGMENT: usize = 1200;
    pub const MAX_MESSAGE: usize = 256 * 1024;
    pub const MAX_REASSEMBLY: usize = 256 * 1024;
    /// TSNs further than this ahead of the cumulative ack are dropped
    pub const TSN_WINDOW: u32 = 4096;
    pub const MAX_REPORTED_DUPS: usize = 16;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Bound on blocking connect/accept
    pub handshake_timeout: Duration,
    /// Closing sockets older than this are aborted by `finish()`
    pub shutdown_guard: Duration,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_millis(timeouts::DEFAULT_HANDSHAKE_TIMEOUT_MS),
            shutdown_guard: Duration::from_millis(timeouts::DEFAULT_SHUTDOWN_GUARD_MS),
        }
    }
}
