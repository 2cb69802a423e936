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

//! Harness constants - Single source of truth for all configuration values.
//!
//! This module centralizes the wire sizes, port ranges, timeouts and
//! environment variable names used across the harness and the bundled engine.

/// Wire-level sizes
pub mod wire {
    /// Length of the common header captured from every outbound packet
    pub const HEADER_LEN: usize = 12;
    /// Largest datagram the relay loops will receive (larger ones are truncated)
    pub const MAX_PACKET_SIZE: usize = 1 << 16;
}

/// Virtual port rotation
pub mod ports {
    /// Ports rotate through 1..=PORT_MODULUS
    pub const PORT_MODULUS: u16 = 32768;
    /// Rotation counter starting state (first bootstrap binds port 2)
    pub const INITIAL_PORT: u16 = 1;
    /// Listener backlog used by the bootstrap
    pub const LISTEN_BACKLOG: u32 = 1;
}

/// Fuzz input defaults
pub mod fuzz {
    /// Payload injected when no input file is given
    pub const DEFAULT_INPUT: &[u8] = b"SCTPSCTPSCTPSCTPSCTPSCTPSCTP!!!!\0";
    /// PPID of the priming message sent when explicit EOR is enabled.
    ///
    /// The priming message is empty, so an engine that drops empty sends
    /// puts nothing on the wire; only the call itself is made.
    pub const EXPLICIT_EOR_PPID: u32 = 1207;
    /// Fragment interleave level requested in interleaving mode
    pub const FRAGMENT_INTERLEAVE_LEVEL: u32 = 2;
}

/// Timeouts
pub mod timeouts {
    /// Upper bound for the teardown loop waiting on `finish()`
    pub const DEFAULT_FINISH_TIMEOUT_MS: u64 = 5_000;
    /// Poll interval between two `finish()` attempts
    pub const FINISH_POLL_INTERVAL_MS: u64 = 1;
    /// How long blocking connect/accept wait for the handshake
    pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
    /// Grace period before a closing socket without peer answer is reaped
    pub const DEFAULT_SHUTDOWN_GUARD_MS: u64 = 500;
}

/// Configuration Environment Variables
pub mod config {
    pub const ENV_REUSE_ASSOCIATION: &str = "SCTP_FUZZ_REUSE_ASSOCIATION";
    pub const ENV_EXPLICIT_EOR: &str = "SCTP_FUZZ_EXPLICIT_EOR";
    pub const ENV_INTERLEAVING: &str = "SCTP_FUZZ_INTERLEAVING";
    pub const ENV_STREAM_RESET: &str = "SCTP_FUZZ_STREAM_RESET";
    pub const ENV_FINISH_TIMEOUT_MS: &str = "SCTP_FUZZ_FINISH_TIMEOUT_MS";
    pub const ENV_LOG_LEVEL: &str = "LOG_LEVEL";
    pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";
}
