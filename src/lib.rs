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

//! sctp-conn-fuzz: connection-level fuzz harness for a user-space SCTP engine.
//!
//! The harness wires two engine endpoints together over a pair of loopback UDP
//! sockets, drives them to an established association, remembers the common
//! header of the last packet each side sent, and then feeds arbitrary bytes
//! behind such a header straight into the engine's inbound path.

pub mod config;
pub mod harness;
pub mod harness_core;
pub mod loopback;
pub mod net;

pub use config::HarnessConfig;
pub use harness::{Harness, Phase};
pub use harness_core::errors::{EngineError, HarnessError};
pub use harness_core::types::Side;
pub use loopback::{LoopbackConfig, LoopbackEngine};
