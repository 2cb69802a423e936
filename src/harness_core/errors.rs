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

// Domain error types for the harness and the engine boundary

use crate::harness_core::types::{Side, SocketId, VirtualAddr};
use thiserror::Error;

/// Errors reported by a protocol engine operation.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Engine runtime not initialized")]
    NotInitialized,

    #[error("Engine runtime already initialized")]
    AlreadyInitialized,

    #[error("Unknown socket {0}")]
    UnknownSocket(SocketId),

    /// Operation not valid for the socket's current state
    #[error("Socket {socket} is in state {state}")]
    InvalidState {
        socket: SocketId,
        state: &'static str,
    },

    #[error("Address {0} already in use")]
    AddressInUse(VirtualAddr),

    #[error("Socket is not listening")]
    NotListening,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Returned by `finish()` while sockets remain open
    #[error("{0} sockets outstanding")]
    SocketsOutstanding(usize),

    #[error("Transmit failed: {0}")]
    Transmit(#[from] std::io::Error),

    #[error("Message of {0} bytes exceeds the send limit")]
    MessageTooLarge(usize),

    #[error("Stream {0} is not negotiated on this association")]
    InvalidStream(u16),
}

/// Main error type for the harness.
#[derive(Error, Debug)]
pub enum HarnessError {
    /// I/O Error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Virtual channel setup error
    #[error("Channel error: {0}")]
    Channel(String),

    /// A bootstrap step failed; always fatal to the run
    #[error("Bootstrap step '{step}' failed: {source}")]
    Bootstrap {
        step: &'static str,
        #[source]
        source: EngineError,
    },

    /// Injection requested before the peer emitted any packet
    #[error("No header captured yet for the {0} side")]
    HeaderNotCaptured(Side),

    /// Engine error outside of bootstrap
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    /// Teardown did not converge
    #[error("Teardown error: {0}")]
    Teardown(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl HarnessError {
    /// Wraps an engine error with the name of the bootstrap step it broke.
    pub fn bootstrap(step: &'static str) -> impl FnOnce(EngineError) -> Self {
        move |source| HarnessError::Bootstrap { step, source }
    }

    /// True for environment/setup failures the binary must abort on.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::Io(_)
                | HarnessError::Channel(_)
                | HarnessError::Bootstrap { .. }
                | HarnessError::HeaderNotCaptured(_)
        )
    }
}
