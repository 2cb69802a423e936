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

//! Association Bootstrap.
//!
//! Drives the engine from nothing to one established client/server
//! association over an already open harness context.

use std::sync::Arc;

use tracing::{debug, info};

use crate::config::HarnessConfig;
use crate::harness::context::HarnessContext;
use crate::harness_core::constants::{fuzz, ports};
use crate::harness_core::errors::HarnessError;
use crate::harness_core::traits::{ProtocolEngine, ReceiveHandler};
use crate::harness_core::types::{SendInfo, Side, SocketId, SocketOption, VirtualAddr};

/// Rotating virtual port counter, 1..=32768.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRotor {
    port: u16,
}

impl PortRotor {
    pub fn new(start: u16) -> Self {
        Self { port: start }
    }

    pub fn current(&self) -> u16 {
        self.port
    }

    pub fn advance(&mut self) -> u16 {
        self.port = (self.port % ports::PORT_MODULUS) + 1;
        self.port
    }
}

impl Default for PortRotor {
    fn default() -> Self {
        Self::new(ports::INITIAL_PORT)
    }
}

/// The two established sockets produced by a bootstrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    pub client: SocketId,
    pub server: SocketId,
    pub port: u16,
}

impl Association {
    pub fn socket(&self, side: Side) -> SocketId {
        match side {
            Side::Client => self.client,
            Side::Server => self.server,
        }
    }
}

fn socket_options(config: &HarnessConfig) -> Vec<SocketOption> {
    let mut options = Vec::new();
    if config.explicit_eor {
        options.push(SocketOption::ExplicitEor(true));
    }
    if config.stream_reset {
        options.push(SocketOption::StreamReset {
            reset_streams: true,
            change_assoc: true,
        });
    }
    if config.interleaving {
        options.push(SocketOption::FragmentInterleave(
            fuzz::FRAGMENT_INTERLEAVE_LEVEL,
        ));
        options.push(SocketOption::InterleavingSupported(true));
    }
    options
}

/// Runs the bootstrap sequence on `port`. Any failing step aborts the sequence.
pub fn establish<E: ProtocolEngine + ?Sized>(
    engine: &E,
    context: &HarnessContext,
    port: u16,
    config: &HarnessConfig,
    handler: Arc<dyn ReceiveHandler>,
) -> Result<Association, HarnessError> {
    let client_ep = context.endpoint(Side::Client).id();
    let server_ep = context.endpoint(Side::Server).id();

    let client = engine
        .socket(handler.clone())
        .map_err(HarnessError::bootstrap("socket client"))?;
    let listener = engine
        .socket(handler)
        .map_err(HarnessError::bootstrap("socket listener"))?;

    for option in socket_options(config) {
        engine
            .set_option(client, option)
            .map_err(HarnessError::bootstrap("setsockopt client"))?;
        engine
            .set_option(listener, option)
            .map_err(HarnessError::bootstrap("setsockopt listener"))?;
    }

    engine
        .bind(client, VirtualAddr::new(client_ep, port))
        .map_err(HarnessError::bootstrap("bind client"))?;
    let listen_addr = VirtualAddr::new(server_ep, port);
    engine
        .bind(listener, listen_addr)
        .map_err(HarnessError::bootstrap("bind listener"))?;

    engine
        .listen(listener, ports::LISTEN_BACKLOG)
        .map_err(HarnessError::bootstrap("listen"))?;

    engine
        .connect(client, listen_addr)
        .map_err(HarnessError::bootstrap("connect"))?;

    let server = engine
        .accept(listener)
        .map_err(HarnessError::bootstrap("accept"))?;

    engine
        .close(listener)
        .map_err(HarnessError::bootstrap("close listener"))?;

    if config.explicit_eor {
        let info = SendInfo {
            ppid: fuzz::EXPLICIT_EOR_PPID,
            ..SendInfo::default()
        };
        engine
            .send(client, &[], info)
            .map_err(HarnessError::bootstrap("send"))?;
    }

    for side in [Side::Client, Side::Server] {
        if context.headers().snapshot(side).is_none() {
            return Err(HarnessError::HeaderNotCaptured(side));
        }
    }

    debug!("Association on port {}: client {} server {}", port, client, server);
    info!("Association established on virtual port {}", port);
    Ok(Association {
        client,
        server,
        port,
    })
}
