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

//! Harness Context.
//!
//! Everything one initialized harness owns on the network side: the two
//! channel endpoints, the capturing outbound sink shared with the engine, and
//! the relay tasks feeding the engine.

use std::sync::Arc;

use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::harness_core::errors::HarnessError;
use crate::harness_core::traits::InboundSource;
use crate::harness_core::types::Side;
use crate::net::capture::{CaptureSink, HeaderSlots};
use crate::net::channel::{self, ChannelEndpoint};
use crate::net::relay;

pub struct HarnessContext {
    client: ChannelEndpoint,
    server: ChannelEndpoint,
    sink: Arc<CaptureSink>,
    relays: Vec<JoinHandle<()>>,
}

impl HarnessContext {
    /// Opens the virtual channel, routes `sink` over it and starts one relay
    /// loop per endpoint delivering into `inbound`.
    pub fn open(
        runtime: &Runtime,
        sink: Arc<CaptureSink>,
        inbound: Arc<dyn InboundSource>,
    ) -> Result<Self, HarnessError> {
        let (client, server) = runtime.block_on(channel::open_channel())?;

        sink.attach(client.clone());
        sink.attach(server.clone());

        let relays = vec![
            relay::spawn(runtime.handle(), client.clone(), inbound.clone()),
            relay::spawn(runtime.handle(), server.clone(), inbound),
        ];

        Ok(Self {
            client,
            server,
            sink,
            relays,
        })
    }

    pub fn endpoint(&self, side: Side) -> &ChannelEndpoint {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    pub fn headers(&self) -> &HeaderSlots {
        self.sink.headers()
    }

    pub fn sink(&self) -> &Arc<CaptureSink> {
        &self.sink
    }
}

impl Drop for HarnessContext {
    fn drop(&mut self) {
        for relay in &self.relays {
            relay.abort();
        }
        self.sink.detach_all();
        debug!(
            "Harness context closed ({} <-> {})",
            self.client.id(),
            self.server.id()
        );
    }
}
