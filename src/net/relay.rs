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

//! Relay Loop.
//!
//! One task per channel endpoint: receive a datagram, hand it to the engine's
//! inbound entry point tagged with the endpoint identity, repeat forever.

use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::harness_core::constants::wire::MAX_PACKET_SIZE;
use crate::harness_core::traits::InboundSource;
use crate::net::channel::ChannelEndpoint;

/// Runs until the task is aborted. Receive errors are ignored.
pub async fn run(endpoint: ChannelEndpoint, inbound: Arc<dyn InboundSource>) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    let id = endpoint.id();

    loop {
        match endpoint.socket().recv(&mut buf).await {
            Ok(0) => {}
            Ok(len) => {
                trace!("Relay {}: {} bytes", id, len);
                inbound.conn_input(id, &buf[..len]);
            }
            Err(e) => {
                trace!("Relay {}: recv error ignored: {}", id, e);
            }
        }
    }
}

/// Starts the relay loop for `endpoint` on `runtime`.
pub fn spawn(
    runtime: &Handle,
    endpoint: ChannelEndpoint,
    inbound: Arc<dyn InboundSource>,
) -> JoinHandle<()> {
    runtime.spawn(run(endpoint, inbound))
}
