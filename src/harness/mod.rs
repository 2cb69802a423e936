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

//! Fuzz iteration driver.
//!
//! `Harness` owns the engine handle, the relay runtime and (once initialized)
//! the `HarnessContext`. One iteration walks
//! `Uninitialized -> Bootstrapped -> Injected -> (Closed | Bootstrapped)`;
//! the last step depends on `HarnessConfig::reuse_association`.

pub mod bootstrap;
pub mod context;
pub mod inject;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace, warn};

use crate::config::HarnessConfig;
use crate::harness::bootstrap::{Association, PortRotor};
use crate::harness::context::HarnessContext;
use crate::harness_core::constants::timeouts;
use crate::harness_core::errors::{EngineError, HarnessError};
use crate::harness_core::traits::{DebugSink, InboundSource, ProtocolEngine, ReceiveHandler};
use crate::harness_core::types::{Delivery, ReceiveAction, Side, SocketId};
use crate::net::capture::CaptureSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    Bootstrapped,
    Injected,
    Closed,
}

/// Application side of every engine socket the harness creates.
///
/// Data is dropped; a close notification asks the engine to close the socket.
#[derive(Debug, Default)]
pub struct DiscardReceiver;

impl ReceiveHandler for DiscardReceiver {
    fn on_receive(&self, socket: SocketId, delivery: Delivery<'_>) -> ReceiveAction {
        match delivery {
            Delivery::Data { data, info } => {
                trace!(
                    "Message of length {} received on {} stream {} ssn {} tsn {} ppid {}",
                    data.len(),
                    socket,
                    info.stream,
                    info.ssn,
                    info.tsn,
                    info.ppid
                );
                ReceiveAction::Keep
            }
            Delivery::Closed => {
                debug!("Association on {} closed, closing socket", socket);
                ReceiveAction::Close
            }
        }
    }
}

fn engine_debug_sink() -> DebugSink {
    Arc::new(|line: &str| debug!(target: "engine", "{}", line.trim_end()))
}

pub struct Harness<E: ProtocolEngine> {
    engine: Arc<E>,
    config: HarnessConfig,
    // Dropped before the runtime so relay tasks are aborted on a live reactor.
    context: Option<HarnessContext>,
    runtime: Runtime,
    ports: PortRotor,
    association: Option<Association>,
    receiver: Arc<dyn ReceiveHandler>,
    phase: Phase,
}

impl<E: ProtocolEngine> Harness<E> {
    pub fn new(engine: Arc<E>, config: HarnessConfig) -> Result<Self, HarnessError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("relay")
            .enable_all()
            .build()?;

        Ok(Self {
            engine,
            config,
            context: None,
            runtime,
            ports: PortRotor::default(),
            association: None,
            receiver: Arc::new(DiscardReceiver),
            phase: Phase::Uninitialized,
        })
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn context(&self) -> Option<&HarnessContext> {
        self.context.as_ref()
    }

    pub fn association(&self) -> Option<Association> {
        self.association
    }

    /// One-time engine runtime and network setup; a no-op once done.
    pub fn ensure_initialized(&mut self) -> Result<&HarnessContext, HarnessError> {
        if self.context.is_none() {
            let sink = Arc::new(CaptureSink::new());
            self.engine
                .init(sink.clone(), engine_debug_sink())
                .map_err(HarnessError::bootstrap("init"))?;

            let inbound: Arc<dyn InboundSource> = self.engine.clone();
            let context = match HarnessContext::open(&self.runtime, sink, inbound) {
                Ok(context) => context,
                Err(e) => {
                    if let Err(finish) = self.engine.finish() {
                        warn!("Engine finish after failed channel open: {}", finish);
                    }
                    return Err(e);
                }
            };

            for side in [Side::Client, Side::Server] {
                self.engine.register_address(context.endpoint(side).id());
            }
            debug!("Harness initialized");
            self.context = Some(context);
        }

        self.context
            .as_ref()
            .ok_or_else(|| HarnessError::Channel("context missing after init".to_string()))
    }

    /// Reaches an established association.
    ///
    /// With `reuse_association` a still-established association from an earlier
    /// iteration is handed back untouched.
    pub fn bootstrap(&mut self) -> Result<Association, HarnessError> {
        self.ensure_initialized()?;

        if let Some(assoc) = self.association {
            if self.config.reuse_association
                && self.engine.is_established(assoc.client)
                && self.engine.is_established(assoc.server)
            {
                trace!("Reusing association on port {}", assoc.port);
                self.phase = Phase::Bootstrapped;
                return Ok(assoc);
            }
            debug!("Association on port {} is gone, re-bootstrapping", assoc.port);
            self.close_association(assoc);
            self.association = None;
        }

        let port = self.ports.advance();
        let context = self
            .context
            .as_ref()
            .ok_or_else(|| HarnessError::Channel("context missing after init".to_string()))?;
        let assoc = bootstrap::establish(
            self.engine.as_ref(),
            context,
            port,
            &self.config,
            self.receiver.clone(),
        )?;

        self.association = Some(assoc);
        self.phase = Phase::Bootstrapped;
        Ok(assoc)
    }

    /// Injects `input` into the `target` side of the current association.
    pub fn inject(&mut self, target: Side, input: &[u8]) -> Result<usize, HarnessError> {
        let context = self
            .context
            .as_ref()
            .ok_or(HarnessError::Engine(EngineError::NotInitialized))?;

        let endpoint = context.endpoint(target).id();
        let len = inject::inject(
            self.engine.as_ref(),
            context.headers(),
            endpoint,
            target,
            input,
        )?;
        self.phase = Phase::Injected;
        Ok(len)
    }

    /// Ends an iteration: keep everything in fast-iteration mode, otherwise
    /// run the full teardown.
    pub fn finish_iteration(&mut self) -> Result<(), HarnessError> {
        if self.config.reuse_association {
            if self.context.is_some() {
                self.phase = Phase::Bootstrapped;
            }
            return Ok(());
        }
        self.teardown()
    }

    /// Bootstrap, inject, finish.
    pub fn run_iteration(&mut self, target: Side, input: &[u8]) -> Result<usize, HarnessError> {
        self.bootstrap()?;
        let len = self.inject(target, input)?;
        self.finish_iteration()?;
        Ok(len)
    }

    fn close_association(&self, assoc: Association) {
        for socket in [assoc.client, assoc.server] {
            match self.engine.close(socket) {
                Ok(()) => {}
                Err(EngineError::UnknownSocket(_)) => {
                    trace!("{} already closed", socket);
                }
                Err(e) => warn!("Closing {} failed: {}", socket, e),
            }
        }
    }

    /// Close both sockets, deregister addresses, wait for the engine runtime
    /// to finish and drop the network context.
    pub fn teardown(&mut self) -> Result<(), HarnessError> {
        if let Some(assoc) = self.association.take() {
            self.close_association(assoc);
        }

        let Some(context) = self.context.as_ref() else {
            self.phase = Phase::Closed;
            return Ok(());
        };
        for side in [Side::Client, Side::Server] {
            self.engine.deregister_address(context.endpoint(side).id());
        }

        let deadline = Instant::now() + self.config.finish_timeout();
        loop {
            match self.engine.finish() {
                Ok(()) => break,
                Err(EngineError::SocketsOutstanding(n)) if Instant::now() < deadline => {
                    trace!("Finishing: {} sockets outstanding", n);
                    thread::sleep(Duration::from_millis(timeouts::FINISH_POLL_INTERVAL_MS));
                }
                Err(e) => {
                    return Err(HarnessError::Teardown(format!(
                        "engine did not finish: {}",
                        e
                    )));
                }
            }
        }

        self.context = None;
        self.phase = Phase::Closed;
        debug!("Harness torn down");
        Ok(())
    }
}
