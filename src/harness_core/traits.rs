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

//! Engine Boundary Traits.
//!
//! The protocol engine is a black box. The harness talks to it through
//! `ProtocolEngine`, and the engine talks back through the capabilities the
//! harness registers with it: an `OutboundSink` for packets leaving the engine
//! and a `ReceiveHandler` for data delivered to the application.

use std::io;
use std::sync::Arc;

use crate::harness_core::errors::EngineError;
use crate::harness_core::types::{
    Delivery, EndpointId, ReceiveAction, SendInfo, SocketId, SocketOption, VirtualAddr,
};

/// Where the engine puts every packet it wants on the wire.
pub trait OutboundSink: Send + Sync {
    /// Transmit `packet` from `endpoint` to its peer.
    fn output(&self, endpoint: EndpointId, packet: &[u8]) -> io::Result<()>;
}

/// The engine's inbound-processing entry point.
///
/// Relay loops and fuzz injection only ever need this capability, which keeps
/// them testable without a full engine.
pub trait InboundSource: Send + Sync {
    /// Feed one raw packet, received on `endpoint`, into protocol parsing.
    fn conn_input(&self, endpoint: EndpointId, packet: &[u8]);
}

/// Upcall for data or close notifications on an engine socket.
pub trait ReceiveHandler: Send + Sync {
    fn on_receive(&self, socket: SocketId, delivery: Delivery<'_>) -> ReceiveAction;
}

/// Line-oriented debug output hook passed to the engine at init.
pub type DebugSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A user-space connection-oriented message transport.
pub trait ProtocolEngine: InboundSource + 'static {
    /// One-time global runtime initialization.
    fn init(&self, outbound: Arc<dyn OutboundSink>, debug: DebugSink) -> Result<(), EngineError>;

    /// Tear down the runtime. Fails with `SocketsOutstanding` while sockets remain.
    fn finish(&self) -> Result<(), EngineError>;

    fn register_address(&self, endpoint: EndpointId);

    fn deregister_address(&self, endpoint: EndpointId);

    /// Create a socket whose deliveries go to `handler`.
    fn socket(&self, handler: Arc<dyn ReceiveHandler>) -> Result<SocketId, EngineError>;

    fn set_option(&self, socket: SocketId, option: SocketOption) -> Result<(), EngineError>;

    fn bind(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError>;

    fn listen(&self, socket: SocketId, backlog: u32) -> Result<(), EngineError>;

    /// Blocks until the association is established.
    fn connect(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError>;

    /// Blocks until an established association can be handed out.
    fn accept(&self, socket: SocketId) -> Result<SocketId, EngineError>;

    fn send(&self, socket: SocketId, data: &[u8], info: SendInfo) -> Result<usize, EngineError>;

    fn close(&self, socket: SocketId) -> Result<(), EngineError>;

    /// True while the socket carries an established association.
    fn is_established(&self, socket: SocketId) -> bool;
}
