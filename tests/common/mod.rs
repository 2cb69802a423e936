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

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sctp_conn_fuzz::harness_core::traits::{
    DebugSink, InboundSource, OutboundSink, ProtocolEngine, ReceiveHandler,
};
use sctp_conn_fuzz::harness_core::types::{
    EndpointId, SendInfo, SocketId, SocketOption, VirtualAddr,
};
use sctp_conn_fuzz::EngineError;

pub const CLIENT_VTAG: u32 = 0xc1c1_c1c1;
pub const SERVER_VTAG: u32 = 0x5e5e_5e5e;

/// 12-byte common header as the fake engine writes it.
pub fn fake_header(src_port: u16, dst_port: u16, vtag: u32) -> [u8; 12] {
    let mut header = [0u8; 12];
    header[0..2].copy_from_slice(&src_port.to_be_bytes());
    header[2..4].copy_from_slice(&dst_port.to_be_bytes());
    header[4..8].copy_from_slice(&vtag.to_be_bytes());
    header
}

/// Engine double that records every call and, during `connect`, emits one
/// packet from each side so the harness captures both headers.
#[derive(Default)]
pub struct FakeEngine {
    outbound: Mutex<Option<Arc<dyn OutboundSink>>>,
    pub inits: AtomicUsize,
    pub connects: AtomicUsize,
    pub finishes: AtomicUsize,
    pub calls: Mutex<Vec<String>>,
    pub inputs: Mutex<Vec<(EndpointId, Vec<u8>)>>,
    bound: Mutex<HashMap<SocketId, VirtualAddr>>,
    open: Mutex<HashSet<SocketId>>,
    established: Mutex<HashSet<SocketId>>,
    next_socket: AtomicU32,
}

impl FakeEngine {
    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn inputs(&self) -> Vec<(EndpointId, Vec<u8>)> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn open_sockets(&self) -> usize {
        self.open.lock().unwrap().len()
    }

    /// Waits until at least `n` packets reached `conn_input`.
    pub fn wait_for_inputs(&self, n: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if self.inputs.lock().unwrap().len() >= n {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    fn emit(&self, from: EndpointId, packet: &[u8]) -> io::Result<()> {
        match self.outbound.lock().unwrap().as_ref() {
            Some(outbound) => outbound.output(from, packet),
            None => Err(io::Error::from(io::ErrorKind::NotConnected)),
        }
    }
}

impl InboundSource for FakeEngine {
    fn conn_input(&self, endpoint: EndpointId, packet: &[u8]) {
        self.inputs
            .lock()
            .unwrap()
            .push((endpoint, packet.to_vec()));
    }
}

impl ProtocolEngine for FakeEngine {
    fn init(&self, outbound: Arc<dyn OutboundSink>, _debug: DebugSink) -> Result<(), EngineError> {
        let mut slot = self.outbound.lock().unwrap();
        if slot.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        *slot = Some(outbound);
        self.inits.fetch_add(1, Ordering::SeqCst);
        self.record("init");
        Ok(())
    }

    fn finish(&self) -> Result<(), EngineError> {
        self.finishes.fetch_add(1, Ordering::SeqCst);
        let open = self.open_sockets();
        if open > 0 {
            return Err(EngineError::SocketsOutstanding(open));
        }
        *self.outbound.lock().unwrap() = None;
        self.record("finish");
        Ok(())
    }

    fn register_address(&self, endpoint: EndpointId) {
        self.record(format!("register {}", endpoint));
    }

    fn deregister_address(&self, endpoint: EndpointId) {
        self.record(format!("deregister {}", endpoint));
    }

    fn socket(&self, _handler: Arc<dyn ReceiveHandler>) -> Result<SocketId, EngineError> {
        let id = SocketId(self.next_socket.fetch_add(1, Ordering::SeqCst));
        self.open.lock().unwrap().insert(id);
        self.record("socket");
        Ok(id)
    }

    fn set_option(&self, _socket: SocketId, option: SocketOption) -> Result<(), EngineError> {
        self.record(format!("setsockopt {:?}", option));
        Ok(())
    }

    fn bind(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError> {
        self.bound.lock().unwrap().insert(socket, addr);
        self.record(format!("bind {}", addr));
        Ok(())
    }

    fn listen(&self, _socket: SocketId, backlog: u32) -> Result<(), EngineError> {
        self.record(format!("listen {}", backlog));
        Ok(())
    }

    fn connect(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError> {
        let local = self
            .bound
            .lock()
            .unwrap()
            .get(&socket)
            .copied()
            .ok_or(EngineError::InvalidState {
                socket,
                state: "unbound",
            })?;

        let mut from_client = fake_header(local.port, addr.port, SERVER_VTAG).to_vec();
        from_client.extend_from_slice(b"hello");
        self.emit(local.endpoint, &from_client)?;

        let mut from_server = fake_header(addr.port, local.port, CLIENT_VTAG).to_vec();
        from_server.extend_from_slice(b"world");
        self.emit(addr.endpoint, &from_server)?;

        self.established.lock().unwrap().insert(socket);
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.record(format!("connect {}", addr));
        Ok(())
    }

    fn accept(&self, _socket: SocketId) -> Result<SocketId, EngineError> {
        let id = SocketId(self.next_socket.fetch_add(1, Ordering::SeqCst));
        self.open.lock().unwrap().insert(id);
        self.established.lock().unwrap().insert(id);
        self.record("accept");
        Ok(id)
    }

    fn send(&self, _socket: SocketId, data: &[u8], info: SendInfo) -> Result<usize, EngineError> {
        self.record(format!("send {} ppid {}", data.len(), info.ppid));
        Ok(data.len())
    }

    fn close(&self, socket: SocketId) -> Result<(), EngineError> {
        if !self.open.lock().unwrap().remove(&socket) {
            return Err(EngineError::UnknownSocket(socket));
        }
        self.established.lock().unwrap().remove(&socket);
        self.record(format!("close {}", socket));
        Ok(())
    }

    fn is_established(&self, socket: SocketId) -> bool {
        self.established.lock().unwrap().contains(&socket)
    }
}
