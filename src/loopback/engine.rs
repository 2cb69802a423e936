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

//! Loopback protocol engine.
//!
//! All engine state sits behind one mutex. Packets are parsed and answered
//! while holding it; upcalls to the application run after it is released so a
//! handler asking for a close can re-enter the engine.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Instant;

use tracing::{debug, trace};

use crate::harness_core::errors::EngineError;
use crate::harness_core::traits::{
    DebugSink, InboundSource, OutboundSink, ProtocolEngine, ReceiveHandler,
};
use crate::harness_core::types::{
    Delivery, EndpointId, RcvInfo, ReceiveAction, SendInfo, SocketId, SocketOption, VirtualAddr,
};
use crate::loopback::cookie::{CookieJar, StateCookie};
use crate::loopback::wire::{
    cause, chunk, error_cause, flags, tsn_le, tsn_lt, Chunk, Chunks, CommonHeader, DataChunk,
    Features, InitChunk, PacketBuilder, SackChunk, Tlvs,
};
use crate::loopback::{limits, LoopbackConfig};

type OutChunk = (u8, u8, Vec<u8>);

#[derive(Debug, Clone, Copy, Default)]
struct Options {
    explicit_eor: bool,
    fragment_interleave: u32,
    interleaving: bool,
    stream_reset: bool,
}

impl Options {
    fn features(&self) -> Features {
        Features {
            i_data: self.interleaving,
            re_config: self.stream_reset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AssocState {
    CookieWait,
    CookieEchoed,
    Established,
    ShutdownSent,
    ShutdownAckSent,
}

impl AssocState {
    fn name(self) -> &'static str {
        match self {
            AssocState::CookieWait => "COOKIE-WAIT",
            AssocState::CookieEchoed => "COOKIE-ECHOED",
            AssocState::Established => "ESTABLISHED",
            AssocState::ShutdownSent => "SHUTDOWN-SENT",
            AssocState::ShutdownAckSent => "SHUTDOWN-ACK-SENT",
        }
    }
}

struct Partial {
    data: Vec<u8>,
    info: RcvInfo,
}

/// Per-association control block.
struct Tcb {
    state: AssocState,
    peer_port: u16,
    local_tag: u32,
    peer_tag: u32,
    next_tsn: u32,
    peer_acked: u32,
    cum_tsn: u32,
    received: BTreeSet<u32>,
    dups: Vec<u32>,
    outbound_streams: u16,
    inbound_streams: u16,
    peer_rwnd: u32,
    features: Features,
    /// 0 allows one partial message per association at a time
    interleave: u32,
    next_ssn: HashMap<u16, u16>,
    open_records: HashSet<u16>,
    reassembly: HashMap<u16, Partial>,
}

fn random_tag() -> u32 {
    loop {
        let tag: u32 = rand::random();
        if tag != 0 {
            return tag;
        }
    }
}

enum End {
    Aborted,
    PeerShutdown,
    Complete,
}

enum Flow {
    Continue,
    Stop,
}

#[derive(Default)]
struct Reply {
    chunks: Vec<OutChunk>,
    sack: bool,
    established: bool,
    end: Option<End>,
    deliveries: Vec<(Vec<u8>, RcvInfo)>,
}

impl Reply {
    fn push(&mut self, kind: u8, flags: u8, value: Vec<u8>) {
        self.chunks.push((kind, flags, value));
    }
}

fn describe_causes(value: &[u8]) -> String {
    let codes: Vec<String> = Tlvs::new(value)
        .map(|tlv| match tlv {
            Ok(tlv) => tlv.kind.to_string(),
            Err(_) => "malformed".to_string(),
        })
        .collect();
    if codes.is_empty() {
        "none".to_string()
    } else {
        codes.join(",")
    }
}

impl Tcb {
    fn connecting(peer_port: u16, options: &Options) -> Self {
        let next_tsn = random_tag();
        Self {
            state: AssocState::CookieWait,
            peer_port,
            local_tag: random_tag(),
            peer_tag: 0,
            next_tsn,
            peer_acked: next_tsn.wrapping_sub(1),
            cum_tsn: 0,
            received: BTreeSet::new(),
            dups: Vec::new(),
            outbound_streams: limits::OUTBOUND_STREAMS,
            inbound_streams: limits::INBOUND_STREAMS,
            peer_rwnd: 0,
            features: options.features(),
            interleave: options.fragment_interleave,
            next_ssn: HashMap::new(),
            open_records: HashSet::new(),
            reassembly: HashMap::new(),
        }
    }

    fn from_cookie(cookie: &StateCookie, options: &Options) -> Self {
        Self {
            state: AssocState::Established,
            peer_port: cookie.peer_port,
            local_tag: cookie.local_tag,
            peer_tag: cookie.peer_tag,
            next_tsn: cookie.local_tsn,
            peer_acked: cookie.local_tsn.wrapping_sub(1),
            cum_tsn: cookie.peer_tsn.wrapping_sub(1),
            received: BTreeSet::new(),
            dups: Vec::new(),
            outbound_streams: cookie.outbound_streams,
            inbound_streams: cookie.inbound_streams,
            peer_rwnd: limits::A_RWND,
            features: cookie.features,
            interleave: options.fragment_interleave,
            next_ssn: HashMap::new(),
            open_records: HashSet::new(),
            reassembly: HashMap::new(),
        }
    }

    fn init_chunk(&self) -> Vec<u8> {
        InitChunk {
            init_tag: self.local_tag,
            a_rwnd: limits::A_RWND,
            outbound_streams: self.outbound_streams,
            inbound_streams: self.inbound_streams,
            initial_tsn: self.next_tsn,
            cookie: None,
            features: self.features,
        }
        .encode()
    }

    fn abort(&mut self, reply: &mut Reply, code: u16, info: &[u8]) -> Flow {
        reply.push(chunk::ABORT, 0, error_cause(code, info));
        reply.end = Some(End::Aborted);
        Flow::Stop
    }

    fn on_chunk(&mut self, c: Chunk<'_>, io: &Io<'_>, reply: &mut Reply) -> Flow {
        match c.kind {
            chunk::DATA => self.on_data(c, io, reply),
            chunk::INIT_ACK => self.on_init_ack(c, io, reply),
            chunk::SACK => self.on_sack(c, io, reply),
            chunk::HEARTBEAT => {
                match Tlvs::new(c.value).next() {
                    Some(Ok(tlv)) if tlv.kind == crate::loopback::wire::param::HEARTBEAT_INFO => {
                        reply.push(chunk::HEARTBEAT_ACK, 0, c.value.to_vec());
                    }
                    _ => io.log(format_args!("HEARTBEAT without heartbeat info ignored")),
                }
                Flow::Continue
            }
            chunk::HEARTBEAT_ACK => Flow::Continue,
            chunk::ABORT => {
                io.log(format_args!(
                    "ABORT received in {} (causes: {})",
                    self.state.name(),
                    describe_causes(c.value)
                ));
                reply.end = Some(End::Aborted);
                Flow::Stop
            }
            chunk::SHUTDOWN => self.on_shutdown(c, reply),
            chunk::SHUTDOWN_ACK => match self.state {
                AssocState::ShutdownSent | AssocState::ShutdownAckSent => {
                    reply.push(chunk::SHUTDOWN_COMPLETE, 0, Vec::new());
                    reply.end = Some(End::Complete);
                    Flow::Stop
                }
                _ => Flow::Continue,
            },
            chunk::SHUTDOWN_COMPLETE => {
                if self.state == AssocState::ShutdownAckSent {
                    reply.end = Some(End::Complete);
                    Flow::Stop
                } else {
                    Flow::Continue
                }
            }
            chunk::ERROR => {
                io.log(format_args!(
                    "ERROR received (causes: {})",
                    describe_causes(c.value)
                ));
                Flow::Continue
            }
            chunk::COOKIE_ECHO => {
                if self.state == AssocState::Established {
                    reply.push(chunk::COOKIE_ACK, 0, Vec::new());
                }
                Flow::Continue
            }
            chunk::COOKIE_ACK => {
                if self.state == AssocState::CookieEchoed {
                    self.state = AssocState::Established;
                    reply.established = true;
                }
                Flow::Continue
            }
            _ => self.on_unrecognized(c, io, reply),
        }
    }

    fn on_unrecognized(&mut self, c: Chunk<'_>, io: &Io<'_>, reply: &mut Reply) -> Flow {
        io.log(format_args!("Unrecognized chunk type {:#04x}", c.kind));
        let action = c.kind >> 6;
        if action & 1 != 0 {
            let mut raw = Vec::with_capacity(4 + c.value.len());
            raw.push(c.kind);
            raw.push(c.flags);
            raw.extend_from_slice(&((4 + c.value.len()) as u16).to_be_bytes());
            raw.extend_from_slice(c.value);
            reply.push(
                chunk::ERROR,
                0,
                error_cause(cause::UNRECOGNIZED_CHUNK, &raw),
            );
        }
        if action & 2 != 0 {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn on_init_ack(&mut self, c: Chunk<'_>, io: &Io<'_>, reply: &mut Reply) -> Flow {
        if self.state != AssocState::CookieWait {
            return Flow::Continue;
        }
        let init = match InitChunk::parse(c.value) {
            Ok(init) => init,
            Err(e) => {
                io.log(format_args!("Malformed INIT ACK: {}", e));
                return Flow::Stop;
            }
        };
        if init.init_tag == 0 {
            io.log(format_args!("INIT ACK with zero initiate tag"));
            return Flow::Stop;
        }

        self.peer_tag = init.init_tag;
        let Some(cookie) = init.cookie else {
            return self.abort(reply, cause::MISSING_PARAM, &[]);
        };
        self.outbound_streams = self.outbound_streams.min(init.inbound_streams);
        self.inbound_streams = self.inbound_streams.min(init.outbound_streams);
        if self.outbound_streams == 0 || self.inbound_streams == 0 {
            return self.abort(reply, cause::PROTOCOL_VIOLATION, b"zero streams");
        }
        self.cum_tsn = init.initial_tsn.wrapping_sub(1);
        self.peer_rwnd = init.a_rwnd;
        self.features = self.features.intersect(&init.features);

        reply.push(chunk::COOKIE_ECHO, 0, cookie.to_vec());
        self.state = AssocState::CookieEchoed;
        Flow::Continue
    }

    fn on_data(&mut self, c: Chunk<'_>, io: &Io<'_>, reply: &mut Reply) -> Flow {
        if !matches!(
            self.state,
            AssocState::Established | AssocState::ShutdownSent
        ) {
            return Flow::Continue;
        }
        let data = match DataChunk::parse(c.flags, c.value) {
            Ok(data) => data,
            Err(e) => {
                io.log(format_args!("Malformed DATA: {}", e));
                return self.abort(reply, cause::PROTOCOL_VIOLATION, b"malformed DATA");
            }
        };
        if data.payload.is_empty() {
            return self.abort(reply, cause::NO_USER_DATA, &data.tsn.to_be_bytes());
        }

        reply.sack = true;
        if !self.track_tsn(data.tsn) {
            return Flow::Continue;
        }
        if data.stream >= self.inbound_streams {
            let mut info = data.stream.to_be_bytes().to_vec();
            info.extend_from_slice(&[0, 0]);
            reply.push(chunk::ERROR, 0, error_cause(cause::INVALID_STREAM, &info));
            return Flow::Continue;
        }

        self.reassemble(&data, io, reply);
        Flow::Continue
    }

    /// Records a received TSN. False for duplicates and TSNs outside the window.
    fn track_tsn(&mut self, tsn: u32) -> bool {
        if tsn_le(tsn, self.cum_tsn) || self.received.contains(&tsn) {
            if self.dups.len() < limits::MAX_REPORTED_DUPS {
                self.dups.push(tsn);
            }
            return false;
        }
        if tsn.wrapping_sub(self.cum_tsn) > limits::TSN_WINDOW {
            return false;
        }
        self.received.insert(tsn);
        while self.received.remove(&self.cum_tsn.wrapping_add(1)) {
            self.cum_tsn = self.cum_tsn.wrapping_add(1);
        }
        true
    }

    fn reassemble(&mut self, data: &DataChunk<'_>, io: &Io<'_>, reply: &mut Reply) {
        let info = RcvInfo {
            stream: data.stream,
            ssn: data.ssn,
            tsn: data.tsn,
            ppid: data.ppid,
            unordered: data.unordered(),
        };

        if data.begins() {
            if self.interleave == 0 {
                self.reassembly.retain(|stream, _| *stream == data.stream);
            }
            if data.ends() {
                self.reassembly.remove(&data.stream);
                reply.deliveries.push((data.payload.to_vec(), info));
            } else {
                self.reassembly.insert(
                    data.stream,
                    Partial {
                        data: data.payload.to_vec(),
                        info,
                    },
                );
            }
            return;
        }

        let Some(partial) = self.reassembly.get_mut(&data.stream) else {
            return;
        };
        if partial.data.len() + data.payload.len() > limits::MAX_REASSEMBLY {
            io.log(format_args!(
                "Reassembly on stream {} exceeds {} bytes, dropped",
                data.stream,
                limits::MAX_REASSEMBLY
            ));
            self.reassembly.remove(&data.stream);
            return;
        }
        partial.data.extend_from_slice(data.payload);
        if data.ends() {
            if let Some(done) = self.reassembly.remove(&data.stream) {
                reply.deliveries.push((done.data, done.info));
            }
        }
    }

    fn sack_chunk(&mut self) -> Vec<u8> {
        let mut offsets: Vec<u32> = self
            .received
            .iter()
            .map(|tsn| tsn.wrapping_sub(self.cum_tsn))
            .collect();
        offsets.sort_unstable();

        let mut gaps: Vec<(u16, u16)> = Vec::new();
        for offset in offsets {
            let offset = offset as u16;
            match gaps.last_mut() {
                Some((_, end)) if end.wrapping_add(1) == offset => *end = offset,
                _ => gaps.push((offset, offset)),
            }
        }

        SackChunk {
            cum_tsn_ack: self.cum_tsn,
            a_rwnd: limits::A_RWND,
            gaps,
            dups: std::mem::take(&mut self.dups),
        }
        .encode()
    }

    fn on_sack(&mut self, c: Chunk<'_>, io: &Io<'_>, reply: &mut Reply) -> Flow {
        if !matches!(
            self.state,
            AssocState::Established | AssocState::ShutdownSent | AssocState::ShutdownAckSent
        ) {
            return Flow::Continue;
        }
        let sack = match SackChunk::parse(c.value) {
            Ok(sack) => sack,
            Err(e) => {
                io.log(format_args!("Malformed SACK: {}", e));
                return self.abort(reply, cause::PROTOCOL_VIOLATION, b"malformed SACK");
            }
        };
        if !tsn_lt(sack.cum_tsn_ack, self.next_tsn) {
            io.log(format_args!(
                "SACK acknowledges {} but next TSN is {}",
                sack.cum_tsn_ack, self.next_tsn
            ));
            return self.abort(reply, cause::PROTOCOL_VIOLATION, b"cumulative TSN ack beyond sent");
        }
        if tsn_lt(self.peer_acked, sack.cum_tsn_ack) {
            self.peer_acked = sack.cum_tsn_ack;
        }
        self.peer_rwnd = sack.a_rwnd;
        trace!(
            "SACK cum {} rwnd {} gaps {} dups {}",
            self.peer_acked,
            self.peer_rwnd,
            sack.gaps.len(),
            sack.dups.len()
        );
        Flow::Continue
    }

    fn on_shutdown(&mut self, c: Chunk<'_>, reply: &mut Reply) -> Flow {
        if c.value.len() < 4 {
            return self.abort(reply, cause::PROTOCOL_VIOLATION, b"short SHUTDOWN");
        }
        match self.state {
            AssocState::Established => {
                self.state = AssocState::ShutdownAckSent;
                reply.push(chunk::SHUTDOWN_ACK, 0, Vec::new());
                reply.end = Some(End::PeerShutdown);
            }
            AssocState::ShutdownSent => {
                self.state = AssocState::ShutdownAckSent;
                reply.push(chunk::SHUTDOWN_ACK, 0, Vec::new());
            }
            AssocState::ShutdownAckSent => {
                reply.push(chunk::SHUTDOWN_ACK, 0, Vec::new());
            }
            AssocState::CookieWait | AssocState::CookieEchoed => {}
        }
        Flow::Continue
    }
}

enum SockState {
    Idle,
    Listening {
        backlog: usize,
        queue: VecDeque<SocketId>,
    },
    Assoc(Box<Tcb>),
    Disconnected,
}

impl SockState {
    fn name(&self) -> &'static str {
        match self {
            SockState::Idle => "CLOSED",
            SockState::Listening { .. } => "LISTEN",
            SockState::Assoc(tcb) => tcb.state.name(),
            SockState::Disconnected => "DISCONNECTED",
        }
    }
}

struct Socket {
    handler: Arc<dyn ReceiveHandler>,
    local: Option<VirtualAddr>,
    options: Options,
    state: SockState,
    accepted: bool,
    /// Set once the application closed the socket
    closed_at: Option<Instant>,
}

enum Upcall {
    Data(Vec<u8>, RcvInfo),
    Closed,
}

struct Pending {
    handler: Arc<dyn ReceiveHandler>,
    socket: SocketId,
    upcall: Upcall,
}

struct Io<'a> {
    outbound: Option<&'a Arc<dyn OutboundSink>>,
    debug: Option<&'a DebugSink>,
}

impl Io<'_> {
    fn log(&self, args: fmt::Arguments<'_>) {
        if let Some(debug) = self.debug {
            debug(&args.to_string());
        }
    }

    fn transmit(&self, from: EndpointId, packet: &[u8]) -> io::Result<()> {
        match self.outbound {
            Some(outbound) => outbound.output(from, packet),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "engine not initialized",
            )),
        }
    }

    fn send_chunks(
        &self,
        local: VirtualAddr,
        peer_port: u16,
        vtag: u32,
        chunks: &[OutChunk],
    ) -> io::Result<()> {
        if chunks.is_empty() {
            return Ok(());
        }
        let mut builder = PacketBuilder::new(CommonHeader::new(local.port, peer_port, vtag));
        for (kind, flags, value) in chunks {
            builder.push(*kind, *flags, value);
        }
        self.transmit(local.endpoint, &builder.finish())
    }
}

type Sockets = BTreeMap<SocketId, Socket>;

#[derive(Default)]
struct Inner {
    initialized: bool,
    outbound: Option<Arc<dyn OutboundSink>>,
    debug: Option<DebugSink>,
    registered: HashSet<EndpointId>,
    sockets: Sockets,
    next_socket: u32,
}

enum Target {
    Assoc(SocketId),
    Listener(SocketId),
}

fn find_target(sockets: &Sockets, endpoint: EndpointId, header: &CommonHeader) -> Option<Target> {
    let local = VirtualAddr::new(endpoint, header.dst_port);
    let assoc = sockets.iter().find(|(_, s)| {
        s.local == Some(local)
            && matches!(&s.state, SockState::Assoc(tcb) if tcb.peer_port == header.src_port)
    });
    if let Some((id, _)) = assoc {
        return Some(Target::Assoc(*id));
    }
    sockets
        .iter()
        .find(|(_, s)| s.local == Some(local) && matches!(s.state, SockState::Listening { .. }))
        .map(|(id, _)| Target::Listener(*id))
}

/// Sends ABORT if the peer is known and drops the socket.
fn abort_and_remove(sockets: &mut Sockets, io: &Io<'_>, id: SocketId) {
    let Some(sock) = sockets.remove(&id) else {
        return;
    };
    if let (SockState::Assoc(tcb), Some(local)) = (&sock.state, sock.local) {
        if tcb.peer_tag != 0 {
            let abort = [(chunk::ABORT, 0, error_cause(cause::USER_ABORT, &[]))];
            if let Err(e) = io.send_chunks(local, tcb.peer_port, tcb.peer_tag, &abort) {
                io.log(format_args!("ABORT on {} not sent: {}", id, e));
            }
        }
    }
}

impl Inner {
    fn split(&mut self) -> (Io<'_>, &mut Sockets) {
        (
            Io {
                outbound: self.outbound.as_ref(),
                debug: self.debug.as_ref(),
            },
            &mut self.sockets,
        )
    }

    fn socket_mut(&mut self, id: SocketId) -> Result<&mut Socket, EngineError> {
        self.sockets
            .get_mut(&id)
            .ok_or(EngineError::UnknownSocket(id))
    }

    fn input(
        &mut self,
        jar: &CookieJar,
        endpoint: EndpointId,
        packet: &[u8],
        pending: &mut Vec<Pending>,
    ) {
        let Inner {
            outbound,
            debug,
            registered,
            sockets,
            next_socket,
            ..
        } = self;
        let io = Io {
            outbound: outbound.as_ref(),
            debug: debug.as_ref(),
        };

        let (header, area) = match CommonHeader::parse(packet) {
            Ok(parsed) => parsed,
            Err(e) => {
                io.log(format_args!("Dropping packet on {}: {}", endpoint, e));
                return;
            }
        };

        match find_target(sockets, endpoint, &header) {
            Some(Target::Assoc(id)) => {
                assoc_input(&io, sockets, id, &header, area, Reply::default(), pending)
            }
            Some(Target::Listener(id)) => {
                if !registered.contains(&endpoint) {
                    io.log(format_args!("{} is not registered, dropping", endpoint));
                    return;
                }
                listener_input(&io, jar, sockets, next_socket, id, &header, area, pending)
            }
            None => {
                if registered.contains(&endpoint) {
                    out_of_the_blue(&io, endpoint, &header, area);
                }
            }
        }
    }
}

fn out_of_the_blue(io: &Io<'_>, endpoint: EndpointId, header: &CommonHeader, area: &[u8]) {
    let kinds: Vec<u8> = Chunks::new(area)
        .map_while(Result::ok)
        .map(|c| c.kind)
        .collect();
    if kinds.is_empty()
        || kinds
            .iter()
            .any(|k| matches!(*k, chunk::ABORT | chunk::SHUTDOWN_COMPLETE | chunk::INIT))
    {
        return;
    }

    let local = VirtualAddr::new(endpoint, header.dst_port);
    let reply = if kinds.contains(&chunk::SHUTDOWN_ACK) {
        (chunk::SHUTDOWN_COMPLETE, flags::T_BIT, Vec::new())
    } else {
        (chunk::ABORT, flags::T_BIT, Vec::new())
    };
    io.log(format_args!(
        "Out of the blue packet on {} port {}, answering with chunk {}",
        endpoint, header.dst_port, reply.0
    ));
    if let Err(e) = io.send_chunks(local, header.src_port, header.vtag, &[reply]) {
        io.log(format_args!("Out of the blue reply not sent: {}", e));
    }
}

#[allow(clippy::too_many_arguments)]
fn listener_input(
    io: &Io<'_>,
    jar: &CookieJar,
    sockets: &mut Sockets,
    next_socket: &mut u32,
    listener_id: SocketId,
    header: &CommonHeader,
    area: &[u8],
    pending: &mut Vec<Pending>,
) {
    let mut chunks = Chunks::new(area);
    let first = match chunks.next() {
        Some(Ok(first)) => first,
        Some(Err(e)) => {
            io.log(format_args!("Malformed packet to listener: {}", e));
            return;
        }
        None => return,
    };

    let Some(listener) = sockets.get(&listener_id) else {
        return;
    };
    let Some(local) = listener.local else {
        return;
    };

    match first.kind {
        chunk::INIT => {
            if header.vtag != 0 || chunks.next().is_some() {
                io.log(format_args!("INIT with tag or bundled chunks dropped"));
                return;
            }
            let init = match InitChunk::parse(first.value) {
                Ok(init) => init,
                Err(e) => {
                    io.log(format_args!("Malformed INIT: {}", e));
                    return;
                }
            };
            if init.init_tag == 0 || init.outbound_streams == 0 || init.inbound_streams == 0 {
                io.log(format_args!("INIT with invalid parameters dropped"));
                return;
            }

            let ours = listener.options.features();
            let cookie = StateCookie {
                local_tag: random_tag(),
                peer_tag: init.init_tag,
                local_tsn: random_tag(),
                peer_tsn: init.initial_tsn,
                peer_port: header.src_port,
                outbound_streams: limits::OUTBOUND_STREAMS.min(init.inbound_streams),
                inbound_streams: limits::INBOUND_STREAMS.min(init.outbound_streams),
                features: ours.intersect(&init.features),
            };
            let raw = jar.bake(&cookie);
            let init_ack = InitChunk {
                init_tag: cookie.local_tag,
                a_rwnd: limits::A_RWND,
                outbound_streams: limits::OUTBOUND_STREAMS,
                inbound_streams: limits::INBOUND_STREAMS,
                initial_tsn: cookie.local_tsn,
                cookie: Some(&raw),
                features: ours,
            }
            .encode();

            let reply = [(chunk::INIT_ACK, 0, init_ack)];
            if let Err(e) = io.send_chunks(local, header.src_port, init.init_tag, &reply) {
                io.log(format_args!("INIT ACK not sent: {}", e));
            }
        }
        chunk::COOKIE_ECHO => {
            let Some(cookie) = jar.open(first.value) else {
                io.log(format_args!("Invalid state cookie dropped"));
                return;
            };
            if header.vtag != cookie.local_tag || header.src_port != cookie.peer_port {
                io.log(format_args!("COOKIE ECHO with mismatched tag or port dropped"));
                return;
            }

            let backlog_full = match &listener.state {
                SockState::Listening { backlog, queue } => queue.len() >= *backlog,
                _ => true,
            };
            let tcb = Tcb::from_cookie(&cookie, &listener.options);
            if backlog_full {
                let abort = [(chunk::ABORT, 0, error_cause(cause::USER_ABORT, &[]))];
                if let Err(e) = io.send_chunks(local, tcb.peer_port, tcb.peer_tag, &abort) {
                    io.log(format_args!("Backlog full ABORT not sent: {}", e));
                }
                return;
            }

            let id = SocketId(*next_socket);
            *next_socket += 1;
            let socket = Socket {
                handler: listener.handler.clone(),
                local: Some(local),
                options: listener.options,
                state: SockState::Assoc(Box::new(tcb)),
                accepted: true,
                closed_at: None,
            };
            sockets.insert(id, socket);
            if let Some(Socket {
                state: SockState::Listening { queue, .. },
                ..
            }) = sockets.get_mut(&listener_id)
            {
                queue.push_back(id);
            }
            let mut reply = Reply::default();
            reply.push(chunk::COOKIE_ACK, 0, Vec::new());
            reply.established = true;
            // Remaining chunks of the packet belong to the new association.
            let rest = chunks.clone();
            assoc_chunks(io, sockets, id, rest, reply, pending);
        }
        _ => out_of_the_blue(io, local.endpoint, header, area),
    }
}

fn assoc_input(
    io: &Io<'_>,
    sockets: &mut Sockets,
    id: SocketId,
    header: &CommonHeader,
    area: &[u8],
    reply: Reply,
    pending: &mut Vec<Pending>,
) {
    let Some(Socket {
        state: SockState::Assoc(tcb),
        ..
    }) = sockets.get(&id)
    else {
        return;
    };

    let mut chunks = Chunks::new(area);
    let Some(Ok(first)) = chunks.clone().next() else {
        io.log(format_args!("Packet for {} without valid chunk dropped", id));
        return;
    };
    if chunks
        .clone()
        .map_while(Result::ok)
        .any(|c| c.kind == chunk::INIT)
    {
        io.log(format_args!("INIT for existing association {} dropped", id));
        return;
    }

    let reflected = matches!(first.kind, chunk::ABORT | chunk::SHUTDOWN_COMPLETE)
        && first.flags & flags::T_BIT != 0;
    let expected = if reflected {
        tcb.peer_tag
    } else {
        tcb.local_tag
    };
    if header.vtag != expected {
        io.log(format_args!(
            "Verification tag {:#010x} does not match {:#010x} on {}",
            header.vtag, expected, id
        ));
        return;
    }

    assoc_chunks(io, sockets, id, &mut chunks, reply, pending);
}

fn assoc_chunks<'a>(
    io: &Io<'_>,
    sockets: &mut Sockets,
    id: SocketId,
    chunks: impl IntoIterator<Item = Result<Chunk<'a>, crate::loopback::wire::WireError>>,
    mut reply: Reply,
    pending: &mut Vec<Pending>,
) {
    let Some(sock) = sockets.get_mut(&id) else {
        return;
    };
    let Some(local) = sock.local else {
        return;
    };
    let SockState::Assoc(tcb) = &mut sock.state else {
        return;
    };

    for c in chunks {
        match c {
            Ok(c) => {
                if let Flow::Stop = tcb.on_chunk(c, io, &mut reply) {
                    break;
                }
            }
            Err(e) => {
                io.log(format_args!("Malformed chunk on {}: {}", id, e));
                break;
            }
        }
    }

    if reply.sack && reply.end.is_none() {
        let sack = tcb.sack_chunk();
        reply.push(chunk::SACK, 0, sack);
    }
    if tcb.peer_tag != 0 {
        if let Err(e) = io.send_chunks(local, tcb.peer_port, tcb.peer_tag, &reply.chunks) {
            io.log(format_args!("Reply on {} not sent: {}", id, e));
        }
    }
    if reply.established {
        io.log(format_args!(
            "Association {} established (streams {}/{}, i-data {}, re-config {})",
            id,
            tcb.outbound_streams,
            tcb.inbound_streams,
            tcb.features.i_data,
            tcb.features.re_config
        ));
    }

    for (data, info) in reply.deliveries {
        pending.push(Pending {
            handler: sock.handler.clone(),
            socket: id,
            upcall: Upcall::Data(data, info),
        });
    }

    match reply.end {
        None => {}
        Some(End::PeerShutdown) => {
            io.log(format_args!("Peer shut down association {}", id));
            if sock.closed_at.is_none() {
                pending.push(Pending {
                    handler: sock.handler.clone(),
                    socket: id,
                    upcall: Upcall::Closed,
                });
            }
        }
        Some(End::Aborted) | Some(End::Complete) => {
            io.log(format_args!("Association {} terminated", id));
            if sock.closed_at.is_some() {
                sockets.remove(&id);
            } else {
                let aborted = matches!(reply.end, Some(End::Aborted));
                sock.state = SockState::Disconnected;
                if aborted {
                    pending.push(Pending {
                        handler: sock.handler.clone(),
                        socket: id,
                        upcall: Upcall::Closed,
                    });
                }
            }
        }
    }
}

/// In-process engine speaking the loopback wire format.
pub struct LoopbackEngine {
    config: LoopbackConfig,
    jar: CookieJar,
    inner: Mutex<Inner>,
    changed: Condvar,
}

impl LoopbackEngine {
    pub fn new(config: LoopbackConfig) -> Self {
        Self {
            config,
            jar: CookieJar::new(),
            inner: Mutex::new(Inner::default()),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_initialized(&self) -> Result<MutexGuard<'_, Inner>, EngineError> {
        let inner = self.lock();
        if !inner.initialized {
            return Err(EngineError::NotInitialized);
        }
        Ok(inner)
    }

    /// Polls `check` under the lock until it yields or the handshake timeout passes.
    fn wait_for<T>(
        &self,
        what: &'static str,
        mut check: impl FnMut(&mut Inner) -> Option<Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        let deadline = Instant::now() + self.config.handshake_timeout;
        let mut inner = self.lock();
        loop {
            if let Some(result) = check(&mut inner) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(EngineError::Timeout(what));
            }
            let (guard, _) = self
                .changed
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            inner = guard;
        }
    }

    fn dispatch(&self, pending: Vec<Pending>) {
        for p in pending {
            let action = match &p.upcall {
                Upcall::Data(data, info) => p.handler.on_receive(
                    p.socket,
                    Delivery::Data {
                        data: data.as_slice(),
                        info: *info,
                    },
                ),
                Upcall::Closed => p.handler.on_receive(p.socket, Delivery::Closed),
            };
            if action == ReceiveAction::Close {
                if let Err(e) = self.close_socket(p.socket) {
                    trace!("Close requested by upcall on {}: {}", p.socket, e);
                }
            }
        }
    }

    fn close_socket(&self, id: SocketId) -> Result<(), EngineError> {
        let mut inner = self.lock();
        let (io, sockets) = inner.split();
        let sock = sockets.get_mut(&id).ok_or(EngineError::UnknownSocket(id))?;
        if sock.closed_at.is_some() {
            return Ok(());
        }

        match &mut sock.state {
            SockState::Idle | SockState::Disconnected => {
                sockets.remove(&id);
            }
            SockState::Listening { queue, .. } => {
                let orphans: Vec<SocketId> = queue.drain(..).collect();
                sockets.remove(&id);
                for orphan in orphans {
                    abort_and_remove(sockets, &io, orphan);
                }
            }
            SockState::Assoc(tcb) => match tcb.state {
                AssocState::CookieWait | AssocState::CookieEchoed => {
                    abort_and_remove(sockets, &io, id);
                }
                AssocState::Established => {
                    let Some(local) = sock.local else {
                        sockets.remove(&id);
                        return Ok(());
                    };
                    let shutdown = [(chunk::SHUTDOWN, 0, tcb.cum_tsn.to_be_bytes().to_vec())];
                    // The shutdown guard reaps the socket if this never arrives.
                    if let Err(e) = io.send_chunks(local, tcb.peer_port, tcb.peer_tag, &shutdown) {
                        io.log(format_args!("SHUTDOWN on {} not sent: {}", id, e));
                    }
                    tcb.state = AssocState::ShutdownSent;
                    sock.closed_at = Some(Instant::now());
                }
                AssocState::ShutdownSent | AssocState::ShutdownAckSent => {
                    sock.closed_at = Some(Instant::now());
                }
            },
        }
        drop(inner);
        self.changed.notify_all();
        Ok(())
    }

    /// Number of sockets the engine still holds.
    pub fn socket_count(&self) -> usize {
        self.lock().sockets.len()
    }
}

impl Default for LoopbackEngine {
    fn default() -> Self {
        Self::new(LoopbackConfig::default())
    }
}

impl InboundSource for LoopbackEngine {
    fn conn_input(&self, endpoint: EndpointId, packet: &[u8]) {
        let mut pending = Vec::new();
        {
            let mut inner = self.lock();
            if !inner.initialized {
                return;
            }
            inner.input(&self.jar, endpoint, packet, &mut pending);
        }
        self.changed.notify_all();
        self.dispatch(pending);
    }
}

impl ProtocolEngine for LoopbackEngine {
    fn init(&self, outbound: Arc<dyn OutboundSink>, debug: DebugSink) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if inner.initialized {
            return Err(EngineError::AlreadyInitialized);
        }
        inner.initialized = true;
        inner.outbound = Some(outbound);
        inner.debug = Some(debug);
        debug!("Loopback engine initialized");
        Ok(())
    }

    fn finish(&self) -> Result<(), EngineError> {
        let mut inner = self.lock();
        if !inner.initialized {
            return Ok(());
        }

        let guard = self.config.shutdown_guard;
        let (io, sockets) = inner.split();
        let expired: Vec<SocketId> = sockets
            .iter()
            .filter(|(_, s)| s.closed_at.is_some_and(|t| t.elapsed() >= guard))
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            io.log(format_args!("Shutdown guard expired on {}", id));
            abort_and_remove(sockets, &io, id);
        }

        if !inner.sockets.is_empty() {
            return Err(EngineError::SocketsOutstanding(inner.sockets.len()));
        }
        inner.initialized = false;
        inner.outbound = None;
        inner.debug = None;
        inner.registered.clear();
        debug!("Loopback engine finished");
        Ok(())
    }

    fn register_address(&self, endpoint: EndpointId) {
        self.lock().registered.insert(endpoint);
    }

    fn deregister_address(&self, endpoint: EndpointId) {
        self.lock().registered.remove(&endpoint);
    }

    fn socket(&self, handler: Arc<dyn ReceiveHandler>) -> Result<SocketId, EngineError> {
        let mut inner = self.lock_initialized()?;
        let id = SocketId(inner.next_socket);
        inner.next_socket += 1;
        inner.sockets.insert(
            id,
            Socket {
                handler,
                local: None,
                options: Options::default(),
                state: SockState::Idle,
                accepted: false,
                closed_at: None,
            },
        );
        Ok(id)
    }

    fn set_option(&self, socket: SocketId, option: SocketOption) -> Result<(), EngineError> {
        let mut inner = self.lock_initialized()?;
        let options = &mut inner.socket_mut(socket)?.options;
        match option {
            SocketOption::ExplicitEor(on) => options.explicit_eor = on,
            SocketOption::FragmentInterleave(level) => options.fragment_interleave = level,
            SocketOption::InterleavingSupported(on) => options.interleaving = on,
            SocketOption::StreamReset {
                reset_streams,
                change_assoc,
            } => options.stream_reset = reset_streams || change_assoc,
        }
        Ok(())
    }

    fn bind(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError> {
        let mut inner = self.lock_initialized()?;
        let in_use = inner
            .sockets
            .iter()
            .any(|(id, s)| *id != socket && !s.accepted && s.local == Some(addr));

        let sock = inner.socket_mut(socket)?;
        if sock.local.is_some() || !matches!(sock.state, SockState::Idle) {
            return Err(EngineError::InvalidState {
                socket,
                state: "already bound",
            });
        }
        if in_use {
            return Err(EngineError::AddressInUse(addr));
        }
        sock.local = Some(addr);
        Ok(())
    }

    fn listen(&self, socket: SocketId, backlog: u32) -> Result<(), EngineError> {
        let mut inner = self.lock_initialized()?;
        let sock = inner.socket_mut(socket)?;
        if sock.local.is_none() {
            return Err(EngineError::InvalidState {
                socket,
                state: "unbound",
            });
        }
        match sock.state {
            SockState::Idle => {
                sock.state = SockState::Listening {
                    backlog: backlog.max(1) as usize,
                    queue: VecDeque::new(),
                };
                Ok(())
            }
            SockState::Listening {
                backlog: ref mut current,
                ..
            } => {
                *current = backlog.max(1) as usize;
                Ok(())
            }
            ref other => Err(EngineError::InvalidState {
                socket,
                state: other.name(),
            }),
        }
    }

    fn connect(&self, socket: SocketId, addr: VirtualAddr) -> Result<(), EngineError> {
        {
            let mut inner = self.lock_initialized()?;
            let (io, sockets) = inner.split();
            let sock = sockets
                .get_mut(&socket)
                .ok_or(EngineError::UnknownSocket(socket))?;
            if !matches!(sock.state, SockState::Idle) {
                return Err(EngineError::InvalidState {
                    socket,
                    state: sock.state.name(),
                });
            }
            let local = sock.local.ok_or(EngineError::InvalidState {
                socket,
                state: "unbound",
            })?;

            let tcb = Tcb::connecting(addr.port, &sock.options);
            let init = [(chunk::INIT, 0, tcb.init_chunk())];
            io.send_chunks(local, addr.port, 0, &init)?;
            sock.state = SockState::Assoc(Box::new(tcb));
        }

        let result = self.wait_for("connect", |inner| match inner.sockets.get(&socket) {
            None => Some(Err(EngineError::UnknownSocket(socket))),
            Some(sock) => match &sock.state {
                SockState::Assoc(tcb) if tcb.state == AssocState::Established => Some(Ok(())),
                SockState::Assoc(_) => None,
                other => Some(Err(EngineError::InvalidState {
                    socket,
                    state: other.name(),
                })),
            },
        });

        if let Err(EngineError::Timeout(_)) = result {
            if let Some(sock) = self.lock().sockets.get_mut(&socket) {
                sock.state = SockState::Disconnected;
            }
        }
        result
    }

    fn accept(&self, socket: SocketId) -> Result<SocketId, EngineError> {
        drop(self.lock_initialized()?);
        self.wait_for("accept", |inner| loop {
            let next = match inner.sockets.get_mut(&socket) {
                None => return Some(Err(EngineError::UnknownSocket(socket))),
                Some(Socket {
                    state: SockState::Listening { queue, .. },
                    ..
                }) => queue.pop_front(),
                Some(_) => return Some(Err(EngineError::NotListening)),
            };
            match next {
                None => return None,
                Some(id) if inner.sockets.contains_key(&id) => return Some(Ok(id)),
                Some(_) => continue,
            }
        })
    }

    fn send(&self, socket: SocketId, data: &[u8], info: SendInfo) -> Result<usize, EngineError> {
        if data.len() > limits::MAX_MESSAGE {
            return Err(EngineError::MessageTooLarge(data.len()));
        }
        let mut inner = self.lock_initialized()?;
        let (io, sockets) = inner.split();
        let sock = sockets
            .get_mut(&socket)
            .ok_or(EngineError::UnknownSocket(socket))?;
        let state = sock.state.name();
        let (Some(local), SockState::Assoc(tcb)) = (sock.local, &mut sock.state) else {
            return Err(EngineError::InvalidState { socket, state });
        };
        if tcb.state != AssocState::Established || sock.closed_at.is_some() {
            return Err(EngineError::InvalidState {
                socket,
                state: tcb.state.name(),
            });
        }
        if info.stream >= tcb.outbound_streams {
            return Err(EngineError::InvalidStream(info.stream));
        }
        if data.is_empty() {
            return Ok(0);
        }

        let record_end = !sock.options.explicit_eor || info.eor;
        let begins = !tcb.open_records.contains(&info.stream);
        let ssn = if info.unordered {
            0
        } else {
            *tcb.next_ssn.entry(info.stream).or_default()
        };

        let pieces = data.chunks(limits::MAX_FRAGMENT);
        let count = pieces.len();
        for (i, piece) in pieces.enumerate() {
            let mut chunk_flags = 0;
            if info.unordered {
                chunk_flags |= flags::DATA_UNORDERED;
            }
            if i == 0 && begins {
                chunk_flags |= flags::DATA_BEGIN;
            }
            if i + 1 == count && record_end {
                chunk_flags |= flags::DATA_END;
            }
            let value = DataChunk {
                flags: chunk_flags,
                tsn: tcb.next_tsn,
                stream: info.stream,
                ssn,
                ppid: info.ppid,
                payload: piece,
            }
            .encode();
            tcb.next_tsn = tcb.next_tsn.wrapping_add(1);
            io.send_chunks(
                local,
                tcb.peer_port,
                tcb.peer_tag,
                &[(chunk::DATA, chunk_flags, value)],
            )?;
        }

        if record_end {
            tcb.open_records.remove(&info.stream);
            if !info.unordered {
                tcb.next_ssn.insert(info.stream, ssn.wrapping_add(1));
            }
        } else {
            tcb.open_records.insert(info.stream);
        }
        Ok(data.len())
    }

    fn close(&self, socket: SocketId) -> Result<(), EngineError> {
        self.close_socket(socket)
    }

    fn is_established(&self, socket: SocketId) -> bool {
        matches!(
            self.lock().sockets.get(&socket),
            Some(Socket {
                state: SockState::Assoc(tcb),
                closed_at: None,
                ..
            }) if tcb.state == AssocState::Established
        )
    }
}
