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

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sctp_conn_fuzz::harness::inject::build_packet;
use sctp_conn_fuzz::harness_core::constants::fuzz::DEFAULT_INPUT;
use sctp_conn_fuzz::loopback::wire::{Chunks, CommonHeader};
use sctp_conn_fuzz::{Harness, HarnessConfig, LoopbackEngine, Side};
use std::sync::Arc;

fn bench_build_packet(c: &mut Criterion) {
    let header = [0u8; 12];
    c.bench_function("build_packet_default_input", |b| {
        b.iter(|| build_packet(black_box(&header), black_box(DEFAULT_INPUT)))
    });
}

fn bench_parse_packet(c: &mut Criterion) {
    let mut packet = vec![0, 2, 0, 2, 0, 0, 0, 1, 0, 0, 0, 0];
    packet.extend_from_slice(&[4, 0, 0, 12, 0, 1, 0, 8, 1, 2, 3, 4]);
    c.bench_function("parse_heartbeat_packet", |b| {
        b.iter(|| {
            if let Ok((_, area)) = CommonHeader::parse(black_box(&packet)) {
                for chunk in Chunks::new(area) {
                    let _ = black_box(chunk);
                }
            }
        })
    });
}

fn bench_reused_iteration(c: &mut Criterion) {
    let engine = Arc::new(LoopbackEngine::default());
    let mut harness = match Harness::new(engine, HarnessConfig::fast()) {
        Ok(harness) => harness,
        Err(e) => panic!("harness setup failed: {}", e),
    };
    if let Err(e) = harness.bootstrap() {
        panic!("bootstrap failed: {}", e);
    }

    c.bench_function("iteration_reuse_default_input", |b| {
        b.iter(|| {
            let _ = harness.run_iteration(Side::Server, black_box(DEFAULT_INPUT));
        })
    });
}

criterion_group!(
    benches,
    bench_build_packet,
    bench_parse_packet,
    bench_reused_iteration
);
criterion_main!(benches);
