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

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sctp_conn_fuzz::harness_core::constants::fuzz::DEFAULT_INPUT;
use sctp_conn_fuzz::harness_core::traits::ProtocolEngine;
use sctp_conn_fuzz::{Harness, HarnessConfig, LoopbackEngine, Phase, Side};

fn loopback(config: HarnessConfig) -> (Arc<LoopbackEngine>, Harness<LoopbackEngine>) {
    let engine = Arc::new(LoopbackEngine::default());
    let harness = Harness::new(engine.clone(), config).unwrap();
    (engine, harness)
}

#[test]
fn test_bootstrap_reaches_established_with_both_headers() {
    let (engine, mut harness) = loopback(HarnessConfig::default());
    let assoc = harness.bootstrap().unwrap();

    assert_eq!(assoc.port, 2);
    assert_eq!(harness.phase(), Phase::Bootstrapped);
    assert!(engine.is_established(assoc.client));
    assert!(engine.is_established(assoc.server));

    let headers = harness.context().unwrap().headers();
    assert!(headers.is_populated());
    let client = headers.snapshot(Side::Client).unwrap();
    let server = headers.snapshot(Side::Server).unwrap();
    // Source and destination ports are the bootstrap port on both sides.
    assert_eq!(&client[..4], &[0, 2, 0, 2]);
    assert_eq!(&server[..4], &[0, 2, 0, 2]);

    harness.teardown().unwrap();
}

#[test]
fn test_full_iteration_leaves_no_sockets() {
    let (engine, mut harness) = loopback(HarnessConfig::default());
    assert_eq!(harness.run_iteration(Side::Server, DEFAULT_INPUT).unwrap(), 45);
    assert_eq!(harness.phase(), Phase::Closed);
    assert_eq!(engine.socket_count(), 0);
}

#[test]
fn test_empty_input_iteration() {
    let (engine, mut harness) = loopback(HarnessConfig::default());
    assert_eq!(harness.run_iteration(Side::Client, &[]).unwrap(), 12);
    assert_eq!(engine.socket_count(), 0);
}

#[test]
fn test_repeated_full_iterations_rotate_ports() {
    let (engine, mut harness) = loopback(HarnessConfig::default());
    for expected_port in 2..5 {
        let assoc = harness.bootstrap().unwrap();
        assert_eq!(assoc.port, expected_port);
        harness.inject(Side::Server, DEFAULT_INPUT).unwrap();
        harness.finish_iteration().unwrap();
        assert_eq!(engine.socket_count(), 0);
    }
}

#[test]
fn test_reuse_keeps_association() {
    let (_engine, mut harness) = loopback(HarnessConfig::fast());
    let first = harness.bootstrap().unwrap();
    for _ in 0..10 {
        harness.run_iteration(Side::Server, DEFAULT_INPUT).unwrap();
        assert_eq!(harness.association(), Some(first));
    }
}

#[test]
fn test_reuse_rebootstraps_after_injected_abort() {
    let (engine, mut harness) = loopback(HarnessConfig::fast());
    let first = harness.bootstrap().unwrap();

    // A bare ABORT chunk behind the client's header tears the server side down.
    harness.inject(Side::Server, &[6, 0, 0, 4]).unwrap();
    assert!(!engine.is_established(first.server));

    let second = harness.bootstrap().unwrap();
    assert_ne!(second, first);
    assert_eq!(second.port, first.port + 1);
    assert!(engine.is_established(second.client));
    assert!(engine.is_established(second.server));
}

#[test]
fn test_optional_socket_features_bootstrap() {
    let config = HarnessConfig {
        explicit_eor: true,
        interleaving: true,
        stream_reset: true,
        ..HarnessConfig::default()
    };
    let (engine, mut harness) = loopback(config);
    harness.run_iteration(Side::Server, DEFAULT_INPUT).unwrap();
    assert_eq!(engine.socket_count(), 0);
}

#[test]
fn test_reuse_survives_hostile_injections_on_both_sides() {
    let (engine, mut harness) = loopback(HarnessConfig::fast());
    let mut rng = StdRng::seed_from_u64(0x5c7b);
    let mut rebuilt = 0;
    let mut last = harness.bootstrap().unwrap();

    for round in 0..400 {
        let assoc = harness.bootstrap().unwrap();
        assert!(engine.is_established(assoc.client), "round {}", round);
        assert!(engine.is_established(assoc.server), "round {}", round);
        if assoc != last {
            rebuilt += 1;
            last = assoc;
        }

        let target = if round % 2 == 0 { Side::Server } else { Side::Client };
        let input: Vec<u8> = match round % 4 {
            // ABORT
            0 => vec![6, 0, 0, 4],
            // SHUTDOWN acknowledging TSN 0
            1 => vec![7, 0, 0, 8, 0, 0, 0, 0],
            _ => {
                let len = rng.random_range(0..64);
                (0..len).map(|_| rng.random::<u8>()).collect()
            }
        };
        harness.inject(target, &input).unwrap();
        harness.finish_iteration().unwrap();

        assert!(
            engine.socket_count() <= 8,
            "round {}: {} sockets",
            round,
            engine.socket_count()
        );
    }

    assert!(rebuilt > 0);
    harness.teardown().unwrap();
    assert_eq!(engine.socket_count(), 0);
}
