// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use sctp_conn_fuzz::{Harness, HarnessConfig, LoopbackEngine, Side};
use std::sync::{Arc, Mutex, OnceLock};

// One association for the whole run; it is rebuilt only when an input kills it.
static HARNESS: OnceLock<Mutex<Harness<LoopbackEngine>>> = OnceLock::new();

fn harness() -> &'static Mutex<Harness<LoopbackEngine>> {
    HARNESS.get_or_init(|| {
        let engine = Arc::new(LoopbackEngine::default());
        match Harness::new(engine, HarnessConfig::fast()) {
            Ok(harness) => Mutex::new(harness),
            Err(e) => {
                eprintln!("harness setup failed: {}", e);
                std::process::abort();
            }
        }
    })
}

fuzz_target!(|data: &[u8]| {
    let mut harness = harness().lock().unwrap_or_else(|e| e.into_inner());
    if let Err(e) = harness.bootstrap() {
        eprintln!("bootstrap failed: {}", e);
        std::process::abort();
    }
    // Inject into the client side behind the header the peer sent last.
    if let Err(e) = harness.inject(Side::Client, data) {
        eprintln!("injection failed: {}", e);
        std::process::abort();
    }
});
