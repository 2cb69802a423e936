// Copyright 2026 BadCompany
// Licensed under the Apache License, Version 2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use sctp_conn_fuzz::loopback::wire::{Chunks, CommonHeader, DataChunk, InitChunk, SackChunk, Tlvs};

fuzz_target!(|data: &[u8]| {
    // No byte sequence may panic the packet parsers.
    let Ok((_, area)) = CommonHeader::parse(data) else {
        return;
    };
    for chunk in Chunks::new(area).flatten() {
        let _ = InitChunk::parse(chunk.value);
        let _ = SackChunk::parse(chunk.value);
        let _ = DataChunk::parse(chunk.flags, chunk.value);
        for _ in Tlvs::new(chunk.value) {}
    }
});
