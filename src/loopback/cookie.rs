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

//! State cookie handed out in INIT ACK.
//!
//! The listener keeps no per-handshake state; everything needed to build the
//! association travels in the cookie, authenticated with HMAC-SHA256 under a
//! per-engine secret.

use bytes::{Buf, BufMut, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::loopback::wire::Features;

type HmacSha256 = Hmac<Sha256>;

const BODY_LEN: usize = 24;
const MAC_LEN: usize = 16;
pub const COOKIE_LEN: usize = BODY_LEN + MAC_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateCookie {
    pub local_tag: u32,
    pub peer_tag: u32,
    pub local_tsn: u32,
    pub peer_tsn: u32,
    pub peer_port: u16,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub features: Features,
}

pub struct CookieJar {
    secret: [u8; 32],
}

impl CookieJar {
    pub fn new() -> Self {
        Self {
            secret: rand::random(),
        }
    }

    fn mac(&self) -> HmacSha256 {
        HmacSha256::new_from_slice(&self.secret).expect("HMAC can take key of any size")
    }

    pub fn bake(&self, cookie: &StateCookie) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(COOKIE_LEN);
        buf.put_u32(cookie.local_tag);
        buf.put_u32(cookie.peer_tag);
        buf.put_u32(cookie.local_tsn);
        buf.put_u32(cookie.peer_tsn);
        buf.put_u16(cookie.peer_port);
        buf.put_u16(cookie.outbound_streams);
        buf.put_u16(cookie.inbound_streams);
        buf.put_u8(cookie.features.to_bits());
        buf.put_u8(0);

        let mut mac = self.mac();
        mac.update(&buf);
        let tag = mac.finalize().into_bytes();
        buf.put_slice(&tag[..MAC_LEN]);
        buf.to_vec()
    }

    /// Verifies and decodes a cookie echoed back by a peer.
    pub fn open(&self, raw: &[u8]) -> Option<StateCookie> {
        if raw.len() != COOKIE_LEN {
            return None;
        }
        let (body, tag) = raw.split_at(BODY_LEN);
        let mut mac = self.mac();
        mac.update(body);
        mac.verify_truncated_left(tag).ok()?;

        let mut body = body;
        Some(StateCookie {
            local_tag: body.get_u32(),
            peer_tag: body.get_u32(),
            local_tsn: body.get_u32(),
            peer_tsn: body.get_u32(),
            peer_port: body.get_u16(),
            outbound_streams: body.get_u16(),
            inbound_streams: body.get_u16(),
            features: Features::from_bits(body.get_u8()),
        })
    }
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::new()
    }
}
