// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! LAN peer discovery: an SSDP-style search over UDP multicast whose
//! replies are signed with the backend's RSA key, so a frontend only trusts
//! the server it ships a public key for.

pub mod client;
pub mod server;

use std::net::Ipv4Addr;

use crate::utils::CiMap;

pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 250);
pub const MULTICAST_PORT: u16 = 1900;

/// Library identifier prefixed to the search target.
pub const MULTICAST_LIBRARY: &str = "urn:joanet";
/// Service identifier echoed in `USN`.
pub const MULTICAST_SERVICE: &str = "device:backend:1";

pub const KEY_SIZE: usize = 2048;

/// Private key file under `<root>/resources/`.
pub const PRIVATE_KEY_FILE: &str = "multicast_priv.rsa";
/// Public key file: written into `public/` by the server, shipped under
/// `resources/` on frontends.
pub const PUBLIC_KEY_FILE: &str = "multicast.rsa";

/// `ST` value both sides agree on.
pub fn search_target() -> String {
    format!("{MULTICAST_LIBRARY}:{MULTICAST_SERVICE}")
}

/// Splits a datagram into its status line and a case-insensitive header map.
/// Lines without a colon are skipped.
pub fn parse_datagram(data: &[u8]) -> (String, CiMap) {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let status = lines.next().unwrap_or_default().trim().to_string();

    let mut headers = CiMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim(), value.trim().to_string());
        }
    }
    (status, headers)
}
