// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::{Ipv4Addr, UdpSocket},
    path::Path,
};

use anyhow::{Context, Result};
use md5::{Digest, Md5};
use rand::RngExt;
use serde_json::Value;

/// Case-insensitive string map. Keys are folded to lowercase on insert and
/// lookup; used for HTTP headers on both sides of the wire.
#[derive(Debug, Clone, Default)]
pub struct CiMap {
    data: HashMap<String, String>,
}

impl CiMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.data.insert(key.to_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(&key.to_lowercase()).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(&key.to_lowercase())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.data.iter()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl<const N: usize> From<[(&str, &str); N]> for CiMap {
    fn from(pairs: [(&str, &str); N]) -> Self {
        let mut map = CiMap::new();
        for (k, v) in pairs {
            map.insert(k, v);
        }
        map
    }
}

/// Generates a fresh 16-byte device token by hashing 10 random bytes.
pub fn make_device_token() -> [u8; 16] {
    let mut seed = [0u8; 10];
    rand::rng().fill(&mut seed[..]);

    let mut hasher = Md5::new();
    hasher.update(seed);
    hasher.finalize().into()
}

/// OS label reported at login, e.g. `linux x86_64`.
pub fn get_os_name() -> String {
    format!("{} {}", std::env::consts::OS, std::env::consts::ARCH)
}

/// Local IPv4 of the default route. Opens a UDP socket towards a public
/// address; no packet is actually sent.
pub fn local_ipv4() -> Result<Ipv4Addr> {
    let sock = UdpSocket::bind(("0.0.0.0", 0)).context("failed to bind probe socket")?;
    sock.connect(("8.8.8.8", 80))
        .context("failed to pick default route")?;

    match sock.local_addr().context("no local address")?.ip() {
        std::net::IpAddr::V4(v4) => Ok(v4),
        std::net::IpAddr::V6(v6) => {
            anyhow::bail!("expected an IPv4 local address, got {v6}")
        },
    }
}

/// Resolves a dotted path (`a.b.0.c`) inside a JSON document. Array segments
/// are numeric indices. Returns `None` on any miss.
pub fn dict_var<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    let mut cur = root;
    for part in path.split('.') {
        cur = match cur {
            Value::Object(map) => map.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

/// Renders a JSON value the way it reads inside an expression: strings are
/// unquoted, everything else keeps its JSON form.
pub fn plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// MIME type by file extension for the public file server.
pub fn mime_by_ext(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "text/javascript",
        "json" => "application/json",
        "txt" => "text/plain",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "zip" => "application/zip",
        "pem" | "rsa" => "application/x-pem-file",
        _ => "application/octet-stream",
    }
}
