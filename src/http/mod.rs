// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Line-oriented HTTP/1.1-like codec carried over the framed encrypted
//! stream. Strict CRLF on emit, lenient on parse.

pub mod client;

use std::{
    collections::HashMap,
    io::{Read, Write},
    net::IpAddr,
    str::FromStr,
};

use anyhow::{Context, Result};
use flate2::{
    Compression,
    write::{DeflateEncoder, GzEncoder},
};
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use tracing::debug;
use url::form_urlencoded;

use crate::{SERVER_NAME, encryption::framed::FramedStream, errors::NetError, utils::CiMap};

pub const HTTP_VERSION: &str = "HTTP/1.1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebMethod {
    Get,
    Post,
    Put,
    Options,
    Secure,
}

impl WebMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebMethod::Get => "GET",
            WebMethod::Post => "POST",
            WebMethod::Put => "PUT",
            WebMethod::Options => "OPTIONS",
            WebMethod::Secure => "SECURE",
        }
    }

    pub fn has_body(&self) -> bool {
        matches!(self, WebMethod::Post | WebMethod::Put)
    }
}

impl FromStr for WebMethod {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "GET" => Ok(WebMethod::Get),
            "POST" => Ok(WebMethod::Post),
            "PUT" => Ok(WebMethod::Put),
            "OPTIONS" => Ok(WebMethod::Options),
            "SECURE" => Ok(WebMethod::Secure),
            other => Err(NetError::BadRequest(format!("unknown method `{other}`"))),
        }
    }
}

/// A response under construction: status, extra headers and a typed body.
#[derive(Debug, Clone)]
pub struct WebResponse {
    pub code: u16,
    pub msg: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub mime: String,
}

impl WebResponse {
    pub fn new(code: u16, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            headers: HashMap::new(),
            body: Vec::new(),
            mime: "text/plain".to_string(),
        }
    }

    pub fn with_body(code: u16, msg: impl Into<String>, body: (Vec<u8>, String)) -> Self {
        let mut resp = Self::new(code, msg);
        resp.body = body.0;
        resp.mime = body.1;
        resp
    }

    pub fn json(code: u16, msg: impl Into<String>, value: &Value) -> Self {
        Self::with_body(code, msg, json_body(value))
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

impl Default for WebResponse {
    fn default() -> Self {
        Self::new(500, "NOT_IMPLEMENTED")
    }
}

/// Serializes a JSON value into a body tuple.
pub fn json_body(value: &Value) -> (Vec<u8>, String) {
    (
        serde_json::to_vec(value).unwrap_or_default(),
        "application/json".to_string(),
    )
}

/// A fully parsed inbound request.
#[derive(Debug, Clone)]
pub struct RecvRequest {
    pub method: WebMethod,
    pub path: String,
    pub version: String,
    pub get_args: Map<String, Value>,
    pub headers: CiMap,
    pub body: Option<Vec<u8>>,
    pub peer: IpAddr,
}

impl RecvRequest {
    /// Decodes the body as a JSON object when the peer declared one.
    /// Anything else reads as an empty map. Doubly-encoded JSON strings are
    /// unwrapped.
    pub fn decode_body(&self) -> Map<String, Value> {
        let declared = self.headers.get("content-type").unwrap_or_default();
        if !declared.trim().starts_with("application/json") {
            if !declared.is_empty() {
                debug!("body not recognized: {declared}");
            }
            return Map::new();
        }

        let raw = match &self.body {
            Some(b) if !b.is_empty() => String::from_utf8_lossy(b).into_owned(),
            _ => return Map::new(),
        };

        let mut value: Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(_) => return Map::new(),
        };
        while let Value::String(inner) = value {
            value = match serde_json::from_str(&inner) {
                Ok(v) => v,
                Err(_) => return Map::new(),
            };
        }

        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// Reads one request off the stream: status line, headers, then the body
/// when `Content-Length` says there is one.
pub fn read_request<S: Read + Write>(
    stream: &mut FramedStream<S>,
    peer: IpAddr,
) -> Result<RecvRequest> {
    let status = stream.read_line()?;
    let mut parts = status.split_whitespace();

    let method: WebMethod = parts
        .next()
        .ok_or_else(|| NetError::BadRequest("empty status line".into()))?
        .parse()?;
    let target = parts
        .next()
        .ok_or_else(|| NetError::BadRequest("status line has no target".into()))?;
    let version = parts.collect::<Vec<_>>().join(" ");

    let (raw_path, query) = match target.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (target, None),
    };
    let path = percent_decode_str(raw_path).decode_utf8_lossy().into_owned();

    let mut get_args = Map::new();
    if let Some(query) = query {
        for (key, value) in form_urlencoded::parse(query.as_bytes()) {
            if value.is_empty() {
                get_args.insert(key.into_owned(), Value::Bool(true));
            } else {
                get_args.insert(key.into_owned(), Value::String(value.into_owned()));
            }
        }
    }

    let mut headers = CiMap::new();
    loop {
        let line = stream.read_line()?;
        if line.trim().is_empty() {
            break;
        }
        match line.split_once(':') {
            Some((key, value)) => headers.insert(key.trim(), value.trim().to_string()),
            None => headers.insert(line.trim(), String::new()),
        }
    }

    let body = if method.has_body() {
        match headers.get("content-length") {
            Some(raw_len) => {
                let len: usize = raw_len.trim().parse().map_err(|_| {
                    NetError::BadRequest(format!("non-integer Content-Length `{raw_len}`"))
                })?;
                Some(stream.recv(len)?.to_vec())
            },
            None => None,
        }
    } else {
        None
    };

    Ok(RecvRequest {
        method,
        path,
        version: if version.is_empty() {
            HTTP_VERSION.to_string()
        } else {
            version
        },
        get_args,
        headers,
        body,
        peer,
    })
}

/// Writes a complete response and flushes the message boundary. Compression
/// is negotiated against the request's `Accept-Encoding` and applied only
/// when it actually shrinks the body.
pub fn write_response<S: Read + Write>(
    stream: &mut FramedStream<S>,
    resp: &WebResponse,
    request: Option<&RecvRequest>,
) -> Result<()> {
    let version = request
        .map(|r| r.version.as_str())
        .filter(|v| !v.is_empty())
        .unwrap_or(HTTP_VERSION);

    stream.send(format!("{version} {} {}\r\n", resp.code, resp.msg).as_bytes())?;

    send_header(stream, "Server", SERVER_NAME)?;
    send_header(stream, "Access-Control-Allow-Origin", "*")?;
    send_header(stream, "Access-Control-Allow-Methods", "POST, GET, OPTIONS")?;
    send_header(stream, "Access-Control-Allow-Headers", "*")?;

    for (key, value) in &resp.headers {
        send_header(stream, key, value)?;
    }

    if resp.body.is_empty() {
        stream.send(b"\r\n")?;
        stream.flush()?;
        return Ok(());
    }

    send_header(stream, "Content-Type", &resp.mime)?;

    let accept = request.and_then(|r| r.headers.get("accept-encoding"));
    let (payload, encoding) = match accept {
        Some(accept) => negotiate_encoding(&resp.body, accept),
        None => (resp.body.clone(), None),
    };
    if let Some(encoding) = encoding {
        send_header(stream, "Content-Encoding", &encoding)?;
    }

    send_header(stream, "Content-Length", &payload.len().to_string())?;
    stream.send(b"\r\n")?;
    stream.send(&payload)?;
    stream.flush()?;
    Ok(())
}

fn send_header<S: Read + Write>(
    stream: &mut FramedStream<S>,
    key: &str,
    value: &str,
) -> Result<()> {
    stream.send(format!("{key}: {value}\r\n").as_bytes())
}

/// Applies every accepted encoding in a fixed order and keeps the result
/// only when strictly shorter than the original.
fn negotiate_encoding(orig: &[u8], accept: &str) -> (Vec<u8>, Option<String>) {
    let accepts: Vec<&str> = accept.split(',').map(str::trim).collect();

    let mut body = orig.to_vec();
    let mut used: Vec<&str> = Vec::new();
    for name in ["deflate", "gzip"] {
        if !accepts.contains(&name) {
            continue;
        }
        match apply_encoding(name, &body) {
            Ok(encoded) => {
                body = encoded;
                used.push(name);
            },
            Err(e) => debug!("{name} encoding failed: {e:#}"),
        }
    }

    if used.is_empty() || orig.len() <= body.len() {
        (orig.to_vec(), None)
    } else {
        (body, Some(used.join(", ")))
    }
}

fn apply_encoding(name: &str, data: &[u8]) -> Result<Vec<u8>> {
    match name {
        "deflate" => {
            let mut enc = DeflateEncoder::new(Vec::new(), Compression::best());
            enc.write_all(data)?;
            enc.finish().context("deflate failed")
        },
        "gzip" => {
            let mut enc = GzEncoder::new(Vec::new(), Compression::best());
            enc.write_all(data)?;
            enc.finish().context("gzip failed")
        },
        other => anyhow::bail!("unsupported encoding {other}"),
    }
}
