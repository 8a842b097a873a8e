// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    io::{Read, Write},
    net::{IpAddr, SocketAddr, TcpStream},
    str::FromStr,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use num_bigint::BigUint;
use serde_json::Value;
use tracing::debug;

use crate::{
    SERVER_NAME, VERSION,
    encryption::{cipher::AesCbcCipher, dh::DhExchange, framed::FramedStream},
    errors::NetError,
    http::{HTTP_VERSION, WebMethod},
    utils::CiMap,
};

/// Outbound request builder. Opens a fresh TCP connection per `send`; when
/// `secure` is set, the connection is upgraded with the `SECURE` handshake
/// before the actual request goes out encrypted.
pub struct WebClient {
    ip: IpAddr,
    port: u16,
    method: WebMethod,
    path: String,
    headers: Vec<(String, String)>,
    json: Option<Value>,
    data: Option<(Vec<u8>, String)>,
    secure: bool,
    timeout: Option<Duration>,
}

impl WebClient {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self {
            ip,
            port,
            method: WebMethod::Get,
            path: "/".to_string(),
            headers: Self::default_headers(),
            json: None,
            data: None,
            secure: false,
            timeout: None,
        }
    }

    pub fn set_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn set_method(mut self, method: WebMethod) -> Self {
        self.method = method;
        self
    }

    pub fn set_path(mut self, path: impl Into<String>) -> Self {
        let path = path.into();
        self.path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        self
    }

    pub fn add_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn set_json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    pub fn set_data(mut self, data: Vec<u8>, mime: impl Into<String>) -> Self {
        self.data = Some((data, mime.into()));
        self
    }

    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Attaches `Authorization: BEARER <token>` when a token is present.
    pub fn authorize(self, token: Option<&str>) -> Self {
        match token {
            Some(token) => self.add_header("Authorization", format!("BEARER {token}")),
            None => self,
        }
    }

    /// Sends the request and reads the peer's response.
    pub fn send(mut self) -> Result<ClientResponse> {
        debug!(
            "sending {} {} to {}:{}",
            self.method.as_str(),
            self.path,
            self.ip,
            self.port
        );

        let addr = SocketAddr::new(self.ip, self.port);
        let sock = match self.timeout {
            Some(t) => TcpStream::connect_timeout(&addr, t),
            None => TcpStream::connect(addr),
        }
        .map_err(|e| NetError::PeerUnreachable(format!("{addr}: {e}")))?;
        if let Some(t) = self.timeout {
            sock.set_read_timeout(Some(t))?;
            sock.set_write_timeout(Some(t))?;
        }

        let mut stream = FramedStream::new(sock);

        if self.secure {
            self.send_secure(&mut stream)?;
        }
        self.send_request(&mut stream)?;

        ClientResponse::read(&mut stream)
    }

    /// Performs the client half of the `SECURE` upgrade on a fresh
    /// connection: plaintext `SECURE * HTTP/1.1` with `DH-E`, a `101` reply
    /// carrying `DH-F`, then the cipher switch.
    fn send_secure<S: Read + Write>(&self, stream: &mut FramedStream<S>) -> Result<()> {
        let mut dh = DhExchange::new();

        stream.send(
            format!(
                "{} * {HTTP_VERSION}\r\nDH-E: {}\r\n\r\n",
                WebMethod::Secure.as_str(),
                dh.public_value()
            )
            .as_bytes(),
        )?;
        stream.flush()?;

        let reply = ClientResponse::read(stream)?;
        ensure!(
            reply.code == 101,
            NetError::PeerUnreachable(format!(
                "SECURE upgrade refused with {} {}",
                reply.code, reply.msg
            ))
        );
        let f_raw = reply
            .headers
            .get("dh-f")
            .ok_or_else(|| NetError::BadRequest("101 reply without DH-F".into()))?;
        let f = BigUint::from_str(f_raw.trim())
            .map_err(|_| NetError::BadRequest(format!("malformed DH-F `{f_raw}`")))?;
        dh.read_peer(&f);

        debug!("finished SECURE handshake with {}, changing encryption", self.ip);
        stream.update_cipher(AesCbcCipher::new(dh.session_key()?, dh.session_iv()?).into());
        Ok(())
    }

    fn send_request<S: Read + Write>(&mut self, stream: &mut FramedStream<S>) -> Result<()> {
        if self.method.has_body() && self.data.is_none() {
            let json = self.json.take().unwrap_or_else(|| Value::Object(Default::default()));
            self.data = Some((
                serde_json::to_vec(&json)?,
                "application/json".to_string(),
            ));
        }

        if self.method.has_body()
            && let Some((data, mime)) = &self.data
        {
            self.headers.push(("Content-Type".to_string(), mime.clone()));
            self.headers
                .push(("Content-Length".to_string(), data.len().to_string()));
        }

        stream.send(
            format!("{} {} {HTTP_VERSION}\r\n", self.method.as_str(), self.path).as_bytes(),
        )?;
        for (key, value) in &self.headers {
            stream.send(format!("{key}: {value}\r\n").as_bytes())?;
        }
        stream.send(b"\r\n")?;

        if self.method.has_body()
            && let Some((data, _)) = &self.data
        {
            stream.send(data)?;
        }
        stream.flush()?;
        Ok(())
    }

    fn default_headers() -> Vec<(String, String)> {
        vec![
            ("Accept".to_string(), "*/*".to_string()),
            ("Cache-Control".to_string(), "no-cache".to_string()),
            (
                "User-Agent".to_string(),
                format!("{SERVER_NAME}/{VERSION}"),
            ),
        ]
    }
}

/// A parsed peer response: status, headers and the raw body.
#[derive(Debug, Clone)]
pub struct ClientResponse {
    pub code: u16,
    pub msg: String,
    pub headers: CiMap,
    pub body: Vec<u8>,
}

impl ClientResponse {
    /// Reads status line, headers and - when announced - the body. The
    /// stream stays usable, which the `SECURE` handshake relies on.
    pub fn read<S: Read + Write>(stream: &mut FramedStream<S>) -> Result<Self> {
        let status = stream.read_line()?;
        let mut parts = status.splitn(3, ' ');
        let _version = parts
            .next()
            .ok_or_else(|| NetError::BadRequest("empty status line".into()))?;
        let code: u16 = parts
            .next()
            .ok_or_else(|| NetError::BadRequest("status line has no code".into()))?
            .parse()
            .context("non-integer status code")?;
        let msg = parts.next().unwrap_or_default().trim().to_string();

        let mut headers = CiMap::new();
        loop {
            let line = stream.read_line()?;
            if line.trim().is_empty() {
                break;
            }
            if let Some((key, value)) = line.split_once(':') {
                headers.insert(key.trim(), value.trim().to_string());
            }
        }

        let body = match (headers.get("content-type"), headers.get("content-length")) {
            (Some(_), Some(raw_len)) => {
                let len: usize = raw_len
                    .trim()
                    .parse()
                    .context("non-integer Content-Length in response")?;
                stream.recv(len)?.to_vec()
            },
            _ => Vec::new(),
        };

        Ok(Self {
            code,
            msg,
            headers,
            body,
        })
    }

    pub fn ok(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_slice(&self.body).context("response body is not valid JSON")
    }

    pub fn content_type(&self) -> &str {
        self.headers
            .get("content-type")
            .unwrap_or("application/octet-stream")
    }
}
