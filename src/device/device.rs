// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{net::IpAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::{
    device::permissions::PermissionLevel,
    http::{WebMethod, WebResponse, client::WebClient},
    utils::{CiMap, make_device_token},
};

/// TCP port both node roles listen on.
pub const DEV_PORT: u16 = 4001;

/// Timeout for the best-effort close probe sent at shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_millis(100);

/// A secondary credential scoped to a device, granting reduced permissions.
#[derive(Debug, Clone, Deserialize)]
pub struct SubDevice {
    pub name: String,
    pub token: String,
}

/// One logged-in peer. Created by the `login` pipeline stage, replaced on
/// re-login, dropped on logout or shutdown.
#[derive(Debug)]
pub struct Device {
    ip: IpAddr,
    token: [u8; 16],
    remote_funcs: Vec<String>,
    subdevices: Vec<SubDevice>,
    os: String,
    version: f64,
}

impl Device {
    /// Builds a device from the `/login` body. Missing keys fall back to
    /// sensible defaults; a fresh token is generated here.
    pub fn from_login(ip: IpAddr, body: &Map<String, Value>) -> Result<Self> {
        let subdevices: Vec<SubDevice> = match body.get("subdevices") {
            Some(v) => serde_json::from_value(v.clone())
                .context("malformed `subdevices` in login body")?,
            None => Vec::new(),
        };

        let mut remote_funcs = vec!["logout".to_string()];
        if let Some(funcs) = body.get("funcs") {
            let names: Vec<String> = serde_json::from_value(funcs.clone())
                .context("malformed `funcs` in login body")?;
            for name in names {
                let name = name.to_lowercase();
                if !remote_funcs.contains(&name) {
                    debug!("remote function {name} added for {ip}");
                    remote_funcs.push(name);
                }
            }
        }

        Ok(Self {
            ip,
            token: make_device_token(),
            remote_funcs,
            subdevices,
            os: body
                .get("os")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            version: body.get("version").and_then(Value::as_f64).unwrap_or(0.0),
        })
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn os(&self) -> &str {
        &self.os
    }

    pub fn version(&self) -> f64 {
        self.version
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    /// Resolves an `Authorization` header value into a permission level.
    /// Tokens compare case-insensitively after whitespace strip; the
    /// device's own token grants `Max`, a subdevice token `Subdev`.
    pub fn check_token(self: &Arc<Self>, header: &str) -> PermissionLevel {
        let presented = header
            .trim()
            .strip_prefix("BEARER")
            .unwrap_or(header)
            .trim()
            .to_lowercase();

        if presented == self.token_hex() {
            return PermissionLevel::Max(Arc::clone(self));
        }
        for sub in &self.subdevices {
            if presented == sub.token.trim().to_lowercase() {
                return PermissionLevel::Subdev(Arc::clone(self));
            }
        }
        PermissionLevel::Default
    }

    /// Whether the peer advertised this remote-callable action at login.
    pub fn has_remote_fun(&self, name: &str) -> bool {
        self.remote_funcs.contains(&name.to_lowercase())
    }

    /// Forwards a call to the peer's frontend over a fresh `SECURE`
    /// connection and returns the response verbatim.
    pub fn call_remote(
        &self,
        fargs: &[String],
        body: &Map<String, Value>,
        _recv_headers: &CiMap,
    ) -> Result<WebResponse> {
        anyhow::ensure!(
            self.has_remote_fun(&fargs[0]),
            "the function provided could not be found: {}",
            fargs.join(".")
        );

        let response = WebClient::new(self.ip, DEV_PORT)
            .set_secure(true)
            .set_method(WebMethod::Post)
            .set_path(format!("/{}", fargs.join(".")))
            .authorize(Some(&self.token_hex()))
            .set_json(Value::Object(body.clone()))
            .send()?;

        let mime = response.content_type().to_string();
        let mut out = WebResponse::with_body(
            response.code,
            response.msg.clone(),
            (response.body.clone(), mime),
        );
        for (key, value) in response.headers.iter() {
            out.headers.insert(key.clone(), value.clone());
        }
        Ok(out)
    }

    /// Best-effort close request sent to the peer at shutdown.
    pub fn close(&self) {
        let result = WebClient::new(self.ip, DEV_PORT)
            .set_timeout(CLOSE_TIMEOUT)
            .set_path("/close")
            .send();
        if let Err(e) = result {
            debug!("close request for {} failed: {e:#}", self.ip);
        }
    }
}
