// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Peer sessions: registered devices, their tokens and permission levels,
//! and the remote-call proxy back to the peer.

#![allow(clippy::module_inception)]
pub mod device;
pub mod permissions;

use std::{net::IpAddr, sync::Arc};

use dashmap::DashMap;
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::{device::device::Device, http::WebResponse};

/// Process-wide, IP-keyed session map. A device record is created
/// exclusively by `login` and replaced wholesale when the same peer logs in
/// again, which invalidates its previous tokens in the same operation.
pub struct DeviceRegistry {
    devices: DashMap<IpAddr, Arc<Device>>,
    server_version: f64,
}

impl DeviceRegistry {
    pub fn new(server_version: f64) -> Self {
        Self {
            devices: DashMap::new(),
            server_version,
        }
    }

    /// Handles a `/login` body and registers the device.
    pub fn login(&self, ip: IpAddr, body: &Map<String, Value>) -> WebResponse {
        let device = match Device::from_login(ip, body) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                debug!("rejected login from {ip}: {e:#}");
                return WebResponse::json(
                    400,
                    "BAD_BODY",
                    &json!({"message": "Body has bad content"}),
                );
            },
        };

        let update = self.server_version > device.version();
        info!(
            "device {ip} logged in ({}, v{})",
            device.os(),
            device.version()
        );
        let token = device.token_hex();
        self.devices.insert(ip, device);

        WebResponse::json(
            200,
            "LOGGED_IN",
            &json!({
                "message": "Device logged in",
                "token": token,
                "update": update,
            }),
        )
    }

    pub fn get(&self, ip: IpAddr) -> Option<Arc<Device>> {
        self.devices.get(&ip).map(|d| d.value().clone())
    }

    /// Drops the registration. The record itself is returned so callers can
    /// still reach the peer (e.g. for a close probe).
    pub fn logout(&self, ip: IpAddr) -> Option<Arc<Device>> {
        let removed = self.devices.remove(&ip).map(|(_, d)| d);
        if removed.is_some() {
            info!("device {ip} logged out");
        }
        removed
    }

    /// Shutdown path: asks every peer to close and drops the registry.
    pub fn close_all(&self) {
        for entry in self.devices.iter() {
            entry.value().close();
        }
        self.devices.clear();
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
