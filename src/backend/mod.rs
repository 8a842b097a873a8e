// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Backend node assembly: registries, scheduler, event bus, automations,
//! discovery listener and the router-backed web server.

pub mod automation;
pub mod event;
pub mod expr;
pub mod interval;
pub mod output;
pub mod plugins;
pub mod router;
pub mod sensor;

use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    VERSION,
    backend::{
        automation::Automation, event::EventBus, event::EventType, interval::Scheduler,
        output::OutputRegistry, router::BackendRouter, sensor::SensorRegistry,
    },
    cfg::config::ConfigStore,
    device::{DeviceRegistry, device::DEV_PORT},
    discovery::server::MulticastServer,
    server::WebServer,
};

/// Everything the backend owns. Built once by `run`; the pieces talk to
/// each other through the references wired here, not through globals.
pub struct Backend {
    pub registry: Arc<DeviceRegistry>,
    pub scheduler: Scheduler,
    pub events: EventBus,
    pub router: Arc<BackendRouter>,
}

impl Backend {
    /// Wires the backend services together. Sensor and output registries
    /// start with the built-ins; device-specific plugins register here
    /// before `serve`.
    pub fn build(
        config: Arc<ConfigStore>,
        sensors: SensorRegistry,
        outputs: OutputRegistry,
    ) -> Self {
        let registry = Arc::new(DeviceRegistry::new(VERSION));
        let scheduler = Scheduler::new();
        let events = EventBus::new();

        let functions = plugins::builtin_functions(events.clone(), Arc::clone(&config));
        let allow_localhost =
            matches!(config.load_var("auth.allow_localhost"), Some(Value::Bool(true)));

        let router = Arc::new(
            BackendRouter::new(
                Arc::clone(&registry),
                outputs,
                sensors,
                functions,
                allow_localhost,
            )
            .with_public_dir(config.public_dir()),
        );
        events.attach_dispatcher(Arc::downgrade(&router));

        Self {
            registry,
            scheduler,
            events,
            router,
        }
    }

    /// Loads declarations, starts the background services and blocks on
    /// the accept loop until a trusted close arrives.
    pub fn serve(&self, config: &ConfigStore) -> Result<()> {
        let automation_dir = config.automation_dir();
        match self.events.load_all(&automation_dir) {
            Ok(count) => info!("loaded {count} event declarations"),
            Err(e) => warn!("event load failed: {e:#}"),
        }
        match Automation::load_all(&automation_dir, &self.router, &self.scheduler) {
            Ok(count) => info!("loaded {count} automations"),
            Err(e) => warn!("automation load failed: {e:#}"),
        }

        self.events.start();
        self.scheduler.start();

        match MulticastServer::new(&config.resources_dir(), &config.public_dir()) {
            Ok(multicast) => Arc::new(multicast).background_listen(),
            Err(e) => warn!("discovery listener did not start: {e:#}"),
        }

        self.events.trigger_all(EventType::Startup);

        let server = WebServer::with_flag(
            DEV_PORT,
            Arc::clone(&self.router) as Arc<dyn crate::server::RequestHandler>,
            self.router.running_flag(),
        );
        server.start_blocking()?;

        self.shutdown();
        Ok(())
    }

    /// Graceful shutdown: tell every peer to close, then drop the registry.
    pub fn shutdown(&self) {
        info!("shutting down, closing {} devices", self.registry.len());
        self.events.trigger_all(EventType::Shutdown);
        self.scheduler.stop();
        self.registry.close_all();
    }
}

/// Entry point for `joanet backend`.
pub fn run(config: Arc<ConfigStore>) -> Result<i32> {
    info!("starting [BACKEND]...");
    let backend = Backend::build(config.clone(), SensorRegistry::new(), OutputRegistry::new());
    backend
        .serve(&config)
        .context("backend server failed")?;
    Ok(0)
}
