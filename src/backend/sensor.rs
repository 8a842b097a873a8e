// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::debug;

use crate::backend::output::OutputDevice;

/// A pollable, cached data source.
pub trait Sensor: Send + Sync {
    /// Reads fresh data from the underlying source.
    fn poll(&self) -> Result<Map<String, Value>>;

    /// Feeds cached data into an output device. The default shape passes
    /// everything through; sensors override to shape per device kind.
    fn to(&self, output: &mut dyn OutputDevice, data: &Map<String, Value>, _args: &[String]) {
        output.feed(data.clone());
    }
}

struct SensorState {
    data: Option<Map<String, Value>>,
    last_poll: f64,
}

/// Wraps a sensor with its cache, re-poll window and the in-flight latch.
/// Concurrent callers of `tpoll` spin at 100 ms granularity until the
/// current poll finishes and then share its result.
pub struct SensorCell {
    sensor: Box<dyn Sensor>,
    state: Mutex<SensorState>,
    polling: AtomicBool,
    repoll_after: f64,
}

impl SensorCell {
    pub fn new(sensor: Box<dyn Sensor>, repoll_after: f64) -> Self {
        Self {
            sensor,
            state: Mutex::new(SensorState {
                data: None,
                last_poll: 0.0,
            }),
            polling: AtomicBool::new(false),
            repoll_after,
        }
    }

    /// Polls through the re-poll guard: a fresh poll only happens when the
    /// cached data has aged out and no other caller is already polling.
    pub fn tpoll(&self) -> Result<()> {
        if self.polling.swap(true, Ordering::SeqCst) {
            debug!("falling into wait loop");
            while self.polling.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
            return Ok(());
        }

        let result = self.poll_guarded();
        self.polling.store(false, Ordering::SeqCst);
        result
    }

    fn poll_guarded(&self) -> Result<()> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let needs_poll = {
            let state = self
                .state
                .lock()
                .map_err(|_| anyhow::anyhow!("sensor state poisoned"))?;
            now > state.last_poll + self.repoll_after || state.data.is_none()
        };
        if !needs_poll {
            return Ok(());
        }

        let data = self.sensor.poll().context("sensor poll failed")?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("sensor state poisoned"))?;
        state.data = Some(data);
        state.last_poll = now;
        Ok(())
    }

    pub fn data(&self) -> Option<Map<String, Value>> {
        self.state.lock().ok().and_then(|s| s.data.clone())
    }

    /// Emits the cached data into an output device.
    pub fn emit(&self, output: &mut dyn OutputDevice, args: &[String]) {
        if let Some(data) = self.data() {
            self.sensor.to(output, &data, args);
        }
    }
}

/// Name-keyed sensor registry, one cell per sensor.
#[derive(Default)]
pub struct SensorRegistry {
    sensors: HashMap<String, Arc<SensorCell>>,
}

impl SensorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a sensor with a 5 s default re-poll window.
    pub fn register(&mut self, name: &str, sensor: Box<dyn Sensor>) {
        self.register_with_window(name, sensor, 5.0);
    }

    pub fn register_with_window(&mut self, name: &str, sensor: Box<dyn Sensor>, repoll: f64) {
        self.sensors
            .insert(name.to_lowercase(), Arc::new(SensorCell::new(sensor, repoll)));
    }

    pub fn get(&self, name: &str) -> Option<Arc<SensorCell>> {
        self.sensors.get(&name.to_lowercase()).cloned()
    }
}
