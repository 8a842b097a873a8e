// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Shapes sensor data for a particular consumer. An instance is built per
/// request from the request body, fed by the sensor, then asked for its
/// JSON contribution, extra headers and an optional status override.
pub trait OutputDevice: Send {
    /// Data pushed in by the sensor being queried.
    fn feed(&mut self, data: Map<String, Value>);

    /// The JSON object merged into the accumulating response.
    fn api_resp(&self) -> Map<String, Value>;

    fn api_headers(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Status code and message after this output's contribution.
    fn api_response(&self, orig: (u16, String)) -> (u16, String) {
        orig
    }
}

/// Plain JSON output: every fed value is stringified under its own key.
pub struct DefaultOutput {
    data: Map<String, Value>,
}

impl DefaultOutput {
    pub fn new(body: Map<String, Value>) -> Self {
        Self { data: body }
    }
}

impl OutputDevice for DefaultOutput {
    fn feed(&mut self, data: Map<String, Value>) {
        for (key, value) in data {
            self.data.insert(key, value);
        }
    }

    fn api_resp(&self) -> Map<String, Value> {
        self.data.clone()
    }
}

pub type OutputFactory = Box<dyn Fn(Map<String, Value>) -> Box<dyn OutputDevice> + Send + Sync>;

/// Output device registry. `default` is always present.
pub struct OutputRegistry {
    outputs: HashMap<String, OutputFactory>,
}

impl OutputRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            outputs: HashMap::new(),
        };
        registry.register("default", Box::new(|body| Box::new(DefaultOutput::new(body))));
        registry
    }

    pub fn register(&mut self, name: &str, factory: OutputFactory) {
        self.outputs.insert(name.to_lowercase(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.outputs.contains_key(&name.to_lowercase())
    }

    /// Builds an output instance parameterized by the request body. Falls
    /// back to `default` for unknown names.
    pub fn build(&self, name: &str, body: Map<String, Value>) -> Box<dyn OutputDevice> {
        match self.outputs.get(&name.to_lowercase()) {
            Some(factory) => factory(body),
            None => Box::new(DefaultOutput::new(body)),
        }
    }
}

impl Default for OutputRegistry {
    fn default() -> Self {
        Self::new()
    }
}
