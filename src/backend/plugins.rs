// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Built-in backend actions. Device-specific plugins live outside the core;
//! these three are the receiving ends of core subsystems: the event bus,
//! the config store and the remote log shipper.

use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;
use tracing::{Level, event};

use crate::{
    api::{ApiContext, ApiFunction, FunctionRegistry, result::ApiResult},
    backend::event::{EventBus, EventType},
    cfg::config::ConfigStore,
};

/// Builds the registry of built-in backend functions.
pub fn builtin_functions(events: EventBus, config: Arc<ConfigStore>) -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();

    let bus = events.clone();
    registry.register(
        "evt",
        Box::new(move || {
            Box::new(EvtFunction {
                events: bus.clone(),
            })
        }),
    );

    let store = Arc::clone(&config);
    registry.register(
        "config",
        Box::new(move || {
            Box::new(ConfigFunction {
                store: Arc::clone(&store),
            })
        }),
    );

    registry.register("log", Box::new(|| Box::new(LogFunction)));

    registry
}

/// `evt.<TYPE>` - dispatch an event type through the bus.
struct EvtFunction {
    events: EventBus,
}

impl ApiFunction for EvtFunction {
    fn permissions(&self, _default: u8) -> u8 {
        100
    }

    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        let Some(name) = ctx.args.first() else {
            return Ok(ApiResult::by_msg("No event type provided!", false));
        };

        match name.parse::<EventType>() {
            Ok(event) => {
                self.events.trigger_all(event);
                Ok(ApiResult::by_msg(format!("Dispatched `{name}`"), true))
            },
            Err(_) => Ok(ApiResult::by_msg(
                "This event type is not registered!",
                true,
            )),
        }
    }
}

/// `config` / `config.set` - read the whole document or set dotted keys
/// from `{"config": {path: value}}`.
struct ConfigFunction {
    store: Arc<ConfigStore>,
}

impl ApiFunction for ConfigFunction {
    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        if ctx.args.is_empty() {
            return Ok(ApiResult::by_json(self.store.load_full(), true));
        }

        let Some(Value::Object(values)) = ctx.body.get("config") else {
            return Ok(ApiResult::by_msg("Argument and body needed", false));
        };

        if ctx.args[0] == "set" {
            for (path, value) in values {
                self.store.set_var(path, value.clone())?;
            }
            return Ok(ApiResult::by_msg("Config value set", true));
        }

        Ok(ApiResult::by_msg(
            format!("Argument {} not recognized!", ctx.args[0]),
            false,
        ))
    }
}

/// `log` - receiving endpoint for records shipped by frontends (C14).
/// Remote-only: local dispatch has no peer to attribute the record to.
struct LogFunction;

impl ApiFunction for LogFunction {
    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult> {
        let Some(peer) = ctx.peer else {
            return Ok(ApiResult::by_msg(
                "You need to remotely request this method!",
                true,
            ));
        };

        if ctx.body.is_empty() {
            return Ok(ApiResult::by_msg("No log object was provided!", true));
        }

        let level = ctx
            .body
            .get("level")
            .and_then(Value::as_str)
            .unwrap_or("INFO")
            .to_uppercase();
        let message = ctx
            .body
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("No message provided!");
        let exception = ctx.body.get("exception").and_then(Value::as_str);

        let mut line = format!("remote log by {peer}: {message}");
        if let Some(exception) = exception {
            line.push('\n');
            line.push_str(exception);
        }

        match level.as_str() {
            "ERROR" | "CRITICAL" => event!(Level::ERROR, "{line}"),
            "WARNING" | "WARN" => event!(Level::WARN, "{line}"),
            "DEBUG" => event!(Level::DEBUG, "{line}"),
            _ => event!(Level::INFO, "{line}"),
        }

        Ok(ApiResult::empty())
    }
}
