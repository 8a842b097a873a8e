// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::Path,
    sync::{Arc, Condvar, Mutex, Weak},
    thread,
};

use anyhow::{Context, Result};
use chrono::{Local, Timelike};
use once_cell::sync::{Lazy, OnceCell};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::backend::{expr, router::BackendRouter};

/// The closed set of event kinds nodes can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum EventType {
    #[serde(rename = "STARTUP")]
    Startup,
    #[serde(rename = "SHUTDOWN")]
    Shutdown,
    #[serde(rename = "LOGIN")]
    Login,
    #[serde(rename = "LOGOUT")]
    Logout,
}

impl std::str::FromStr for EventType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "STARTUP" => Ok(EventType::Startup),
            "SHUTDOWN" => Ok(EventType::Shutdown),
            "LOGIN" => Ok(EventType::Login),
            "LOGOUT" => Ok(EventType::Logout),
            other => anyhow::bail!("unknown event type `{other}`"),
        }
    }
}

/// One `(path, body)` action fired when an event triggers.
#[derive(Debug, Clone, Deserialize)]
pub struct EventAction {
    pub path: String,
    #[serde(default)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct EventFile {
    #[serde(rename = "@type")]
    kind: String,
    event: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    then: Vec<EventAction>,
    #[serde(default)]
    time: Option<String>,
}

/// A loaded event declaration.
#[derive(Debug, Clone)]
pub struct EventDecl {
    pub event: EventType,
    pub title: String,
    pub then: Vec<EventAction>,
    pub time: Option<String>,
}

/// Matches `$HH:MM` / `$HH:MM:SS` tokens inside a time predicate.
static TIME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$([0-1]?[0-9]|2[0-3]):([0-5][0-9])(:([0-5][0-9]))?")
        .expect("time pattern is valid")
});

fn seconds_of_day(h: u32, m: u32, s: u32) -> u32 {
    h * 3600 + m * 60 + s
}

impl EventDecl {
    /// Evaluates the time predicate at `now_secs` seconds since local
    /// midnight. Absent predicates are true; anything that fails to parse
    /// or evaluate to a boolean is false.
    pub fn check_time(&self, now_secs: u32) -> bool {
        let Some(template) = &self.time else {
            return true;
        };

        let mut substitutions: Vec<(String, u32)> = Vec::new();
        for caps in TIME_PATTERN.captures_iter(template) {
            let Some(full) = caps.get(0) else { continue };
            let h: u32 = caps.get(1).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            let m: u32 = caps.get(2).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            let s: u32 = caps.get(4).map_or(0, |m| m.as_str().parse().unwrap_or(0));
            substitutions.push((full.as_str().to_string(), seconds_of_day(h, m, s)));
        }

        let mut resolved = template.replace("$now", &now_secs.to_string());
        // Longer tokens first so `$20:00` never clobbers `$20:00:30`.
        substitutions.sort_by_key(|(token, _)| std::cmp::Reverse(token.len()));
        for (token, value) in substitutions {
            resolved = resolved.replace(&token, &value.to_string());
        }

        match expr::eval_bool(&resolved) {
            Ok(result) => result,
            Err(e) => {
                debug!("time predicate `{template}` did not evaluate: {e:#}");
                false
            },
        }
    }
}

/// Typed event dispatcher (C6): declarations loaded from JSON files, a
/// trigger queue drained by a worker thread, and time-gated actions routed
/// through the router's local dispatch.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

struct EventBusInner {
    events: Mutex<Vec<EventDecl>>,
    queue: Mutex<Vec<EventType>>,
    wakeup: Condvar,
    dispatcher: OnceCell<Weak<BackendRouter>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                events: Mutex::new(Vec::new()),
                queue: Mutex::new(Vec::new()),
                wakeup: Condvar::new(),
                dispatcher: OnceCell::new(),
            }),
        }
    }

    /// Wires the dispatcher after router construction; called once at
    /// startup.
    pub fn attach_dispatcher(&self, router: Weak<BackendRouter>) {
        let _ = self.inner.dispatcher.set(router);
    }

    /// Loads every `{"@type": "event"}` declaration in `dir`, skipping
    /// files whose names start with `_`. Load failures are logged and the
    /// offending file is skipped.
    pub fn load_all(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        let entries = fs::read_dir(dir).with_context(|| format!("cannot read {dir:?}"))?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || !name.ends_with(".json") {
                continue;
            }

            match self.load_file(&entry.path()) {
                Ok(true) => loaded += 1,
                Ok(false) => {},
                Err(e) => warn!("event file {name} did not load: {e:#}"),
            }
        }
        Ok(loaded)
    }

    fn load_file(&self, path: &Path) -> Result<bool> {
        let raw = fs::read_to_string(path)?;
        let parsed: Value = serde_json::from_str(&raw)?;
        if parsed.get("@type").and_then(Value::as_str) != Some("event") {
            return Ok(false);
        }

        let file: EventFile = serde_json::from_value(parsed)?;
        debug_assert_eq!(file.kind, "event");
        let decl = EventDecl {
            event: file.event.parse()?,
            title: file.title.unwrap_or_else(|| "No title!".to_string()),
            then: file.then,
            time: file.time,
        };

        debug!("loading event {}", decl.title);
        self.add_event(decl);
        Ok(true)
    }

    pub fn add_event(&self, decl: EventDecl) {
        if let Ok(mut events) = self.inner.events.lock() {
            events.push(decl);
        }
    }

    /// Enqueues a type for the worker and wakes it.
    pub fn trigger_all(&self, event: EventType) {
        if let Ok(mut queue) = self.inner.queue.lock() {
            queue.push(event);
        }
        self.inner.wakeup.notify_one();
    }

    /// Starts the worker thread that drains the queue and fires matching
    /// declarations in registration order.
    pub fn start(&self) {
        let bus = self.clone();
        let spawned = thread::Builder::new()
            .name("EventThread".to_string())
            .spawn(move || bus.worker());
        if let Err(e) = spawned {
            warn!("failed to spawn event worker: {e}");
        }
    }

    fn worker(&self) {
        loop {
            let drained: Vec<EventType> = {
                let Ok(mut queue) = self.inner.queue.lock() else {
                    return;
                };
                while queue.is_empty() {
                    queue = match self.inner.wakeup.wait(queue) {
                        Ok(guard) => guard,
                        Err(_) => return,
                    };
                }
                queue.drain(..).collect()
            };

            let now = Local::now();
            let now_secs = seconds_of_day(now.hour(), now.minute(), now.second());

            for event in drained {
                let matching: Vec<EventDecl> = self
                    .inner
                    .events
                    .lock()
                    .map(|events| {
                        events
                            .iter()
                            .filter(|decl| decl.event == event && decl.check_time(now_secs))
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();

                for decl in matching {
                    self.fire(&decl);
                }
            }
        }
    }

    fn fire(&self, decl: &EventDecl) {
        let Some(router) = self.inner.dispatcher.get().and_then(Weak::upgrade) else {
            warn!("event `{}` triggered before dispatcher attach", decl.title);
            return;
        };

        for action in &decl.then {
            let fargs: Vec<String> = action
                .path
                .trim_matches('/')
                .split('.')
                .map(str::to_string)
                .collect();
            if let Err(e) = router.execute_local(&fargs, &action.body) {
                warn!("[{}] action `{}` failed: {e:#}", decl.title, action.path);
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
