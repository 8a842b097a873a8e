// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, Mutex, Weak},
};

use anyhow::{Context, Result, ensure};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::{
    backend::{
        expr,
        interval::{Executor, Scheduler, TimedExecutor},
        router::BackendRouter,
    },
    utils::{dict_var, plain_string},
};

/// One side of the IF/WAIT pair: a sensor query, a boolean check over its
/// result and the body handed to the query (which also declares `$vars`).
#[derive(Debug, Clone, Deserialize)]
pub struct Clause {
    pub query: String,
    pub check: String,
    #[serde(default)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct AutomationAction {
    path: String,
    #[serde(default)]
    body: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct AutomationFile {
    #[serde(rename = "@type")]
    kind: String,
    title: String,
    frequency: f64,
    #[serde(rename = "if")]
    if_clause: Clause,
    then: Vec<AutomationAction>,
    #[serde(default)]
    wait: Option<Clause>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutomationState {
    Normal,
    Waiting,
}

/// A declarative IF/THEN/WAIT state machine (C11), ticked by a
/// `Timed(frequency)` executor and speaking to the router's local dispatch.
pub struct Automation {
    title: String,
    frequency: f64,
    if_clause: Clause,
    then: Vec<AutomationAction>,
    wait_clause: Option<Clause>,
    state: AutomationState,
    vars: HashMap<String, String>,
    router: Weak<BackendRouter>,
}

impl Automation {
    /// Parses a declaration; returns `None` when the file is some other
    /// `@type`.
    pub fn from_value(data: Value, router: Weak<BackendRouter>) -> Result<Option<Self>> {
        if data.get("@type").and_then(Value::as_str) != Some("automation") {
            return Ok(None);
        }

        let file: AutomationFile = serde_json::from_value(data)?;
        debug_assert_eq!(file.kind, "automation");
        ensure!(file.frequency > 0.0, "frequency must be positive");

        Ok(Some(Self {
            title: file.title,
            frequency: file.frequency,
            if_clause: file.if_clause,
            then: file.then,
            wait_clause: file.wait,
            state: AutomationState::Normal,
            vars: HashMap::new(),
            router,
        }))
    }

    /// Loads every automation file in `dir` and registers its executor.
    pub fn load_all(
        dir: &Path,
        router: &Arc<BackendRouter>,
        scheduler: &Scheduler,
    ) -> Result<usize> {
        let mut loaded = 0;
        let entries = fs::read_dir(dir).with_context(|| format!("cannot read {dir:?}"))?;

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('_') || !name.ends_with(".json") {
                continue;
            }

            let parsed: Result<Option<Automation>> = (|| {
                let raw = fs::read_to_string(entry.path())?;
                let data: Value = serde_json::from_str(&raw)?;
                Automation::from_value(data, Arc::downgrade(router))
            })();

            match parsed {
                Ok(Some(automation)) => {
                    automation.attach(scheduler);
                    loaded += 1;
                },
                Ok(None) => {},
                Err(e) => warn!("could not load automation file {name}: {e:#}"),
            }
        }
        Ok(loaded)
    }

    /// Registers the ticking executor for this automation.
    pub fn attach(self, scheduler: &Scheduler) {
        let frequency = self.frequency;
        let shared = Arc::new(Mutex::new(self));
        scheduler.register(Executor::Timed(TimedExecutor::new(
            frequency,
            Box::new(move || {
                if let Ok(mut automation) = shared.lock() {
                    automation.tick();
                }
            }),
        )));
    }

    pub fn state(&self) -> AutomationState {
        self.state
    }

    /// One transition: `Normal` runs `then` and starts waiting once `if`
    /// holds; `Waiting` returns to `Normal` once `wait` holds. Failures are
    /// logged and leave the state untouched.
    pub fn tick(&mut self) {
        match self.transition() {
            Ok(Some(next)) => self.state = next,
            Ok(None) => {},
            Err(e) => warn!("[{}] failed tick: {e:#}", self.title),
        }
    }

    fn transition(&mut self) -> Result<Option<AutomationState>> {
        match self.state {
            AutomationState::Normal => {
                debug!("checking IF tick for {}", self.title);
                let clause = self.if_clause.clone();
                if self.check(&clause)? {
                    debug!("executing THEN for {}", self.title);
                    self.run_then();
                    return Ok(Some(AutomationState::Waiting));
                }
                Ok(None)
            },
            AutomationState::Waiting => {
                debug!("checking WAIT tick for {}", self.title);
                let clause = self
                    .wait_clause
                    .clone()
                    .context("automation has no wait clause")?;
                if self.check(&clause)? {
                    return Ok(Some(AutomationState::Normal));
                }
                Ok(None)
            },
        }
    }

    /// Evaluates one clause: query each path part, bind `$vars` from the
    /// merged result, substitute them into `check` and evaluate.
    fn check(&mut self, clause: &Clause) -> Result<bool> {
        let router = self
            .router
            .upgrade()
            .context("router dropped; automation is orphaned")?;

        let mut result = Map::new();
        for part in clause.query.split('/').filter(|p| !p.is_empty()) {
            let fargs: Vec<String> = part.split('.').map(str::to_string).collect();
            let queried = router.query_sensor(&fargs, &clause.body)?;
            for (key, value) in queried {
                result.insert(key, value);
            }
        }

        self.load_vars(&clause.body, &result);
        let resolved = self.inject_vars(&clause.check);
        expr::eval_bool(&resolved)
    }

    /// Binds every `$name` key in the clause body to the value its dotted
    /// path points at inside the query result.
    fn load_vars(&mut self, body: &Map<String, Value>, result: &Map<String, Value>) {
        let doc = Value::Object(result.clone());
        for (key, value) in body {
            if !key.starts_with('$') {
                continue;
            }
            let Value::String(path) = value else { continue };
            match dict_var(&doc, path) {
                Some(found) => {
                    self.vars.insert(key.clone(), plain_string(found));
                },
                None => debug!("[{}] variable {key} path `{path}` not found", self.title),
            }
        }
    }

    /// Longest names first, so `$value2` never gets clobbered by `$value`.
    fn inject_vars(&self, template: &str) -> String {
        let mut names: Vec<&String> = self.vars.keys().collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));

        let mut out = template.to_string();
        for name in names {
            if let Some(value) = self.vars.get(name) {
                out = out.replace(name, value);
            }
        }
        out
    }

    /// Runs the THEN actions through local dispatch, with `$vars`
    /// substituted into string body values.
    fn run_then(&self) {
        let Some(router) = self.router.upgrade() else {
            return;
        };

        for action in &self.then {
            let mut body = action.body.clone();
            for value in body.values_mut() {
                if let Value::String(s) = value {
                    *value = Value::String(self.inject_vars(s));
                }
            }

            for part in action.path.split('/').filter(|p| !p.is_empty()) {
                let fargs: Vec<String> = part.split('.').map(str::to_string).collect();
                if let Err(e) = router.execute_local(&fargs, &body) {
                    warn!(
                        "[{}] could not run `{}`: {e:#}",
                        self.title,
                        fargs.join(".")
                    );
                }
            }
        }
    }
}
