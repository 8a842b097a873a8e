// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use anyhow::{Context, Result, ensure};
use serde_json::{Map, Value};
use tracing::warn;

/// JSON configuration document at `<root>/config.json`, addressed by dotted
/// paths. Reads tolerate a missing file or key by returning `None`; writes
/// re-serialize the whole document with two-space indentation.
pub struct ConfigStore {
    root: PathBuf,
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn open(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref().to_path_buf();
        let path = root.join("config.json");
        Self {
            root,
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn public_dir(&self) -> PathBuf {
        self.root.join("public")
    }

    pub fn automation_dir(&self) -> PathBuf {
        self.root.join("automation")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.root.join("resources")
    }

    /// Creates the directory skeleton the process expects.
    pub fn make_dirs(&self) -> Result<()> {
        for dir in [
            self.public_dir(),
            self.automation_dir(),
            self.resources_dir(),
            self.root.join("logs"),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {dir:?}"))?;
        }
        Ok(())
    }

    fn load_json(&self) -> Result<Value> {
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {:?}", self.path))?;
        serde_json::from_str(&raw).context("config.json is not valid JSON")
    }

    /// The whole document. A missing file reads as an empty object.
    pub fn load_full(&self) -> Value {
        self.load_json().unwrap_or_else(|_| Value::Object(Map::new()))
    }

    /// The value at a dotted path, or `None` when any part of the path is
    /// missing. Lookup failures are logged, not raised.
    pub fn load_var(&self, path: &str) -> Option<Value> {
        let data = match self.load_json() {
            Ok(v) => v,
            Err(e) => {
                warn!("failed loading `{path}` from config: {e:#}");
                return None;
            },
        };
        crate::utils::dict_var(&data, path).cloned()
    }

    /// Sets the value at a dotted path, creating intermediate objects, and
    /// rewrites the file.
    pub fn set_var(&self, path: &str, value: Value) -> Result<()> {
        ensure!(!path.is_empty(), "config path must not be empty");
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| anyhow::anyhow!("config write lock poisoned"))?;

        let mut data = self.load_full();
        {
            let mut cursor = &mut data;
            let parts: Vec<&str> = path.split('.').collect();
            for part in &parts[..parts.len() - 1] {
                if !cursor.is_object() {
                    *cursor = Value::Object(Map::new());
                }
                cursor = cursor
                    .as_object_mut()
                    .context("config root is not an object")?
                    .entry(part.to_string())
                    .or_insert(Value::Object(Map::new()));
            }
            if !cursor.is_object() {
                *cursor = Value::Object(Map::new());
            }
            if let Some(last) = parts.last() {
                cursor
                    .as_object_mut()
                    .context("config parent is not an object")?
                    .insert((*last).to_string(), value);
            }
        }

        let mut serialized = serde_json::to_string_pretty(&data)?;
        serialized.push('\n');
        fs::write(&self.path, serialized)
            .with_context(|| format!("failed to write {:?}", self.path))
    }

    /// Exports the `environ` config key as process environment variables.
    /// The key holds either an inline object or the name of a JSON file
    /// relative to the install root.
    pub fn load_envvars(&self) -> Result<()> {
        let Some(vars) = self.load_var("environ") else {
            return Ok(());
        };

        let vars = match vars {
            Value::String(file) => {
                let raw = fs::read_to_string(self.root.join(&file))
                    .with_context(|| format!("failed to read environ file {file}"))?;
                serde_json::from_str::<Value>(&raw)
                    .context("environ file is not valid JSON")?
            },
            other => other,
        };

        let Value::Object(map) = vars else {
            return Ok(());
        };

        for (key, value) in map {
            let rendered = crate::utils::plain_string(&value);
            // Single-threaded startup; nothing else reads the environment yet.
            unsafe {
                std::env::set_var(&key, rendered);
            }
        }
        Ok(())
    }
}
