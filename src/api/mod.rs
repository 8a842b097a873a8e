// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The plugin model: action functions invoked through the router, and the
//! composable result value they produce. Plugins register explicitly at
//! startup as named factories; there is no directory scanning.

pub mod result;

use std::{collections::HashMap, net::IpAddr};

use anyhow::Result;
use serde_json::{Map, Value};

use crate::{api::result::ApiResult, utils::CiMap};

/// Everything a function gets to see about the call: the peer (absent for
/// local dispatch), request headers, the dotted arguments after the
/// function name and the decoded JSON body.
pub struct ApiContext {
    pub peer: Option<IpAddr>,
    pub headers: CiMap,
    pub args: Vec<String>,
    pub body: Map<String, Value>,
}

impl ApiContext {
    /// Context for local dispatch (event bus, automations): no peer, no
    /// headers.
    pub fn local(args: Vec<String>, body: Map<String, Value>) -> Self {
        Self {
            peer: None,
            headers: CiMap::new(),
            args,
            body,
        }
    }
}

/// An action plugin. A fresh instance is built per request by its factory;
/// errors out of `api` surface as `FUNC_FAILED` and abort the composite
/// request.
pub trait ApiFunction: Send {
    /// The permission level required to invoke this function. `default` is
    /// what the router passes (50); override to tighten or loosen.
    fn permissions(&self, default: u8) -> u8 {
        default
    }

    fn api(&mut self, ctx: &ApiContext) -> Result<ApiResult>;
}

pub type ApiFactory = Box<dyn Fn() -> Box<dyn ApiFunction> + Send + Sync>;

/// Name-keyed factory registry. Names are folded to lowercase, matching the
/// router's case-insensitive segment lookup.
#[derive(Default)]
pub struct FunctionRegistry {
    funcs: HashMap<String, ApiFactory>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: &str, factory: ApiFactory) {
        self.funcs.insert(name.to_lowercase(), factory);
    }

    /// Instantiates the function registered under `name`, if any.
    pub fn instantiate(&self, name: &str) -> Option<Box<dyn ApiFunction>> {
        self.funcs.get(&name.to_lowercase()).map(|f| f())
    }

    pub fn names(&self) -> Vec<String> {
        self.funcs.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }
}
