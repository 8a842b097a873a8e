// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::collections::HashMap;

use serde_json::{Map, Value};

/// Page variables produced by a site script run. Values replace `%%NAME%%`
/// tokens in the served file.
#[derive(Debug, Default)]
pub struct PageVars {
    pub vars: HashMap<String, Vec<u8>>,
}

impl PageVars {
    pub fn set(&mut self, name: &str, value: impl Into<Vec<u8>>) {
        self.vars.insert(name.to_string(), value.into());
    }
}

/// A template hook attached to one public file by stem. Registered
/// explicitly at startup; the hook computes page variables per request.
pub trait SiteScript: Send + Sync {
    fn display(&self, get_args: &Map<String, Value>) -> PageVars;
}

/// Stem-keyed site script registry.
#[derive(Default)]
pub struct SiteScriptRegistry {
    scripts: HashMap<String, Box<dyn SiteScript>>,
}

impl SiteScriptRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, stem: &str, script: Box<dyn SiteScript>) {
        self.scripts.insert(stem.to_lowercase(), script);
    }

    pub fn get(&self, stem: &str) -> Option<&dyn SiteScript> {
        self.scripts.get(&stem.to_lowercase()).map(Box::as_ref)
    }
}

/// Substitutes `%%NAME%%` tokens in the file contents.
pub fn render(content: &[u8], vars: &HashMap<String, Vec<u8>>) -> Vec<u8> {
    let mut out = content.to_vec();
    for (name, value) in vars {
        let token = format!("%%{name}%%").into_bytes();
        out = replace_bytes(&out, &token, value);
    }
    out
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    if needle.is_empty() {
        return haystack.to_vec();
    }

    let mut out = Vec::with_capacity(haystack.len());
    let mut i = 0;
    while i < haystack.len() {
        if haystack[i..].starts_with(needle) {
            out.extend_from_slice(replacement);
            i += needle.len();
        } else {
            out.push(haystack[i]);
            i += 1;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StatusScript;

    impl SiteScript for StatusScript {
        fn display(&self, get_args: &Map<String, Value>) -> PageVars {
            let mut vars = PageVars::default();
            vars.set("STATUS", "#00FF00");
            if get_args.contains_key("note") {
                vars.set("NOTE", "all good");
            }
            vars
        }
    }

    #[test]
    fn test_token_substitution() {
        let mut registry = SiteScriptRegistry::new();
        registry.register("status", Box::new(StatusScript));

        let script = registry.get("STATUS").expect("stem lookup is case-insensitive");
        let Value::Object(args) = serde_json::json!({"note": true}) else {
            panic!("fixture")
        };
        let vars = script.display(&args);

        let page = render(b"<b style=\"color:%%STATUS%%\">%%NOTE%%</b>", &vars.vars);
        assert_eq!(page, b"<b style=\"color:#00FF00\">all good</b>");
    }

    #[test]
    fn test_unknown_tokens_survive() {
        let rendered = render(b"keep %%OTHER%%", &HashMap::new());
        assert_eq!(rendered, b"keep %%OTHER%%");
    }
}
