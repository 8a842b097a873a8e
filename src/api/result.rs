// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use serde_json::{Map, Value, json};

use crate::http::WebResponse;

/// Composable outcome of one pipeline stage (C8).
///
/// Carries a success flag, an optional JSON value and an optional raw
/// payload. Stages fold into one `ApiResult` left to right; raw payloads
/// override JSON in the final encoding.
#[derive(Debug, Clone)]
pub struct ApiResult {
    success: bool,
    json: Option<Value>,
    raw: Option<(Vec<u8>, String)>,
}

impl ApiResult {
    pub fn by_success(success: bool) -> Self {
        Self {
            success,
            json: None,
            raw: None,
        }
    }

    pub fn by_msg(msg: impl Into<String>, success: bool) -> Self {
        Self::by_json(json!({"message": msg.into()}), success)
    }

    pub fn by_json(value: Value, success: bool) -> Self {
        Self {
            success,
            json: Some(value),
            raw: None,
        }
    }

    pub fn by_data(data: Vec<u8>, mime: impl Into<String>, success: bool) -> Self {
        Self {
            success,
            json: None,
            raw: Some((data, mime.into())),
        }
    }

    pub fn empty() -> Self {
        Self::by_json(Value::Object(Map::new()), true)
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn json(&self) -> Option<&Value> {
        self.json.as_ref()
    }

    pub fn raw(&self) -> Option<&(Vec<u8>, String)> {
        self.raw.as_ref()
    }

    /// Folds another stage's result into this one under `name`: success
    /// AND-combines, the other's JSON is inserted at `name` when our JSON is
    /// an object, and a raw payload replaces any previous raw.
    pub fn combine(&mut self, name: &str, other: ApiResult) {
        self.success = self.success && other.success;

        if let Some(other_json) = other.json
            && let Some(Value::Object(map)) = self.json.as_mut()
        {
            map.insert(name.to_string(), other_json);
        }
        if other.raw.is_some() {
            self.raw = other.raw;
        }
    }

    /// Merges a flat map into our JSON object, the way sensor outputs
    /// contribute to the accumulating response.
    pub fn merge_object(&mut self, data: Map<String, Value>) {
        if let Some(Value::Object(map)) = self.json.as_mut() {
            for (key, value) in data {
                map.insert(key, value);
            }
        }
    }

    /// Encodes into a wire response: raw payload wins, then JSON objects as
    /// `application/json`, then the stringified scalar. 200 OK on success,
    /// 500 NOK otherwise.
    pub fn webresponse(self) -> WebResponse {
        let (code, msg) = if self.success {
            (200, "OK")
        } else {
            (500, "NOK")
        };

        if let Some((data, mime)) = self.raw {
            return WebResponse::with_body(code, msg, (data, mime));
        }

        match self.json {
            Some(value @ Value::Object(_)) => WebResponse::json(code, msg, &value),
            Some(scalar) => WebResponse::with_body(
                code,
                msg,
                (
                    crate::utils::plain_string(&scalar).into_bytes(),
                    "text/plain".to_string(),
                ),
            ),
            None => WebResponse::new(code, msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_nests_under_name() {
        let mut acc = ApiResult::empty();
        acc.combine("plants", ApiResult::by_json(json!({"status": "OK"}), true));
        acc.combine("ntfy", ApiResult::by_msg("sent", true));

        assert!(acc.success());
        assert_eq!(
            acc.json(),
            Some(&json!({
                "plants": {"status": "OK"},
                "ntfy": {"message": "sent"},
            }))
        );
    }

    #[test]
    fn test_combine_success_is_and() {
        let mut acc = ApiResult::empty();
        acc.combine("a", ApiResult::by_success(true));
        assert!(acc.success());
        acc.combine("b", ApiResult::by_success(false));
        assert!(!acc.success());
        acc.combine("c", ApiResult::by_success(true));
        assert!(!acc.success(), "success must not revive");
    }

    #[test]
    fn test_raw_overrides_and_repeated_raw_replaces() {
        let mut acc = ApiResult::empty();
        acc.combine("j", ApiResult::by_json(json!({"k": 1}), true));
        acc.combine("r1", ApiResult::by_data(b"one".to_vec(), "text/html", true));
        acc.combine("r2", ApiResult::by_data(b"two".to_vec(), "text/html", true));
        acc.combine("j2", ApiResult::by_json(json!({"k": 2}), true));

        let resp = acc.webresponse();
        assert_eq!(resp.body, b"two", "last raw wins and JSON does not revive");
        assert_eq!(resp.mime, "text/html");
    }

    #[test]
    fn test_combine_is_associative_for_distinct_names() {
        let a = ApiResult::by_json(json!({"x": 1}), true);
        let b = ApiResult::by_json(json!({"y": 2}), true);
        let c = ApiResult::by_json(json!({"z": 3}), true);

        let mut left = ApiResult::empty();
        left.combine("a", a.clone());
        left.combine("b", b.clone());
        left.combine("c", c.clone());

        let mut right = ApiResult::empty();
        right.combine("a", a);
        right.combine("b", b);
        right.combine("c", c);

        assert_eq!(left.json(), right.json());
    }

    #[test]
    fn test_webresponse_encoding() {
        let ok = ApiResult::by_msg("Done", true).webresponse();
        assert_eq!((ok.code, ok.msg.as_str()), (200, "OK"));
        assert_eq!(ok.mime, "application/json");

        let nok = ApiResult::by_success(false).webresponse();
        assert_eq!((nok.code, nok.msg.as_str()), (500, "NOK"));

        let scalar = ApiResult::by_json(json!(42), true).webresponse();
        assert_eq!(scalar.mime, "text/plain");
        assert_eq!(scalar.body, b"42");
    }
}
