// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    collections::HashMap,
    net::IpAddr,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use serde_json::{Map, Value, json};
use tracing::{debug, error, info};

use crate::{
    api::{ApiContext, FunctionRegistry, result::ApiResult},
    backend::{output::OutputRegistry, sensor::SensorRegistry},
    device::{DeviceRegistry, permissions::PermissionLevel},
    http::{RecvRequest, WebResponse},
    server::{RequestHandler, sitescript::SiteScriptRegistry},
};

/// The pipeline dispatcher (C10). A request path is split into slash
/// segments, each `name.arg…`; every segment is claimed by the first stage
/// that recognizes it, composing one `ApiResult` across the whole request.
pub struct BackendRouter {
    registry: Arc<DeviceRegistry>,
    outputs: OutputRegistry,
    sensors: SensorRegistry,
    functions: FunctionRegistry,
    allow_localhost: bool,
    public_dir: Option<PathBuf>,
    site_scripts: SiteScriptRegistry,
    running: Arc<AtomicBool>,
}

/// What a finished segment loop hands back to the response encoder.
struct Accumulated {
    result: ApiResult,
    headers: HashMap<String, String>,
    status: Option<(u16, String)>,
}

enum SegmentOutcome {
    Continue,
    Finish(WebResponse),
}

impl BackendRouter {
    pub fn new(
        registry: Arc<DeviceRegistry>,
        outputs: OutputRegistry,
        sensors: SensorRegistry,
        functions: FunctionRegistry,
        allow_localhost: bool,
    ) -> Self {
        Self {
            registry,
            outputs,
            sensors,
            functions,
            allow_localhost,
            public_dir: None,
            site_scripts: SiteScriptRegistry::new(),
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn with_public_dir(mut self, dir: PathBuf) -> Self {
        self.public_dir = Some(dir);
        self
    }

    pub fn with_site_scripts(mut self, scripts: SiteScriptRegistry) -> Self {
        self.site_scripts = scripts;
        self
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    fn route(&self, req: &RecvRequest) -> WebResponse {
        // Query-string arguments seed the body; a JSON body wins on clashes.
        let mut body = req.get_args.clone();
        for (key, value) in req.decode_body() {
            body.insert(key, value);
        }

        let segments: Vec<Vec<String>> = req
            .path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|seg| seg.split('.').map(str::to_string).collect())
            .collect();

        let mut acc = Accumulated {
            result: ApiResult::empty(),
            headers: HashMap::new(),
            status: None,
        };
        let mut output_name = "default".to_string();
        let mut level: Option<PermissionLevel> = None;

        for fargs in &segments {
            match self.run_segment(req, &body, fargs, &mut acc, &mut output_name, &mut level)
            {
                SegmentOutcome::Continue => {},
                SegmentOutcome::Finish(resp) => return resp,
            }
        }

        let mut resp = acc.result.webresponse();
        for (key, value) in acc.headers {
            resp.headers.insert(key, value);
        }
        if let Some((code, msg)) = acc.status
            && resp.code == 200
        {
            resp.code = code;
            resp.msg = msg;
        }
        resp
    }

    #[allow(clippy::too_many_arguments)]
    fn run_segment(
        &self,
        req: &RecvRequest,
        body: &Map<String, Value>,
        fargs: &[String],
        acc: &mut Accumulated,
        output_name: &mut String,
        level: &mut Option<PermissionLevel>,
    ) -> SegmentOutcome {
        let name = fargs[0].to_lowercase();

        // Stage 1: login creates the device and finishes immediately.
        if name == "login" {
            return SegmentOutcome::Finish(self.registry.login(req.peer, body));
        }

        // Stage 2: resolve the peer's device and permission level once.
        if level.is_none() {
            match self.resolve_permissions(req) {
                Ok(resolved) => *level = Some(resolved),
                Err(resp) => return SegmentOutcome::Finish(*resp),
            }
        }
        let permission = level.clone().unwrap_or_default();

        // Stage 3: logout drops the registration.
        if name == "logout" && self.registry.get(req.peer).is_some() {
            self.registry.logout(req.peer);
            return SegmentOutcome::Finish(WebResponse::json(
                200,
                "LOGGED_OUT",
                &json!({"message": "Logout successful!"}),
            ));
        }

        // Trusted shutdown path.
        if name == "close" && req.peer.is_loopback() {
            info!("close request received");
            self.running.store(false, Ordering::SeqCst);
            return SegmentOutcome::Finish(WebResponse::json(
                200,
                "CLOSED",
                &json!({"message": "Closed!"}),
            ));
        }

        // Stage 4: output device selection for subsequent sensor segments.
        if let Some(selected) = name.strip_prefix(':')
            && self.outputs.contains(selected)
        {
            *output_name = selected.to_string();
            return SegmentOutcome::Continue;
        }

        // Stage 5: sensor query through the chosen output.
        if let Some(cell) = self.sensors.get(&name) {
            debug!("{name} sensor chosen");
            if let Err(e) = cell.tpoll() {
                return SegmentOutcome::Finish(Self::func_failed(fargs, &e));
            }
            let mut output = self.outputs.build(output_name, body.clone());
            cell.emit(&mut *output, &fargs[1..]);

            acc.result.merge_object(output.api_resp());
            acc.headers.extend(output.api_headers());
            let status = acc
                .status
                .clone()
                .unwrap_or_else(|| (200, "OK".to_string()));
            let status = output.api_response(status);
            if status != (200, "OK".to_string()) {
                acc.status = Some(status);
            }
            return SegmentOutcome::Continue;
        }

        // Stage 6: backend action plugin, permission gated.
        if let Some(mut function) = self.functions.instantiate(&name) {
            let required = function.permissions(50);
            if permission.int_level() < required {
                return SegmentOutcome::Finish(WebResponse::json(
                    403,
                    "NO_PERMS",
                    &json!({
                        "message": format!(
                            "Not enough permissions to execute `{}`!",
                            fargs.join(".")
                        )
                    }),
                ));
            }

            let ctx = ApiContext {
                peer: Some(req.peer),
                headers: req.headers.clone(),
                args: fargs[1..].to_vec(),
                body: body.clone(),
            };
            match function.api(&ctx) {
                Ok(result) => acc.result.combine(&name, result),
                Err(e) => return SegmentOutcome::Finish(Self::func_failed(fargs, &e)),
            }
            return SegmentOutcome::Continue;
        }

        // Stage 7: action advertised by the caller's device, proxied out.
        if let Some(device) = permission.device().cloned()
            && device.has_remote_fun(&name)
        {
            match device.call_remote(fargs, body, &req.headers) {
                Ok(remote) => {
                    if remote.code != 200 {
                        acc.status = Some((remote.code, remote.msg.clone()));
                    }
                    acc.headers.extend(remote.headers.clone());
                    acc.result.combine(&name, Self::remote_result(remote));
                },
                Err(e) => return SegmentOutcome::Finish(Self::func_failed(fargs, &e)),
            }
            return SegmentOutcome::Continue;
        }

        SegmentOutcome::Finish(WebResponse::json(
            404,
            "FUNC_NOT_FOUND",
            &json!({
                "message": format!("API function `{}` not found!", fargs.join("."))
            }),
        ))
    }

    /// Stage 2: missing device leaves `Default`; a registered device
    /// demands a matching bearer token. Localhost may bypass the check when
    /// explicitly enabled.
    fn resolve_permissions(
        &self,
        req: &RecvRequest,
    ) -> Result<PermissionLevel, Box<WebResponse>> {
        let Some(device) = self.registry.get(req.peer) else {
            return Ok(PermissionLevel::Default);
        };

        let bypass = self.allow_localhost && req.peer.is_loopback();

        let Some(header) = req.headers.get("authorization") else {
            if bypass {
                return Ok(PermissionLevel::Max(device));
            }
            return Err(Box::new(WebResponse::json(
                401,
                "INVALID_TOK",
                &json!({"message": "No token provided"}),
            )));
        };

        match device.check_token(header) {
            PermissionLevel::Default if bypass => Ok(PermissionLevel::Max(device)),
            PermissionLevel::Default => Err(Box::new(WebResponse::json(
                401,
                "INVALID_TOK",
                &json!({"message": "The token provided is not valid"}),
            ))),
            resolved => Ok(resolved),
        }
    }

    /// Shapes a proxied response per its content type: JSON merges, raw
    /// payloads override.
    fn remote_result(remote: WebResponse) -> ApiResult {
        let success = remote.code < 400;
        if remote.mime.starts_with("application/json")
            && let Ok(value) = serde_json::from_slice::<Value>(&remote.body)
        {
            return ApiResult::by_json(value, success);
        }
        ApiResult::by_data(remote.body, remote.mime, success)
    }

    fn func_failed(fargs: &[String], err: &anyhow::Error) -> WebResponse {
        error!("exception on {}: {err:#}", fargs.join("."));
        let mut diagnostic = format!("{err:#}");
        diagnostic.truncate(512);
        WebResponse::json(
            500,
            "FUNC_FAILED",
            &json!({
                "message": format!("Function `{}` failed!", fargs.join(".")),
                "exception": diagnostic,
            }),
        )
    }

    /// Side door for the event bus and automations: stage 6 only, no auth,
    /// no permission gate, no HTTP framing.
    pub fn execute_local(
        &self,
        fargs: &[String],
        body: &Map<String, Value>,
    ) -> anyhow::Result<ApiResult> {
        anyhow::ensure!(!fargs.is_empty(), "empty local dispatch path");
        let name = fargs[0].to_lowercase();

        let Some(mut function) = self.functions.instantiate(&name) else {
            anyhow::bail!("no backend function for `{}`", fargs.join("."));
        };
        let ctx = ApiContext::local(fargs[1..].to_vec(), body.clone());
        function.api(&ctx)
    }

    /// Side door for automation queries: stage 5 only, emitted through the
    /// default output.
    pub fn query_sensor(
        &self,
        fargs: &[String],
        body: &Map<String, Value>,
    ) -> anyhow::Result<Map<String, Value>> {
        anyhow::ensure!(!fargs.is_empty(), "empty sensor query path");
        let name = fargs[0].to_lowercase();

        let Some(cell) = self.sensors.get(&name) else {
            anyhow::bail!("no sensor named `{name}`");
        };
        cell.tpoll()?;

        let mut output = self.outputs.build("default", body.clone());
        cell.emit(&mut *output, &fargs[1..]);
        Ok(output.api_resp())
    }
}

impl RequestHandler for BackendRouter {
    fn handle(&self, req: &RecvRequest) -> WebResponse {
        self.route(req)
    }

    fn public_dir(&self) -> Option<PathBuf> {
        self.public_dir.clone()
    }

    fn site_scripts(&self) -> Option<&SiteScriptRegistry> {
        Some(&self.site_scripts)
    }
}
