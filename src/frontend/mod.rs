// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Frontend node lifecycle (C13): discover the backend, log in over
//! `SECURE`, self-update when the backend says so, then serve
//! backend-initiated calls until a close arrives.

pub mod shipper;

use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use anyhow::{Context, Result, bail, ensure};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::{
    VERSION,
    api::{ApiContext, FunctionRegistry, result::ApiResult},
    cfg::config::ConfigStore,
    device::device::DEV_PORT,
    discovery::client::MulticastClient,
    frontend::shipper::RemoteLogLayer,
    http::{RecvRequest, WebMethod, WebResponse, client::WebClient},
    server::{RequestHandler, WebServer},
    update,
};

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// This node's side of the session with the backend.
pub struct FrontendDevice {
    backend_ip: IpAddr,
    token: Option<String>,
}

/// What `/login` told us.
pub struct LoginOutcome {
    pub update: bool,
}

impl FrontendDevice {
    /// Resolves the backend address: the `backend` config key wins, then a
    /// signed multicast search.
    pub fn discover(config: &ConfigStore) -> Result<Self> {
        if let Some(Value::String(configured)) = config.load_var("backend") {
            let backend_ip = configured
                .parse()
                .with_context(|| format!("config key `backend` is not an IP: {configured}"))?;
            info!("using configured backend {backend_ip}");
            return Ok(Self {
                backend_ip,
                token: None,
            });
        }

        let client = MulticastClient::new(&config.resources_dir())?;
        match client.request(DISCOVERY_TIMEOUT)? {
            Some(found) => Ok(Self {
                backend_ip: IpAddr::V4(found),
                token: None,
            }),
            None => bail!("no backend answered the multicast search"),
        }
    }

    pub fn backend_ip(&self) -> IpAddr {
        self.backend_ip
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Logs this device in over `SECURE` and stores the session token.
    pub fn login(&mut self, config: &ConfigStore, funcs: &[String]) -> Result<LoginOutcome> {
        let subdevices = config
            .load_var("subdevices")
            .unwrap_or_else(|| json!([]));

        let response = WebClient::new(self.backend_ip, DEV_PORT)
            .set_secure(true)
            .set_method(WebMethod::Post)
            .set_path("/login")
            .set_json(json!({
                "subdevices": subdevices,
                "funcs": funcs,
                "version": VERSION,
                "os": crate::utils::get_os_name(),
            }))
            .send()
            .context("login request failed")?;
        ensure!(response.ok(), "login refused: {} {}", response.code, response.msg);

        let body = response.json().context("login response is not JSON")?;
        let token = body
            .get("token")
            .and_then(Value::as_str)
            .context("login response carries no token")?
            .to_string();
        let update = body
            .get("update")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        info!("logged in at {}", self.backend_ip);
        self.token = Some(token);
        Ok(LoginOutcome { update })
    }

    /// Downloads `/pack.zip` and unpacks it over the install root. The
    /// caller restarts the process afterwards.
    pub fn download_update(&self, config: &ConfigStore) -> Result<()> {
        info!("downloading update package...");
        let response = WebClient::new(self.backend_ip, DEV_PORT)
            .set_path("/pack.zip")
            .send()
            .context("update download failed")?;
        ensure!(
            response.ok(),
            "update download refused: {} {}",
            response.code,
            response.msg
        );

        update::unpack(&response.body, config.root())
    }

    /// Tells the backend this device is going away.
    pub fn logout(&self) {
        let result = WebClient::new(self.backend_ip, DEV_PORT)
            .set_secure(true)
            .set_path("/logout")
            .authorize(self.token())
            .send();
        match result {
            Ok(response) if !response.ok() => warn!("logout did not succeed!"),
            Ok(_) => {},
            Err(e) => warn!("logout did not succeed: {e:#}"),
        }
    }
}

/// Request handler for the frontend's local server: redirects strangers to
/// the backend, honors `close` only from the backend, and dispatches the
/// advertised function plugins.
pub struct FrontendRouter {
    backend_ip: IpAddr,
    token: String,
    functions: FunctionRegistry,
    running: Arc<AtomicBool>,
}

impl FrontendRouter {
    pub fn new(backend_ip: IpAddr, token: String, functions: FunctionRegistry) -> Self {
        Self {
            backend_ip,
            token,
            functions,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// The backend authenticates with the token it assigned this device at
    /// login; a match grants full permission.
    fn permission_level(&self, req: &RecvRequest) -> u8 {
        let Some(header) = req.headers.get("authorization") else {
            return 0;
        };
        let presented = header
            .trim()
            .strip_prefix("BEARER")
            .unwrap_or(header)
            .trim()
            .to_lowercase();
        if presented == self.token.to_lowercase() {
            100
        } else {
            0
        }
    }
}

impl RequestHandler for FrontendRouter {
    fn handle(&self, req: &RecvRequest) -> WebResponse {
        if req.peer != self.backend_ip && !req.peer.is_loopback() {
            info!("redirecting {} to {}", req.peer, self.backend_ip);
            return WebResponse::new(301, "MOVED").header(
                "Location",
                format!("http://{}:{DEV_PORT}{}", self.backend_ip, req.path),
            );
        }

        let mut body = req.get_args.clone();
        for (key, value) in req.decode_body() {
            body.insert(key, value);
        }
        let level = self.permission_level(req);
        let mut result = ApiResult::empty();

        for segment in req.path.split('/').filter(|s| !s.is_empty()) {
            let fargs: Vec<String> = segment.split('.').map(str::to_string).collect();
            let name = fargs[0].to_lowercase();

            if name == "close" {
                info!("close request received");
                self.running.store(false, Ordering::SeqCst);
                return WebResponse::json(200, "CLOSED", &json!({"message": "Closed!"}));
            }

            let Some(mut function) = self.functions.instantiate(&name) else {
                return WebResponse::json(
                    404,
                    "FUNC_NOT_FOUND",
                    &json!({
                        "message": format!("API function `{}` not found!", fargs.join("."))
                    }),
                );
            };

            if level < function.permissions(50) {
                return WebResponse::json(
                    403,
                    "NO_PERMS",
                    &json!({
                        "message": format!(
                            "Not enough permissions to execute `{}`!",
                            fargs.join(".")
                        )
                    }),
                );
            }

            let ctx = ApiContext {
                peer: Some(req.peer),
                headers: req.headers.clone(),
                args: fargs[1..].to_vec(),
                body: body.clone(),
            };
            match function.api(&ctx) {
                Ok(part) => result.combine(&name, part),
                Err(e) => {
                    warn!("exception on function `{}`: {e:#}", fargs.join("."));
                    let mut diagnostic = format!("{e:#}");
                    diagnostic.truncate(512);
                    return WebResponse::json(
                        500,
                        "FUNC_FAILED",
                        &json!({
                            "message": format!("Function `{}` failed!", fargs.join(".")),
                            "exception": diagnostic,
                        }),
                    );
                },
            }
        }

        result.webresponse()
    }
}

/// Entry point for `joanet frontend`. Exit codes: 0 clean stop, 1
/// discovery/login failure, 12 restart after update.
pub fn run(
    config: Arc<ConfigStore>,
    shipper: RemoteLogLayer,
    functions: FunctionRegistry,
) -> Result<i32> {
    info!("starting [FRONTEND]...");

    let mut device = match FrontendDevice::discover(&config) {
        Ok(device) => device,
        Err(e) => {
            warn!("backend discovery failed: {e:#}");
            return Ok(1);
        },
    };

    let advertised = functions.names();
    let outcome = match device.login(&config, &advertised) {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("login failed at {}. Exiting...", device.backend_ip());
            warn!("{e:#}");
            return Ok(1);
        },
    };

    if outcome.update {
        info!("backend reports a newer version, updating...");
        device.download_update(&config)?;
        return Ok(12);
    }

    let token = device.token().context("no token after login")?.to_string();
    shipper.arm(device.backend_ip(), DEV_PORT, token.clone());

    let router = Arc::new(FrontendRouter::new(device.backend_ip(), token, functions));
    let server = WebServer::with_flag(
        DEV_PORT,
        Arc::clone(&router) as Arc<dyn RequestHandler>,
        router.running_flag(),
    );
    server.start_blocking()?;

    device.logout();
    Ok(0)
}
