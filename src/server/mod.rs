// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The accept loop (C12): every connection gets its own worker thread, the
//! framed stream, the `SECURE` server handshake when requested, and either
//! a public file or the configured request handler.

pub mod sitescript;

use std::{
    fs,
    net::{IpAddr, SocketAddr, TcpListener, TcpStream},
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use anyhow::{Context, Result};
use num_bigint::BigUint;
use once_cell::sync::OnceCell;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{
    encryption::{cipher::AesCbcCipher, dh::DhExchange, framed::FramedStream},
    errors::NetError,
    http::{RecvRequest, WebMethod, WebResponse, read_request, write_response},
    server::sitescript::{SiteScriptRegistry, render},
    utils::mime_by_ext,
};

/// What the server asks of its configured handler. The handler decides the
/// response; public file serving and site scripts are opt-in.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, req: &RecvRequest) -> WebResponse;

    fn public_dir(&self) -> Option<PathBuf> {
        None
    }

    fn site_scripts(&self) -> Option<&SiteScriptRegistry> {
        None
    }
}

/// TCP accept loop bound to one port, polling a stop flag at 100 ms.
pub struct WebServer {
    port: u16,
    handler: Arc<dyn RequestHandler>,
    started: Arc<AtomicBool>,
    local_addr: OnceCell<SocketAddr>,
}

impl WebServer {
    pub fn new(port: u16, handler: Arc<dyn RequestHandler>) -> Self {
        Self::with_flag(port, handler, Arc::new(AtomicBool::new(true)))
    }

    /// Shares the stop flag with the handler so a trusted `close` request
    /// can end the loop.
    pub fn with_flag(
        port: u16,
        handler: Arc<dyn RequestHandler>,
        started: Arc<AtomicBool>,
    ) -> Self {
        Self {
            port,
            handler,
            started,
            local_addr: OnceCell::new(),
        }
    }

    /// The bound address, available once the loop has started. Useful with
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    /// Runs the accept loop on the calling thread until the stop flag
    /// clears.
    pub fn start_blocking(&self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .with_context(|| format!("failed to bind port {}", self.port))?;
        listener.set_nonblocking(true)?;
        let _ = self.local_addr.set(listener.local_addr()?);
        self.started.store(true, Ordering::SeqCst);
        info!("listening on {:?}", self.local_addr());

        while self.started.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((sock, addr)) => {
                    debug!("got request by {}", addr.ip());
                    let handler = Arc::clone(&self.handler);
                    let spawned = thread::Builder::new()
                        .name("RequestHTTP".to_string())
                        .spawn(move || handle_connection(handler, sock, addr));
                    if let Err(e) = spawned {
                        warn!("failed to spawn request worker: {e}");
                    }
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(100));
                },
                Err(e) => debug!("connection closed unexpectedly: {e}"),
            }
        }
        Ok(())
    }

    /// Starts the accept loop on a background thread.
    pub fn start(&self) -> Result<()>
    where
        Self: Sized,
    {
        let port = self.port;
        let handler = Arc::clone(&self.handler);
        let started = Arc::clone(&self.started);
        thread::Builder::new()
            .name("Listener".to_string())
            .spawn(move || {
                let server = WebServer::with_flag(port, handler, started);
                if let Err(e) = server.start_blocking() {
                    warn!("listener exited: {e:#}");
                }
            })
            .context("failed to spawn listener thread")?;
        Ok(())
    }
}

fn handle_connection(handler: Arc<dyn RequestHandler>, sock: TcpStream, addr: SocketAddr) {
    if let Err(e) = sock.set_nodelay(true) {
        debug!("set_nodelay failed: {e}");
    }
    let peer = addr.ip();
    let mut stream = FramedStream::new(sock);

    if let Err(e) = serve_one(&handler, &mut stream, peer) {
        debug!("connection from {peer} failed: {e:#}");
        send_error_best_effort(&mut stream, &e);
    }
}

fn serve_one(
    handler: &Arc<dyn RequestHandler>,
    stream: &mut FramedStream<TcpStream>,
    peer: IpAddr,
) -> Result<()> {
    let mut req = read_request(stream, peer)?;

    // `SECURE` upgrade: answer 101 with our half of the agreement, switch
    // ciphers and read the actual request off the same connection.
    if req.method == WebMethod::Secure {
        let e_raw = req
            .headers
            .get("dh-e")
            .ok_or_else(|| NetError::BadRequest("SECURE request without DH-E".into()))?;
        let e = BigUint::from_str(e_raw.trim())
            .map_err(|_| NetError::BadRequest(format!("malformed DH-E `{e_raw}`")))?;

        let mut dh = DhExchange::new();
        dh.read_peer(&e);

        let reply =
            WebResponse::new(101, "SECURE").header("DH-F", dh.public_value().to_string());
        write_response(stream, &reply, Some(&req))?;

        stream.update_cipher(AesCbcCipher::new(dh.session_key()?, dh.session_iv()?).into());
        req = read_request(stream, peer)?;
    }

    if req.method == WebMethod::Options {
        let reply = WebResponse::new(204, "OPTIONS").header("Allow", "GET, POST, OPTIONS");
        return write_response(stream, &reply, Some(&req));
    }

    if req.method == WebMethod::Get
        && let Some(dir) = handler.public_dir()
        && let Some(file) = find_public(&dir, &req.path)
    {
        let resp = build_page(&dir.join(&file), &req, handler.site_scripts());
        return write_response(stream, &resp, Some(&req));
    }

    let resp = handler.handle(&req);
    let code = resp.code;
    write_response(stream, &resp, Some(&req))?;
    info!("{code} for {} from {peer}", req.path);
    Ok(())
}

/// Maps a known taxonomy error to a response on a best-effort basis; the
/// connection is dropped either way.
fn send_error_best_effort(stream: &mut FramedStream<TcpStream>, err: &anyhow::Error) {
    let Some(net_err) = err.downcast_ref::<NetError>() else {
        return;
    };
    let (code, msg) = net_err.status();
    let resp = WebResponse::json(code, msg, &json!({"message": net_err.to_string()}));
    let _ = write_response(stream, &resp, None);
}

/// Matches a request path against the public directory: full file name or
/// stem, case-insensitively.
fn find_public(dir: &Path, path: &str) -> Option<String> {
    let wanted = path.trim_matches('/').to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    for entry in fs::read_dir(dir).ok()?.flatten() {
        if !entry.path().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let stem = Path::new(&file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if wanted == file_name.to_lowercase() || wanted == stem {
            return Some(file_name);
        }
    }
    None
}

fn build_page(
    path: &Path,
    req: &RecvRequest,
    scripts: Option<&SiteScriptRegistry>,
) -> WebResponse {
    let content = match fs::read(path) {
        Ok(content) => content,
        Err(_) => {
            return WebResponse::json(
                404,
                "NOT_FOUND",
                &json!({"message": "The requested file could not be found!"}),
            );
        },
    };

    let mime = mime_by_ext(path).to_string();
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let body = match scripts.and_then(|registry| registry.get(&stem)) {
        Some(script) => {
            debug!("site script found for {stem}");
            let vars = script.display(&req.get_args);
            render(&content, &vars.vars)
        },
        None => content,
    };

    WebResponse::with_body(200, "OK", (body, mime))
}
