// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    net::{Ipv4Addr, SocketAddr, UdpSocket},
    path::Path,
    sync::Arc,
    thread,
};

use anyhow::{Context, Result};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rsa::{
    RsaPrivateKey,
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{EncodePublicKey, LineEnding},
    pss::SigningKey,
    sha2::Sha256,
    signature::{RandomizedSigner, SignatureEncoding},
};
use tracing::{debug, info, warn};

use super::{
    KEY_SIZE, MULTICAST_GROUP, MULTICAST_PORT, MULTICAST_SERVICE, PRIVATE_KEY_FILE,
    PUBLIC_KEY_FILE, parse_datagram, search_target,
};
use crate::utils::{CiMap, local_ipv4};

/// Answers multicast searches with a signed reply carrying this node's LAN
/// address. The RSA key pair is persisted on first run; the public half
/// lands in the public file directory so frontends can fetch it.
pub struct MulticastServer {
    local_ip: Ipv4Addr,
    private_key: RsaPrivateKey,
}

impl MulticastServer {
    /// Loads or generates the signing key and records the local address.
    pub fn new(resources_dir: &Path, public_dir: &Path) -> Result<Self> {
        let local_ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        let key_path = resources_dir.join(PRIVATE_KEY_FILE);
        let private_key = Self::load_or_generate(&key_path, &public_dir.join(PUBLIC_KEY_FILE))?;

        Ok(Self {
            local_ip,
            private_key,
        })
    }

    fn load_or_generate(key_path: &Path, public_path: &Path) -> Result<RsaPrivateKey> {
        if key_path.is_file() {
            let pem = fs::read_to_string(key_path)
                .with_context(|| format!("failed to read {key_path:?}"))?;
            if let Ok(key) = RsaPrivateKey::from_pkcs1_pem(&pem) {
                return Ok(key);
            }
            warn!("{key_path:?} does not hold an RSA private key, regenerating");
        }

        info!("generating a fresh {KEY_SIZE}-bit discovery key");
        let key = RsaPrivateKey::new(&mut rand_core::OsRng, KEY_SIZE)
            .context("RSA key generation failed")?;

        fs::write(key_path, key.to_pkcs1_pem(LineEnding::LF)?.as_bytes())
            .with_context(|| format!("failed to write {key_path:?}"))?;
        fs::write(
            public_path,
            key.to_public_key()
                .to_public_key_pem(LineEnding::LF)?
                .as_bytes(),
        )
        .with_context(|| format!("failed to write {public_path:?}"))?;

        Ok(key)
    }

    /// Starts the listening thread.
    pub fn background_listen(self: Arc<Self>) {
        if let Err(e) = thread::Builder::new()
            .name("SSDP".to_string())
            .spawn(move || {
                if let Err(e) = self.listen() {
                    warn!("multicast listener exited: {e:#}");
                }
            })
        {
            warn!("failed to spawn multicast listener: {e}");
        }
    }

    fn listen(&self) -> Result<()> {
        let sock = UdpSocket::bind(("0.0.0.0", MULTICAST_PORT))
            .context("failed to bind multicast socket")?;
        sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)
            .context("failed to join multicast group")?;
        info!("listening for searches on {MULTICAST_GROUP}:{MULTICAST_PORT}");

        let mut buf = [0u8; 4096];
        loop {
            let (len, addr) = sock.recv_from(&mut buf)?;
            if let Err(e) = self.handle_request(&buf[..len], addr, &sock) {
                debug!("dropped search from {addr}: {e:#}");
            }
        }
    }

    fn check_headers(&self, headers: &CiMap) -> bool {
        headers.get("st") == Some(search_target().as_str())
            && headers.get("usn") == Some(MULTICAST_SERVICE)
            && headers
                .get("man")
                .map(|m| m.to_lowercase() == "\"ssdp:discover\"")
                .unwrap_or(false)
            && !headers.get("authorization").unwrap_or_default().is_empty()
    }

    fn handle_request(&self, data: &[u8], addr: SocketAddr, sock: &UdpSocket) -> Result<()> {
        let (status, headers) = parse_datagram(data);
        if !status.starts_with("M-SEARCH * HTTP/1.1") || !self.check_headers(&headers) {
            return Ok(());
        }

        let nonce = headers
            .get("authorization")
            .unwrap_or_default()
            .to_string();
        debug!("replying to search from {addr}");
        sock.send_to(&self.reply_msg(&nonce)?, addr)?;
        Ok(())
    }

    /// Builds the signed reply: the client's nonce signed with
    /// RSASSA-PSS(SHA-256), base64 in `Authorization`.
    fn reply_msg(&self, nonce: &str) -> Result<Vec<u8>> {
        let signer = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signer
            .sign_with_rng(&mut rand_core::OsRng, nonce.as_bytes())
            .to_bytes();

        Ok([
            "HTTP/1.1 200 OK".to_string(),
            format!("ST: {}", search_target()),
            format!("USN: {MULTICAST_SERVICE}"),
            format!("Location: {}", self.local_ip),
            "Cache-Control: no-cache".to_string(),
            format!("Authorization: {}", BASE64.encode(&signature)),
        ]
        .join("\r\n")
        .into_bytes())
    }

    #[cfg(test)]
    pub(crate) fn for_tests(private_key: RsaPrivateKey) -> Self {
        Self {
            local_ip: Ipv4Addr::LOCALHOST,
            private_key,
        }
    }

    #[cfg(test)]
    pub(crate) fn reply_for_tests(&self, nonce: &str) -> Result<Vec<u8>> {
        self.reply_msg(nonce)
    }
}
