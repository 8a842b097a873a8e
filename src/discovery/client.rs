// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    net::{Ipv4Addr, UdpSocket},
    path::Path,
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngExt;
use rsa::{
    RsaPublicKey,
    pkcs8::DecodePublicKey,
    pss::{Signature, VerifyingKey},
    sha2::Sha256,
    signature::Verifier,
};
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use super::{
    MULTICAST_GROUP, MULTICAST_LIBRARY, MULTICAST_PORT, MULTICAST_SERVICE,
    PUBLIC_KEY_FILE, parse_datagram, search_target,
};
use crate::utils::{CiMap, local_ipv4};

/// Searches the LAN for the backend and verifies that replies were signed
/// by the key this frontend ships.
pub struct MulticastClient {
    public_key: RsaPublicKey,
    nonce: String,
}

impl MulticastClient {
    pub fn new(resources_dir: &Path) -> Result<Self> {
        let key_path = resources_dir.join(PUBLIC_KEY_FILE);
        ensure!(key_path.is_file(), "no public key found at {key_path:?}");

        let pem = fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read {key_path:?}"))?;
        let public_key = RsaPublicKey::from_public_key_pem(&pem)
            .context("the loaded key is not an RSA public key")?;

        Ok(Self {
            public_key,
            nonce: Self::make_nonce(),
        })
    }

    /// A fresh 40-hex-char authorization nonce per search.
    fn make_nonce() -> String {
        let mut seed = [0u8; 64];
        rand::rng().fill(&mut seed[..]);

        let mut hasher = Sha1::new();
        hasher.update(seed);
        hex::encode(hasher.finalize())
    }

    fn verify(&self, headers: &CiMap) -> bool {
        let Some(sig_b64) = headers.get("authorization") else {
            return false;
        };
        let Ok(sig_bytes) = BASE64.decode(sig_b64) else {
            return false;
        };
        let Ok(signature) = Signature::try_from(sig_bytes.as_slice()) else {
            return false;
        };

        VerifyingKey::<Sha256>::new(self.public_key.clone())
            .verify(self.nonce.as_bytes(), &signature)
            .is_ok()
    }

    /// Checks one reply and extracts the server address. Untrusted or
    /// mismatched replies return `None` and are silently dropped.
    fn handle_response(&self, data: &[u8]) -> Option<String> {
        let (status, headers) = parse_datagram(data);

        if !status.starts_with("HTTP/1.1 200")
            || !headers.contains("location")
            || headers.get("usn") != Some(MULTICAST_SERVICE)
            || !headers
                .get("st")
                .unwrap_or_default()
                .starts_with(MULTICAST_LIBRARY)
            || !self.verify(&headers)
        {
            return None;
        }

        let location = headers.get("location")?.to_string();
        info!("found server at {location}");
        Some(location)
    }

    /// Sends the search on every usable local interface and waits up to
    /// `timeout` per socket for a verified reply.
    pub fn request(&self, timeout: Duration) -> Result<Option<Ipv4Addr>> {
        info!("searching server...");
        let request_msg = [
            "M-SEARCH * HTTP/1.1".to_string(),
            format!("ST: {}", search_target()),
            format!("USN: {MULTICAST_SERVICE}"),
            "MAN: \"ssdp:discover\"".to_string(),
            format!("Authorization: {}", self.nonce),
            String::new(),
        ]
        .join("\r\n")
        .into_bytes();

        for bind_addr in self.interface_addresses() {
            let sock = match UdpSocket::bind((bind_addr, 0)) {
                Ok(s) => s,
                Err(e) => {
                    debug!("failed to bind {bind_addr}: {e}");
                    continue;
                },
            };
            sock.set_multicast_ttl_v4(2)?;
            sock.set_read_timeout(Some(timeout))?;
            sock.send_to(&request_msg, (MULTICAST_GROUP, MULTICAST_PORT))?;

            let mut buf = [0u8; 1024];
            loop {
                match sock.recv(&mut buf) {
                    Ok(len) => {
                        if let Some(ip) = self.handle_response(&buf[..len]) {
                            return Ok(ip.parse().ok());
                        }
                    },
                    Err(_) => break,
                }
            }
        }

        Ok(None)
    }

    /// The local addresses to probe from: the default-route interface plus
    /// the wildcard.
    fn interface_addresses(&self) -> Vec<Ipv4Addr> {
        let mut addrs = vec![Ipv4Addr::UNSPECIFIED];
        if let Ok(local) = local_ipv4()
            && !addrs.contains(&local)
        {
            addrs.push(local);
        }
        addrs
    }

}

#[cfg(test)]
mod tests {
    use rsa::RsaPrivateKey;

    use super::*;
    use crate::discovery::server::MulticastServer;

    fn key_pair() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand_core::OsRng, 2048).expect("key generation")
    }

    fn client(key: &RsaPrivateKey) -> MulticastClient {
        MulticastClient {
            public_key: key.to_public_key(),
            nonce: "a94a8fe5ccb19ba61c4c0873d391e987982fbbd3".to_string(),
        }
    }

    #[test]
    fn test_signed_reply_verifies() {
        let key = key_pair();
        let server = MulticastServer::for_tests(key.clone());
        let client = client(&key);

        let reply = server.reply_for_tests(&client.nonce).expect("reply builds");
        let (status, headers) = parse_datagram(&reply);
        assert!(status.starts_with("HTTP/1.1 200 OK"));
        assert!(headers.contains("authorization"));

        assert_eq!(client.handle_response(&reply).as_deref(), Some("127.0.0.1"));
    }

    #[test]
    fn test_reply_signed_over_other_nonce_is_dropped() {
        let key = key_pair();
        let server = MulticastServer::for_tests(key.clone());
        let client = client(&key);

        let reply = server
            .reply_for_tests("ffffffffffffffffffffffffffffffffffffffff")
            .expect("reply builds");
        assert_eq!(client.handle_response(&reply), None);
    }

    #[test]
    fn test_reply_from_unknown_key_is_dropped() {
        let server = MulticastServer::for_tests(key_pair());
        let client = client(&key_pair());

        let reply = server.reply_for_tests(&client.nonce).expect("reply builds");
        assert_eq!(client.handle_response(&reply), None);
    }

    #[test]
    fn test_tampered_reply_is_dropped() {
        let key = key_pair();
        let server = MulticastServer::for_tests(key.clone());
        let client = client(&key);

        let reply = server.reply_for_tests(&client.nonce).expect("reply builds");
        let tampered = String::from_utf8_lossy(&reply).replace("USN:", "XSN:");
        assert_eq!(client.handle_response(tampered.as_bytes()), None);
    }

    #[test]
    fn test_nonce_is_40_hex_chars() {
        let nonce = MulticastClient::make_nonce();
        assert_eq!(nonce.len(), 40);
        assert!(nonce.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce, MulticastClient::make_nonce());
    }
}
