// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use anyhow::{Context, Result, ensure};
use hex_literal::hex;
use num_bigint::BigUint;
use once_cell::sync::Lazy;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::encryption::cipher::{AES_IV_LEN, AES_KEY_LEN};

/// RFC 3526 2048-bit MODP group prime, big-endian.
const MODP_2048: [u8; 256] = hex!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74"
    "020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437"
    "4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED"
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05"
    "98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB"
    "9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B"
    "E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718"
    "3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF"
);

static PRIME: Lazy<BigUint> = Lazy::new(|| BigUint::from_bytes_be(&MODP_2048));
static GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u32));

/// One side of the Diffie-Hellman agreement performed in-band by the
/// `SECURE` method. Both peers run the same object; the only asymmetry is
/// who sends their public value first (`DH-E` vs `DH-F`).
pub struct DhExchange {
    secret: BigUint,
    shared: Option<BigUint>,
}

impl DhExchange {
    /// Draws a fresh secret uniformly from `[2, q - 1]` with `q = p / 2`.
    pub fn new() -> Self {
        let q = &*PRIME >> 1u32;

        let mut buf = [0u8; 256];
        rand::rng().fill(&mut buf[..]);

        // [2, q - 1] holds q - 2 values.
        let span = &q - BigUint::from(2u32);
        let secret = BigUint::from_bytes_be(&buf) % span + BigUint::from(2u32);

        Self {
            secret,
            shared: None,
        }
    }

    /// The value to put on the wire: `g^secret mod p`.
    pub fn public_value(&self) -> BigUint {
        GENERATOR.modpow(&self.secret, &PRIME)
    }

    /// Absorbs the peer's public value and fixes the shared secret `K`.
    pub fn read_peer(&mut self, peer: &BigUint) {
        self.shared = Some(peer.modpow(&self.secret, &PRIME));
    }

    fn crypt_bytes(&self, id: &[u8], len: usize) -> Result<Vec<u8>> {
        ensure!(len <= 32, "requested key material length {len} exceeds 32");
        let shared = self
            .shared
            .as_ref()
            .context("key exchange has not been performed yet")?;

        // K in minimal big-endian representation, then the domain tag.
        let mut hasher = Sha256::new();
        hasher.update(shared.to_bytes_be());
        hasher.update(id);
        Ok(hasher.finalize()[..len].to_vec())
    }

    /// Session key: first 32 bytes of `SHA-256(K || "KEY")`.
    pub fn session_key(&self) -> Result<[u8; AES_KEY_LEN]> {
        let bytes = self.crypt_bytes(b"KEY", AES_KEY_LEN)?;
        let mut out = [0u8; AES_KEY_LEN];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// Session IV: first 16 bytes of `SHA-256(K || "IVS")`.
    pub fn session_iv(&self) -> Result<[u8; AES_IV_LEN]> {
        let bytes = self.crypt_bytes(b"IVS", AES_IV_LEN)?;
        let mut out = [0u8; AES_IV_LEN];
        out.copy_from_slice(&bytes);
        Ok(out)
    }
}

impl Default for DhExchange {
    fn default() -> Self {
        Self::new()
    }
}
