// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::io::{Read, Write};

use anyhow::{Context, Result, ensure};
use bytes::{Bytes, BytesMut};

use crate::{
    encryption::cipher::{BlockCipher, TransportCipher},
    errors::NetError,
};

/// Hard cap on a single header/status line. Anything longer is a framing
/// violation, not a legitimate request.
const MAX_LINE: usize = 16 * 1024;

/// Block-aligned encrypted wrapper around a byte stream (C1).
///
/// Reads happen in multiples of the cipher block size with surplus plaintext
/// buffered; writes accumulate until whole blocks are available and keep the
/// partial tail until `flush`, which zero-pads it out. `update_cipher` swaps
/// the cipher mid-connection, as the `SECURE` handshake requires.
pub struct FramedStream<S: Read + Write> {
    inner: S,
    cipher: TransportCipher,
    recv_buff: BytesMut,
    send_buff: BytesMut,
}

impl<S: Read + Write> FramedStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            cipher: TransportCipher::default(),
            recv_buff: BytesMut::new(),
            send_buff: BytesMut::new(),
        }
    }

    pub fn block_size(&self) -> usize {
        self.cipher.block_size()
    }

    /// Replaces the cipher in place. Buffered plaintext on both sides is
    /// preserved; the unsent tail will be encrypted under the new cipher.
    pub fn update_cipher(&mut self, cipher: TransportCipher) {
        self.cipher = cipher;
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Returns exactly `size` plaintext bytes, reading whole blocks from the
    /// underlying stream as needed. EOF mid-message surfaces as an error.
    pub fn recv(&mut self, size: usize) -> Result<Bytes> {
        if size == 0 {
            return Ok(Bytes::new());
        }

        let block_size = self.block_size();
        let mut block = vec![0u8; block_size];

        while self.recv_buff.len() < size {
            self.inner
                .read_exact(&mut block)
                .context("connection closed while reading")?;
            let plain = self.cipher.decrypt(&block)?;
            self.recv_buff.extend_from_slice(&plain);
        }

        Ok(self.recv_buff.split_to(size).freeze())
    }

    /// Queues `data` and ships every complete block immediately. The tail
    /// shorter than one block stays buffered until `flush`.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.send_buff.extend_from_slice(data);

        let block_size = self.block_size();
        let whole = (self.send_buff.len() / block_size) * block_size;
        if whole > 0 {
            let chunk = self.send_buff.split_to(whole);
            let enc = self.cipher.encrypt(&chunk)?;
            self.inner
                .write_all(&enc)
                .context("connection closed while writing")?;
        }
        Ok(())
    }

    /// Zero-pads the buffered tail to a full block and ships it. Must be
    /// called at every logical message boundary.
    pub fn flush(&mut self) -> Result<()> {
        let block_size = self.block_size();
        let padding = (block_size - self.send_buff.len() % block_size) % block_size;
        self.send_buff.resize(self.send_buff.len() + padding, 0);

        if !self.send_buff.is_empty() {
            let chunk = self.send_buff.split_to(self.send_buff.len());
            let enc = self.cipher.encrypt(&chunk)?;
            self.inner
                .write_all(&enc)
                .context("connection closed while flushing")?;
        }
        self.inner.flush().context("flush failed")?;
        Ok(())
    }

    /// Reads one line, decrypting byte-group-wise as needed. The terminating
    /// `\n` and an optional preceding `\r` are stripped.
    pub fn read_line(&mut self) -> Result<String> {
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let byte = self.recv(1)?;
            if byte[0] == b'\n' {
                break;
            }
            buffer.push(byte[0]);
            ensure!(
                buffer.len() <= MAX_LINE,
                NetError::BadRequest("header line exceeds maximum length".into())
            );
        }

        if buffer.last() == Some(&b'\r') {
            buffer.pop();
        }
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
