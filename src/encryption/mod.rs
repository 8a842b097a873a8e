// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Transport confidentiality: block ciphers, the Diffie-Hellman agreement
//! used by the `SECURE` upgrade, and the framed stream that carries the
//! HTTP-like dialect over either.

pub mod cipher;
pub mod dh;
pub mod framed;
