// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

/// Wire-level error taxonomy. Handlers downcast to one of these to pick the
/// HTTP status code; everything else surfaces as `FuncFailed`.
#[derive(Debug, Error)]
pub enum NetError {
    /// Malformed status line, missing method/path, non-integer
    /// `Content-Length`, non-JSON body where JSON is required.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Missing or unmatched bearer token against a registered device.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Authenticated but below the declared permission requirement.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// No pipeline stage claimed the segment, or a public file is missing.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uncaught failure in a plugin or downstream component.
    #[error("function failed: {0}")]
    FuncFailed(String),

    /// Remote-call proxy timed out or the connection was refused.
    #[error("peer unreachable: {0}")]
    PeerUnreachable(String),

    /// Integrity or framing violation on the encrypted stream. Fatal for the
    /// connection.
    #[error("cipher error: {0}")]
    CipherError(String),

    /// Missing variable on a dotted config path.
    #[error("config error: {0}")]
    ConfigError(String),
}

impl NetError {
    /// Status code and message this error maps to on the wire.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            NetError::BadRequest(_) => (400, "BAD_BODY"),
            NetError::Unauthorized(_) => (401, "INVALID_TOK"),
            NetError::Forbidden(_) => (403, "NO_PERMS"),
            NetError::NotFound(_) => (404, "FUNC_NOT_FOUND"),
            NetError::FuncFailed(_) => (500, "FUNC_FAILED"),
            NetError::PeerUnreachable(_) => (500, "FUNC_FAILED"),
            NetError::CipherError(_) => (500, "CIPHER_ERROR"),
            NetError::ConfigError(_) => (500, "CONFIG_ERROR"),
        }
    }
}
