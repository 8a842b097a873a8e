// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Process bootstrap: command line, JSON configuration and logging.

/// Command-line interface parsing.
pub mod cli;
/// Configuration file access and environment export.
pub mod config;
/// Logger initialization.
pub mod logger;
