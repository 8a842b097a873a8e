// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};

/// Node role selected on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Run the user-machine agent: discover the backend, log in and serve
    /// device-local actions.
    Frontend,
    /// Run the long-lived control plane node.
    Backend,
    /// Build the update package for distribution to frontends.
    Pack,
}

#[derive(Parser, Debug)]
#[command(name = "joanet", version, about = "Distributed home-automation control plane")]
pub struct Cli {
    /// Choose to start backend or frontend, or pack an update archive
    #[arg(value_enum)]
    pub action: Action,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Install root holding config.json, public/, automation/ and resources/
    #[arg(long, default_value = ".")]
    pub root: PathBuf,
}

/// Canonicalizes a possibly-relative install root.
pub fn resolve_root(rel: &Path) -> Result<PathBuf> {
    let abs = if rel.is_absolute() {
        rel.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(rel)
    };

    abs.canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))
}
