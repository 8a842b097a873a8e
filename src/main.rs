// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{process::ExitCode, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use joanet::{
    VERSION,
    api::FunctionRegistry,
    backend,
    cfg::{
        cli::{Action, Cli},
        config::ConfigStore,
        logger::init_logger,
    },
    frontend::{self, shipper::RemoteLogLayer},
    update,
};
use tracing::{error, info};

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("fatal: {e:#}");
            eprintln!("fatal: {e:#}");
            ExitCode::from(1)
        },
    }
}

fn run(cli: Cli) -> Result<u8> {
    let root = joanet::cfg::cli::resolve_root(&cli.root)
        .context("install root does not exist")?;

    let config = Arc::new(ConfigStore::open(&root));
    config.make_dirs().context("failed to create directories")?;

    // The shipper layer is part of the subscriber from the start; it only
    // becomes active on frontends once the session token exists.
    let shipper = RemoteLogLayer::new();
    let layer = match cli.action {
        Action::Frontend => Some(shipper.clone()),
        _ => None,
    };
    let _log_guards = init_logger(&root, cli.verbose, layer)?;

    if let Err(e) = config.load_envvars() {
        error!("environ export failed: {e:#}");
    }

    // A newer package dropped into the root wins before anything starts.
    if let Some(version) = update::check_pending(&root, VERSION)? {
        info!("updated to {version}, restart requested");
        return Ok(12);
    }

    let code = match cli.action {
        Action::Frontend => {
            // Device-specific frontend actions register here; the core
            // ships none.
            let functions = FunctionRegistry::new();
            frontend::run(config, shipper, functions)?
        },
        Action::Backend => backend::run(config)?,
        Action::Pack => {
            info!("packing source...");
            update::pack(&root, VERSION)?;
            0
        },
    };

    Ok(u8::try_from(code).unwrap_or(1))
}
