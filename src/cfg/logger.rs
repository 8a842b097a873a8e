// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{fs, path::Path};

use anyhow::{Context, Result};
use fastrace::collector::{Config, ConsoleReporter};
use serde::Deserialize;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt};

use crate::frontend::shipper::RemoteLogLayer;

#[derive(Debug, Deserialize, Clone, Default)]
struct LoggerConfig {
    #[serde(default)]
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
enum Output {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(rename_all = "lowercase")]
enum RotationFreq {
    Minutely,
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    rotation_frequency: Option<RotationFreq>,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct LogConfig {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    output: Output,
    #[serde(default)]
    file: Option<LogFileConfig>,
}

/// Keeps the non-blocking writer threads alive for the process lifetime.
pub struct LogGuards {
    _guards: Vec<WorkerGuard>,
}

/// Sets up the global subscriber: a console layer, a JSON file layer under
/// `<root>/logs/` and, for the frontend, the remote shipper layer. An
/// optional `<root>/logger.yaml` overrides level, console target and file
/// placement.
pub fn init_logger(
    root: &Path,
    verbose: bool,
    shipper: Option<RemoteLogLayer>,
) -> Result<LogGuards> {
    let config = load_config(root);

    fastrace::set_reporter(ConsoleReporter, Config::default());
    let compat_layer = fastrace_tracing::FastraceCompatLayer::new();

    let default_level = if verbose { "debug" } else { "info" };
    let level = config
        .logger
        .level
        .clone()
        .unwrap_or_else(|| default_level.to_string());
    let env_filter = EnvFilter::try_new(&level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let mut guards = Vec::with_capacity(2);

    let (console_writer, console_guard) = match config.logger.output {
        Output::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        Output::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };
    guards.push(console_guard);
    let console_layer = fmt::layer()
        .with_writer(console_writer)
        .with_target(false);

    let (file_writer, file_guard) = tracing_appender::non_blocking(file_appender(
        root,
        config.logger.file.as_ref(),
    ));
    guards.push(file_guard);
    let file_layer = fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .json();

    let subscriber = Registry::default()
        .with(env_filter)
        .with(compat_layer)
        .with(console_layer)
        .with(file_layer)
        .with(shipper);

    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(LogGuards { _guards: guards })
}

fn load_config(root: &Path) -> LoggerConfig {
    let path = root.join("logger.yaml");
    let Ok(raw) = fs::read_to_string(&path) else {
        return LoggerConfig::default();
    };
    match serde_yaml::from_str(&raw) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ignoring malformed {path:?}: {e}");
            LoggerConfig::default()
        },
    }
}

fn file_appender(root: &Path, cfg: Option<&LogFileConfig>) -> RollingFileAppender {
    let (path, freq) = match cfg {
        Some(f) => (
            root.join(&f.path),
            f.rotation_frequency.unwrap_or(RotationFreq::Daily),
        ),
        None => (root.join("logs/joanet.log"), RotationFreq::Daily),
    };

    let rotation = match freq {
        RotationFreq::Minutely => Rotation::MINUTELY,
        RotationFreq::Hourly => Rotation::HOURLY,
        RotationFreq::Daily => Rotation::DAILY,
        RotationFreq::Never => Rotation::NEVER,
    };

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    RollingFileAppender::new(rotation, dir, path.file_name().unwrap_or_default())
}
