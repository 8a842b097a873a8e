// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The zip-based self-update package: `pack` builds `joanet-<v>.zip` from
//! the install tree, frontends unpack it over their root and restart.

use std::{
    fs,
    io::{Cursor, Read, Write},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing::info;
use zip::{ZipArchive, ZipWriter, write::SimpleFileOptions};

/// Tree entries included in the package.
const PACKED_DIRS: [&str; 3] = ["public", "automation", "resources"];
const PACKED_FILES: [&str; 2] = ["config.json", "logger.yaml"];

/// Builds `<root>/joanet-<version>.zip` mirroring the install tree.
pub fn pack(root: &Path, version: f64) -> Result<PathBuf> {
    let archive_path = root.join(format!("joanet-{version}.zip"));
    let file = fs::File::create(&archive_path)
        .with_context(|| format!("failed to create {archive_path:?}"))?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default();

    for dir in PACKED_DIRS {
        let base = root.join(dir);
        if base.is_dir() {
            pack_dir(&mut writer, root, &base, options)?;
        }
    }
    for name in PACKED_FILES {
        let path = root.join(name);
        if path.is_file() {
            writer.start_file(name.to_string(), options)?;
            writer.write_all(&fs::read(&path)?)?;
        }
    }

    writer.finish().context("failed to finish archive")?;
    info!("packed update archive at {archive_path:?}");
    Ok(archive_path)
}

fn pack_dir(
    writer: &mut ZipWriter<fs::File>,
    root: &Path,
    dir: &Path,
    options: SimpleFileOptions,
) -> Result<()> {
    for entry in fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.is_dir() {
            pack_dir(writer, root, &path, options)?;
            continue;
        }

        let relative = path
            .strip_prefix(root)
            .context("entry escapes the root")?
            .to_string_lossy()
            .replace('\\', "/");
        writer.start_file(relative, options)?;
        writer.write_all(&fs::read(&path)?)?;
    }
    Ok(())
}

/// Extracts an update archive over the install tree.
pub fn unpack(data: &[u8], root: &Path) -> Result<()> {
    let mut archive =
        ZipArchive::new(Cursor::new(data)).context("update package is not a zip archive")?;
    archive
        .extract(root)
        .with_context(|| format!("failed to unpack into {root:?}"))?;
    Ok(())
}

/// Startup self-update: finds a `joanet-<v>.zip` newer than the running
/// version, unpacks it and removes the archive. Returns the version applied
/// so the caller can restart.
pub fn check_pending(root: &Path, current: f64) -> Result<Option<f64>> {
    for entry in fs::read_dir(root)
        .with_context(|| format!("cannot read {root:?}"))?
        .flatten()
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(version) = parse_archive_version(&name) else {
            continue;
        };
        if version <= current {
            continue;
        }

        info!("updating joanet to version {version}...");
        let mut data = Vec::new();
        fs::File::open(entry.path())?.read_to_end(&mut data)?;
        unpack(&data, root)?;
        fs::remove_file(entry.path())?;
        return Ok(Some(version));
    }
    Ok(None)
}

fn parse_archive_version(name: &str) -> Option<f64> {
    let stem = name.strip_suffix(".zip")?;
    let version = stem.strip_prefix("joanet-")?;
    version.parse().ok()
}
