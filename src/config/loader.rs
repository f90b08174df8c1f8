// src/config/loader.rs

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::config::model::ConfigFile;
use crate::config::validate::{validate_config, DisabledService};

/// Load a configuration file from a given path and return the raw
/// `ConfigFile`.
///
/// This only performs TOML deserialization; it does **not** perform semantic
/// validation (dependency correctness, executable checks, etc.). Use
/// [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let path = path.as_ref();
    let contents =
        fs::read_to_string(path).with_context(|| format!("reading config file at {:?}", path))?;

    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("parsing TOML config from {:?}", path))?;

    Ok(config)
}

/// Load a configuration file from path and run validation.
///
/// This is the recommended entry point for the rest of the application:
///
/// - Reads TOML.
/// - Applies defaults (handled by `serde` + `Default` impls).
/// - Checks for:
///   - unknown `depends_on` references and self-dependencies,
///   - dependency cycles,
///   - basic global config sanity,
///   - missing service executables.
///
/// A missing executable disables only that service (and anything depending
/// on it at start time); the returned list names the services that were
/// disabled so the caller can surface them.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<(ConfigFile, Vec<DisabledService>)> {
    let config = load_from_path(&path)?;
    let disabled = validate_config(&config)?;
    Ok((config, disabled))
}
