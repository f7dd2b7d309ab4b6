//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, StoreBackendArg};
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<Config> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<Config> {
    let config: Config = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Build the effective configuration: file (if any), then CLI overrides
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match cli.config {
        Some(ref path) => parse_toml_file(path)?,
        None => Config::default(),
    };

    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: Config) -> Result<Config> {
    // Store
    if let Some(backend) = cli.store {
        config.store.backend = match backend {
            StoreBackendArg::Redis => StoreBackend::Redis,
            StoreBackendArg::Memory => StoreBackend::Memory,
        };
    }
    if let Some(ref host) = cli.redis_host {
        config.store.host = host.clone();
    }
    if let Some(port) = cli.redis_port {
        config.store.port = port;
    }

    // Lock
    if let Some(secs) = cli.lock_timeout {
        config.lock.timeout_secs = secs;
        // Keep the launch bound inside the lock hold time
        if config.launcher.launch_timeout_secs >= secs {
            config.launcher.launch_timeout_secs = secs.saturating_sub(1).max(1);
        }
    }

    // Uploads
    if let Some(ref root) = cli.upload_root {
        config.uploads.root = root.clone();
    }

    // Launcher
    if let Some(ref image) = cli.image {
        config.launcher.image = image.clone();
    }
    if let Some(ref logs) = cli.host_container_logs_path {
        config.launcher.host_logs_path = logs.clone();
    }

    // Logging
    if cli.debug {
        config.logging.debug = true;
    }
    if cli.json_logs {
        config.logging.json = true;
    }
    if let Some(ref file) = cli.log_file {
        config.logging.file = Some(file.clone());
    }

    Ok(config)
}
