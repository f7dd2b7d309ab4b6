//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &Config) -> Result<()> {
    validate_store(&config.store)?;
    validate_lock_and_launch(&config.lock, &config.launcher)?;
    validate_uploads(&config.uploads)?;
    validate_launcher(&config.launcher)?;
    validate_results(&config.results)?;

    Ok(())
}

/// Validate store connection settings
pub fn validate_store(store: &StoreConfig) -> Result<()> {
    if store.backend == StoreBackend::Redis {
        if store.host.trim().is_empty() {
            anyhow::bail!("store.host must not be empty");
        }
        if store.port == 0 {
            anyhow::bail!("store.port must be non-zero");
        }
        if store.db < 0 {
            anyhow::bail!("store.db must be non-negative, got {}", store.db);
        }
    }

    Ok(())
}

/// Validate that a launch always finishes inside the lock hold time
pub fn validate_lock_and_launch(lock: &LockConfig, launcher: &LauncherConfig) -> Result<()> {
    if lock.timeout_secs == 0 {
        anyhow::bail!("lock.timeout_secs must be at least 1");
    }

    if launcher.launch_timeout_secs == 0 {
        anyhow::bail!("launcher.launch_timeout_secs must be at least 1");
    }

    if launcher.launch_timeout_secs >= lock.timeout_secs {
        anyhow::bail!(
            "launcher.launch_timeout_secs ({}) must be less than lock.timeout_secs ({})",
            launcher.launch_timeout_secs,
            lock.timeout_secs
        );
    }

    Ok(())
}

/// Validate upload settings
pub fn validate_uploads(uploads: &UploadConfig) -> Result<()> {
    if uploads.root.as_os_str().is_empty() {
        anyhow::bail!("uploads.root must not be empty");
    }

    if uploads.allowed_extensions.is_empty() {
        anyhow::bail!("uploads.allowed_extensions must list at least one extension");
    }

    for ext in &uploads.allowed_extensions {
        if ext.is_empty() || ext.contains('.') || ext.contains('/') {
            anyhow::bail!("Invalid allowed extension: '{}'", ext);
        }
    }

    Ok(())
}

/// Validate launcher settings
pub fn validate_launcher(launcher: &LauncherConfig) -> Result<()> {
    if launcher.image.trim().is_empty() {
        anyhow::bail!("launcher.image must not be empty");
    }

    if launcher.container_store_host.trim().is_empty() {
        anyhow::bail!("launcher.container_store_host must not be empty");
    }

    launcher.shm_size_bytes()?;

    if let Some(0) = launcher.expected_parties {
        anyhow::bail!("launcher.expected_parties must be at least 1");
    }

    Ok(())
}

/// Validate result lookup settings
pub fn validate_results(results: &ResultsConfig) -> Result<()> {
    if results.source == ResultSource::Directory && results.directory.is_none() {
        anyhow::bail!("results.directory is required when results.source = \"directory\"");
    }

    Ok(())
}
