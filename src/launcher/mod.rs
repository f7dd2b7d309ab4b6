//! Container launcher
//!
//! Turns a session and its registered party sequence into a concrete
//! container specification (bind mounts, environment, device requests) and
//! asks a [`ContainerRuntime`] to run it detached.
//!
//! # Architecture
//!
//! ```text
//! LaunchPlanner ──build_session_spec──> ContainerSpec ──run_detached──> ContainerRuntime
//!      │                                                                  │
//!      └── host paths, TZ, store address                  docker (bollard) / mock
//! ```
//!
//! # Container Layout
//!
//! For party `i` (0-based, registration order):
//!
//! ```text
//! <host_uploads_root>/<sid>/<party_i>   -> /app/parties/<i>     PARTY_ID<i>, PARTY_MODEL_PATH<i>
//! <host_uploads_root>/<sid>/global      -> /app/global          GLOBAL_MODEL_PATH
//! <host_logs_path>                      -> /app/logs            LOGS_PATH
//! <host_validation_path>                -> /app/validation      VALIDATION_DATA_PATH
//! ```
//!
//! Plus `NUM_PARTIES`, `SESSION_ID`, `TZ`, `REDIS_HOST` and `REDIS_PORT`.
//!
//! # Idempotent Launches
//!
//! Session containers carry a name derived from the session id. A runtime
//! that finds a container of that name already present adopts it instead of
//! creating another one, so a launch abandoned mid-flight (timeout) is picked
//! up by the next attempt rather than duplicated.

#[cfg(feature = "docker")]
pub mod docker;
pub mod mock;

use crate::config::Config;
use crate::error::{CoordResult, CoordinatorError};
use crate::upload::GLOBAL_DIR;
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Container directory holding per-party model directories
pub const CONTAINER_PARTIES_DIR: &str = "/app/parties";
/// Container directory of the global model
pub const CONTAINER_GLOBAL_DIR: &str = "/app/global";
/// Container directory for workload logs
pub const CONTAINER_LOGS_DIR: &str = "/app/logs";
/// Container directory of the validation dataset
pub const CONTAINER_VALIDATION_DIR: &str = "/app/validation";

/// A host directory bound into the container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeBinding {
    pub host_path: PathBuf,
    pub container_path: String,
    pub read_only: bool,
}

impl VolumeBinding {
    pub fn rw(host_path: impl Into<PathBuf>, container_path: impl Into<String>) -> Self {
        Self {
            host_path: host_path.into(),
            container_path: container_path.into(),
            read_only: false,
        }
    }

    /// Docker bind string `host:container:mode`
    pub fn to_bind(&self) -> String {
        format!(
            "{}:{}:{}",
            self.host_path.display(),
            self.container_path,
            if self.read_only { "ro" } else { "rw" }
        )
    }
}

/// Prefix of session container names
pub const CONTAINER_NAME_PREFIX: &str = "fedlaunch";

/// Deterministic container name of a session
///
/// Ids made only of `[A-Za-z0-9_.-]` map to `fedlaunch_<id>`; any other id is
/// hex-encoded as `fedlaunch-<hex>`, keeping the mapping injective.
pub fn session_container_name(session_id: &str) -> String {
    let plain = session_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));

    if plain {
        format!("{}_{}", CONTAINER_NAME_PREFIX, session_id)
    } else {
        let hex: String = session_id.bytes().map(|b| format!("{:02x}", b)).collect();
        format!("{}-{}", CONTAINER_NAME_PREFIX, hex)
    }
}

/// Device request for GPU access
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuRequest {
    pub driver: String,
    pub count: i64,
    pub capabilities: Vec<Vec<String>>,
}

impl Default for GpuRequest {
    fn default() -> Self {
        Self {
            driver: "nvidia".to_string(),
            count: 1,
            capabilities: vec![vec!["gpu".to_string()]],
        }
    }
}

/// Everything a runtime needs to start one detached container
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerSpec {
    pub image: String,
    /// Container name; a runtime adopts an existing container of this name
    pub name: Option<String>,
    /// Environment in insertion order
    pub env: Vec<(String, String)>,
    pub volumes: Vec<VolumeBinding>,
    pub gpu: Option<GpuRequest>,
    /// Shared memory size in bytes
    pub shm_size: Option<u64>,
    pub network: Option<String>,
    pub auto_remove: bool,
}

impl ContainerSpec {
    fn new(image: &str) -> Self {
        Self {
            image: image.to_string(),
            name: None,
            env: Vec::new(),
            volumes: Vec::new(),
            gpu: None,
            shm_size: None,
            network: None,
            auto_remove: false,
        }
    }

    fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.push((key.into(), value.into()));
    }

    /// Look up an environment variable
    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Environment as `KEY=value` strings
    pub fn env_strings(&self) -> Vec<String> {
        self.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.volumes.iter().map(VolumeBinding::to_bind).collect()
    }
}

/// Features a container runtime supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeCapabilities {
    /// Runtime accepts device requests (GPU passthrough)
    pub device_requests: bool,
    /// Runtime honors a shared-memory size
    pub shm_size: bool,
}

/// Something that can run a container detached
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a detached container; returns its id
    ///
    /// When `spec.name` is set and a container of that name exists, that
    /// container is started (if needed) and its id returned. A missing image
    /// is reported as `ImageNotFound`, every other failure as `Runtime`.
    async fn run_detached(&self, spec: &ContainerSpec) -> CoordResult<String>;

    /// Features of the runtime; may contact the runtime on first use
    async fn capabilities(&self) -> CoordResult<RuntimeCapabilities>;
}

/// Builds container specifications from launcher settings
#[derive(Debug, Clone)]
pub struct LaunchPlanner {
    timezone: String,
    network: Option<String>,
    container_store_host: String,
    container_store_port: u16,
    host_uploads_root: PathBuf,
    host_logs_path: PathBuf,
    host_validation_path: PathBuf,
    gpu: bool,
    shm_size: u64,
    expected_parties: Option<usize>,
}

impl LaunchPlanner {
    /// Derive a planner from the configuration
    ///
    /// Relative host paths are resolved against the working directory, since
    /// bind mounts need absolute host paths.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let launcher = &config.launcher;
        let uploads_root = launcher
            .host_uploads_root
            .clone()
            .unwrap_or_else(|| config.uploads.root.clone());

        Ok(Self {
            timezone: launcher.timezone.clone(),
            network: launcher.network.clone(),
            container_store_host: launcher.container_store_host.clone(),
            container_store_port: config.store.port,
            host_uploads_root: absolutize(&uploads_root)?,
            host_logs_path: absolutize(&launcher.host_logs_path)?,
            host_validation_path: absolutize(&launcher.host_validation_path)?,
            gpu: launcher.gpu,
            shm_size: launcher.shm_size_bytes()?,
            expected_parties: launcher.expected_parties,
        })
    }

    /// Spec for the aggregation container of a session
    pub fn build_session_spec(
        &self,
        image: &str,
        session_id: &str,
        party_ids: &[String],
        capabilities: RuntimeCapabilities,
    ) -> CoordResult<ContainerSpec> {
        if party_ids.is_empty() {
            return Err(CoordinatorError::InvalidArgument(format!(
                "session '{}' has no registered parties",
                session_id
            )));
        }

        if let Some(expected) = self.expected_parties {
            if party_ids.len() != expected {
                return Err(CoordinatorError::InvalidArgument(format!(
                    "session '{}' has {} parties, expected {}",
                    session_id,
                    party_ids.len(),
                    expected
                )));
            }
        }

        let session_root = self.host_uploads_root.join(session_id);
        let mut spec = ContainerSpec::new(image);
        spec.name = Some(session_container_name(session_id));

        for (i, party_id) in party_ids.iter().enumerate() {
            let container_path = format!("{}/{}", CONTAINER_PARTIES_DIR, i);
            spec.volumes
                .push(VolumeBinding::rw(session_root.join(party_id), container_path.clone()));
            spec.set_env(format!("PARTY_ID{}", i), party_id.as_str());
            spec.set_env(format!("PARTY_MODEL_PATH{}", i), container_path);
        }
        spec.set_env("NUM_PARTIES", party_ids.len().to_string());

        spec.volumes
            .push(VolumeBinding::rw(session_root.join(GLOBAL_DIR), CONTAINER_GLOBAL_DIR));
        spec.volumes
            .push(VolumeBinding::rw(&self.host_logs_path, CONTAINER_LOGS_DIR));
        spec.volumes
            .push(VolumeBinding::rw(&self.host_validation_path, CONTAINER_VALIDATION_DIR));

        spec.set_env("GLOBAL_MODEL_PATH", CONTAINER_GLOBAL_DIR);
        spec.set_env("LOGS_PATH", CONTAINER_LOGS_DIR);
        spec.set_env("VALIDATION_DATA_PATH", CONTAINER_VALIDATION_DIR);
        spec.set_env("TZ", self.timezone.as_str());
        spec.set_env("REDIS_HOST", self.container_store_host.as_str());
        spec.set_env("REDIS_PORT", self.container_store_port.to_string());
        spec.set_env("SESSION_ID", session_id);

        if self.gpu {
            if capabilities.device_requests {
                spec.gpu = Some(GpuRequest::default());
            } else {
                tracing::warn!(session_id = %session_id, "Runtime does not support device requests, launching without GPU");
            }
        }

        if capabilities.shm_size {
            spec.shm_size = Some(self.shm_size);
        }
        spec.network = self.network.clone();

        Ok(spec)
    }

    /// Spec for an ad-hoc container with only the logs mount and `TZ`
    pub fn build_adhoc_spec(&self, image: &str) -> ContainerSpec {
        let mut spec = ContainerSpec::new(image);
        spec.volumes
            .push(VolumeBinding::rw(&self.host_logs_path, CONTAINER_LOGS_DIR));
        spec.set_env("TZ", self.timezone.as_str());
        spec.network = self.network.clone();
        spec
    }
}

fn absolutize(path: &Path) -> anyhow::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().context("Failed to read working directory")?;
    Ok(cwd.join(path))
}

/// Planner plus runtime
#[derive(Clone)]
pub struct Launcher {
    planner: LaunchPlanner,
    runtime: Arc<dyn ContainerRuntime>,
}

impl Launcher {
    pub fn new(planner: LaunchPlanner, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { planner, runtime }
    }

    pub fn planner(&self) -> &LaunchPlanner {
        &self.planner
    }

    /// Launch the aggregation container for a session
    pub async fn launch(
        &self,
        image: &str,
        session_id: &str,
        party_ids: &[String],
    ) -> CoordResult<String> {
        let capabilities = self.runtime.capabilities().await?;
        let spec = self
            .planner
            .build_session_spec(image, session_id, party_ids, capabilities)?;

        tracing::debug!(
            session_id = %session_id,
            image = %image,
            name = ?spec.name,
            binds = ?spec.binds(),
            gpu = spec.gpu.is_some(),
            "Container spec built"
        );

        let container_id = self.runtime.run_detached(&spec).await?;
        tracing::info!(session_id = %session_id, container_id = %container_id, "Container started");
        Ok(container_id)
    }

    /// Launch an ad-hoc container outside any session
    pub async fn start_adhoc(&self, image: &str) -> CoordResult<String> {
        let spec = self.planner.build_adhoc_spec(image);
        let container_id = self.runtime.run_detached(&spec).await?;
        tracing::info!(image = %image, container_id = %container_id, "Ad-hoc container started");
        Ok(container_id)
    }
}
