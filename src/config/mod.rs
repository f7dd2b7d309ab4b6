//! Configuration module
//!
//! Handles CLI argument parsing, TOML configuration files, and validation.
//!
//! Every section has serde defaults, so an empty file (or no file at all)
//! yields a working configuration that talks to a local Redis and Docker.

pub mod cli;
pub mod toml;
pub mod validator;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Complete coordinator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub uploads: UploadConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Session store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl Default for StoreBackend {
    fn default() -> Self {
        Self::Redis
    }
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Redis => write!(f, "redis"),
            Self::Memory => write!(f, "memory"),
        }
    }
}

/// Session store connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_store_host")]
    pub host: String,
    #[serde(default = "default_store_port")]
    pub port: u16,
    #[serde(default)]
    pub db: i64,
}

impl StoreConfig {
    /// Connection URL for the Redis client
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_store_host(),
            port: default_store_port(),
            db: 0,
        }
    }
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    6379
}

/// Distributed lock settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Maximum hold time of a session lock
    #[serde(default = "default_lock_timeout_secs")]
    pub timeout_secs: u64,
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_lock_timeout_secs(),
        }
    }
}

fn default_lock_timeout_secs() -> u64 {
    10
}

/// Upload directory settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Local root of the upload tree
    #[serde(default = "default_upload_root")]
    pub root: PathBuf,
    /// Rename committed artifacts to `<name>.done`
    #[serde(default = "default_true")]
    pub completion_marker: bool,
    /// Extensions accepted by the front end (compared case-insensitively)
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl UploadConfig {
    /// Check a client-supplied filename against the allow-list
    pub fn is_allowed_file(&self, filename: &str) -> bool {
        match filename.rsplit_once('.') {
            Some((_, ext)) => self
                .allowed_extensions
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            root: default_upload_root(),
            completion_marker: true,
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

fn default_upload_root() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_true() -> bool {
    true
}

fn default_allowed_extensions() -> Vec<String> {
    ["txt", "pdf", "png", "jpg", "jpeg", "gif", "tar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Container launch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LauncherConfig {
    /// Aggregation workload image
    #[serde(default = "default_image")]
    pub image: String,
    /// Value of `TZ` inside the container
    #[serde(default = "default_timezone")]
    pub timezone: String,
    /// Container network to attach to
    pub network: Option<String>,
    /// Store hostname as reachable from inside the container network
    #[serde(default = "default_container_store_host")]
    pub container_store_host: String,
    /// Host-visible path of the upload root (defaults to `uploads.root`)
    pub host_uploads_root: Option<PathBuf>,
    /// Host directory bound to the container's log directory
    #[serde(default = "default_host_logs_path")]
    pub host_logs_path: PathBuf,
    /// Host directory holding the shared validation dataset
    #[serde(default = "default_host_validation_path")]
    pub host_validation_path: PathBuf,
    /// Request one GPU when the runtime supports device requests
    #[serde(default = "default_true")]
    pub gpu: bool,
    /// Shared memory size (e.g., "2G", "512m")
    #[serde(default = "default_shm_size")]
    pub shm_size: String,
    /// Upper bound on a single launch attempt
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    /// Required party count per session, if fixed
    pub expected_parties: Option<usize>,
}

impl LauncherConfig {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_secs(self.launch_timeout_secs)
    }

    pub fn shm_size_bytes(&self) -> Result<u64> {
        parse_size(&self.shm_size).context("Invalid launcher.shm_size")
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            timezone: default_timezone(),
            network: None,
            container_store_host: default_container_store_host(),
            host_uploads_root: None,
            host_logs_path: default_host_logs_path(),
            host_validation_path: default_host_validation_path(),
            gpu: true,
            shm_size: default_shm_size(),
            launch_timeout_secs: default_launch_timeout_secs(),
            expected_parties: None,
        }
    }
}

fn default_image() -> String {
    "test-docker".to_string()
}

fn default_timezone() -> String {
    "Asia/Singapore".to_string()
}

fn default_container_store_host() -> String {
    "redis".to_string()
}

fn default_host_logs_path() -> PathBuf {
    PathBuf::from("logs")
}

fn default_host_validation_path() -> PathBuf {
    PathBuf::from("validation")
}

fn default_shm_size() -> String {
    "2G".to_string()
}

fn default_launch_timeout_secs() -> u64 {
    8
}

/// Where published results are read from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultSource {
    /// JSON document stored under the session id
    Store,
    /// File in the results directory whose name starts with the session id
    Directory,
}

impl Default for ResultSource {
    fn default() -> Self {
        Self::Store
    }
}

/// Result lookup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsConfig {
    #[serde(default)]
    pub source: ResultSource,
    pub directory: Option<PathBuf>,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            source: ResultSource::Store,
            directory: None,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Lower the default filter to `debug`
    #[serde(default)]
    pub debug: bool,
    /// Emit JSON lines instead of human-readable text
    #[serde(default)]
    pub json: bool,
    /// Append to this file instead of stderr
    pub file: Option<PathBuf>,
}

/// Parse a size string (e.g., "4k", "1M", "2G") to bytes
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim().to_lowercase();

    const UNITS: [(&str, u64); 8] = [
        ("kb", 1 << 10),
        ("mb", 1 << 20),
        ("gb", 1 << 30),
        ("tb", 1 << 40),
        ("k", 1 << 10),
        ("m", 1 << 20),
        ("g", 1 << 30),
        ("t", 1 << 40),
    ];

    let (num_str, multiplier) = UNITS
        .iter()
        .find(|(suffix, _)| s.ends_with(suffix))
        .map(|(suffix, mult)| (s.trim_end_matches(suffix), *mult))
        .unwrap_or((s.as_str(), 1));

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid size format: {}", s))?;

    num.checked_mul(multiplier)
        .ok_or_else(|| anyhow::anyhow!("Size out of range: {}", s))
}
