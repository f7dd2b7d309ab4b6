//! CLI argument parsing using clap

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Store backend selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackendArg {
    /// Shared Redis instance (production)
    Redis,
    /// Process-local map (dry runs only, no cross-process locking)
    Memory,
}

/// fedlaunch - at-most-once container launches for federated-learning sessions
#[derive(Parser, Debug)]
#[command(name = "fedlaunch")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Session store backend
    #[arg(long, value_enum, global = true)]
    pub store: Option<StoreBackendArg>,

    /// Session store host
    #[arg(long, env = "REDIS_HOST", global = true)]
    pub redis_host: Option<String>,

    /// Session store port
    #[arg(long, env = "REDIS_PORT", global = true)]
    pub redis_port: Option<u16>,

    /// Host directory bound to the container log directory
    #[arg(long, env = "HOST_CONTAINER_LOGS_PATH", global = true)]
    pub host_container_logs_path: Option<PathBuf>,

    /// Local upload root
    #[arg(long, global = true)]
    pub upload_root: Option<PathBuf>,

    /// Aggregation workload image
    #[arg(long, global = true)]
    pub image: Option<String>,

    /// Session lock hold timeout in seconds
    #[arg(long, global = true)]
    pub lock_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Coordinator operations
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Register the ordered party list of a session
    Initiate {
        #[arg(long)]
        session_id: String,

        /// Party identifier (repeat in positional order)
        #[arg(long = "party-id", required = true)]
        party_ids: Vec<String>,
    },

    /// Store a model artifact and launch the session container if needed
    Upload {
        /// Artifact to upload
        #[arg(long)]
        file: PathBuf,

        #[arg(long, default_value = "Unknown")]
        session_id: String,

        #[arg(long, default_value = "Unknown")]
        party_id: String,

        #[arg(long, default_value = "Unknown")]
        epoch: String,

        /// Upload an aggregated global model instead of a local one
        #[arg(long)]
        global: bool,
    },

    /// Print the published result document of a session
    Result {
        #[arg(long)]
        session_id: String,
    },

    /// Show registered parties and container status of a session
    Status {
        #[arg(long)]
        session_id: String,
    },

    /// Start a container from an image with only the log mount (no session state)
    StartContainer {
        #[arg(long)]
        image: String,
    },

    /// Validate and print the effective configuration
    CheckConfig,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        // The launch timeout is clamped below the lock timeout and must stay non-zero
        if let Some(secs) = self.lock_timeout {
            if secs < 2 {
                anyhow::bail!(
                    "--lock-timeout must be at least 2 seconds so the launch timeout fits inside it"
                );
            }
        }

        if let Some(0) = self.redis_port {
            anyhow::bail!("--redis-port must be non-zero");
        }

        match &self.command {
            Command::Initiate { session_id, party_ids } => {
                if session_id.trim().is_empty() {
                    anyhow::bail!("--session-id must not be empty");
                }
                if party_ids.iter().any(|p| p.trim().is_empty()) {
                    anyhow::bail!("--party-id values must not be empty");
                }
            }
            Command::StartContainer { image } if image.trim().is_empty() => {
                anyhow::bail!("--image must not be empty");
            }
            _ => {}
        }

        Ok(())
    }
}
