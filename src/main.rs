//! fedlaunch CLI entry point

use anyhow::{Context, Result};
use fedlaunch::config::cli::{Cli, Command};
use fedlaunch::config::{Config, ResultSource, StoreBackend};
use fedlaunch::coordinator::{Coordinator, CoordinatorOptions};
use fedlaunch::launcher::{ContainerRuntime, LaunchPlanner, Launcher};
use fedlaunch::results::ResultReader;
use fedlaunch::store::memory::MemoryStore;
use fedlaunch::store::SessionStore;
use fedlaunch::upload::{ModelKind, UploadRequest, UploadTracker};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();
    cli.validate()?;

    let config = fedlaunch::config::toml::load_config(&cli)?;
    fedlaunch::config::validator::validate_config(&config)
        .context("Configuration validation failed")?;

    fedlaunch::util::logging::init_tracing(&config.logging)?;

    if let Command::CheckConfig = cli.command {
        print!("{}", ::toml::to_string_pretty(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let coordinator = build_coordinator(&config).await?;

    match command {
        Command::Initiate {
            session_id,
            party_ids,
        } => match coordinator.initiate_session(&session_id, &party_ids).await {
            Ok(()) => {
                print_json(&json!({
                    "message": "Session initiated",
                    "session_id": session_id,
                    "party_ids": party_ids,
                }));
                Ok(())
            }
            Err(e) => {
                print_json(&e.to_json());
                Err(e).context("Failed to initiate session")
            }
        },

        Command::Upload {
            file,
            session_id,
            party_id,
            epoch,
            global,
        } => {
            let model_kind = if global { ModelKind::Global } else { ModelKind::Local };
            run_upload(&coordinator, &config, &file, session_id, party_id, epoch, model_kind).await
        }

        Command::Result { session_id } => match coordinator.get_result(&session_id).await {
            Ok(value) => {
                print_json(&value);
                Ok(())
            }
            Err(e) => {
                print_json(&e.to_json());
                Err(e).context("Failed to fetch result")
            }
        },

        Command::Status { session_id } => {
            let status = coordinator.session_status(&session_id).await?;
            print_json(&serde_json::to_value(&status)?);
            Ok(())
        }

        Command::StartContainer { image } => match coordinator.start_container(&image).await {
            Ok(container_id) => {
                print_json(&json!({
                    "message": "Container started",
                    "container_id": container_id,
                }));
                Ok(())
            }
            Err(e) => {
                print_json(&e.to_json());
                Err(e).context("Failed to start container")
            }
        },

        Command::CheckConfig => Ok(()),
    }
}

async fn run_upload(
    coordinator: &Coordinator,
    config: &Config,
    file: &Path,
    session_id: String,
    party_id: String,
    epoch: String,
    model_kind: ModelKind,
) -> Result<()> {
    let filename = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if filename.is_empty() {
        print_json(&json!({"error": "No selected file"}));
        anyhow::bail!("No file name in {}", file.display());
    }

    if !config.uploads.is_allowed_file(&filename) {
        print_json(&json!({"error": "File type not allowed"}));
        anyhow::bail!("File type not allowed: {}", filename);
    }

    let payload = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;

    let request = UploadRequest {
        session_id,
        party_id,
        epoch,
        model_kind,
        filename,
    };

    let response = coordinator.upload(&request, &payload).await;
    print_json(&response.to_json());

    if !response.is_success() {
        anyhow::bail!("Upload for session '{}' did not complete", request.session_id);
    }
    Ok(())
}

async fn build_coordinator(config: &Config) -> Result<Coordinator> {
    let store: Arc<dyn SessionStore> = match config.store.backend {
        StoreBackend::Redis => connect_redis(config).await?,
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory session store; locks are not shared between processes");
            Arc::new(MemoryStore::new())
        }
    };

    let tracker = UploadTracker::new(&config.uploads.root, config.uploads.completion_marker);
    tracker.ensure_root().context("Failed to create upload root")?;

    let results = match config.results.source {
        ResultSource::Store => ResultReader::Store(store.clone()),
        ResultSource::Directory => {
            let dir = config
                .results
                .directory
                .clone()
                .context("results.directory is required for the directory source")?;
            ResultReader::Directory(dir)
        }
    };

    let planner = LaunchPlanner::from_config(config)?;
    let launcher = Launcher::new(planner, container_runtime());

    Ok(Coordinator::new(
        store,
        launcher,
        tracker,
        results,
        CoordinatorOptions::from_config(config),
    ))
}

#[cfg(feature = "redis-store")]
async fn connect_redis(config: &Config) -> Result<Arc<dyn SessionStore>> {
    let store = fedlaunch::store::redis::RedisStore::connect(&config.store.url())
        .await
        .with_context(|| format!("Failed to connect to session store at {}", config.store.url()))?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis-store"))]
async fn connect_redis(_config: &Config) -> Result<Arc<dyn SessionStore>> {
    anyhow::bail!("Built without the `redis-store` feature; use --store memory")
}

/// Runtime handle; the daemon is only contacted when a container is launched
#[cfg(feature = "docker")]
fn container_runtime() -> Arc<dyn ContainerRuntime> {
    Arc::new(fedlaunch::launcher::docker::DockerRuntime::new())
}

#[cfg(not(feature = "docker"))]
fn container_runtime() -> Arc<dyn ContainerRuntime> {
    Arc::new(NoRuntime)
}

#[cfg(not(feature = "docker"))]
struct NoRuntime;

#[cfg(not(feature = "docker"))]
#[async_trait::async_trait]
impl ContainerRuntime for NoRuntime {
    async fn run_detached(
        &self,
        _spec: &fedlaunch::launcher::ContainerSpec,
    ) -> fedlaunch::error::CoordResult<String> {
        Err(no_runtime())
    }

    async fn capabilities(
        &self,
    ) -> fedlaunch::error::CoordResult<fedlaunch::launcher::RuntimeCapabilities> {
        Err(no_runtime())
    }
}

#[cfg(not(feature = "docker"))]
fn no_runtime() -> fedlaunch::error::CoordinatorError {
    fedlaunch::error::CoordinatorError::Runtime(
        "built without the `docker` feature; no container runtime available".to_string(),
    )
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{}", value),
    }
}
