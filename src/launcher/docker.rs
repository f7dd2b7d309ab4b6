//! Docker runtime backed by `bollard`
//!
//! The daemon is contacted on first use, so commands that never launch a
//! container work without Docker. Named specs are created idempotently: a
//! name conflict adopts the existing container and (re)starts it.

use super::{ContainerRuntime, ContainerSpec, RuntimeCapabilities};
use crate::error::{CoordResult, CoordinatorError};
use async_trait::async_trait;
use bollard::models::{ContainerCreateBody, DeviceRequest, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateContainerOptionsBuilder, InspectContainerOptions,
    StartContainerOptions,
};
use bollard::Docker;
use tokio::sync::OnceCell;

/// First Engine API version that accepts `DeviceRequests`
const DEVICE_REQUESTS_MIN_API: (u32, u32) = (1, 40);

/// Container runtime talking to the local Docker daemon
pub struct DockerRuntime {
    state: OnceCell<Connection>,
}

struct Connection {
    docker: Docker,
    capabilities: RuntimeCapabilities,
}

impl DockerRuntime {
    /// Runtime using the local defaults (socket or `DOCKER_HOST`); does no I/O
    pub fn new() -> Self {
        Self {
            state: OnceCell::new(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state.initialized()
    }

    async fn connection(&self) -> CoordResult<&Connection> {
        self.state.get_or_try_init(connect).await
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Connect and query the API version
async fn connect() -> CoordResult<Connection> {
    let docker = Docker::connect_with_local_defaults().map_err(runtime_error)?;
    let version = docker.version().await.map_err(runtime_error)?;

    let api_version = version.api_version.unwrap_or_default();
    let capabilities = RuntimeCapabilities {
        device_requests: supports_device_requests(&api_version),
        shm_size: true,
    };

    tracing::info!(
        api_version = %api_version,
        device_requests = capabilities.device_requests,
        "Connected to Docker daemon"
    );

    Ok(Connection {
        docker,
        capabilities,
    })
}

fn runtime_error(err: bollard::errors::Error) -> CoordinatorError {
    CoordinatorError::Runtime(err.to_string())
}

fn supports_device_requests(api_version: &str) -> bool {
    let mut parts = api_version.split('.').map(|p| p.parse::<u32>().ok());
    match (parts.next().flatten(), parts.next().flatten()) {
        (Some(major), Some(minor)) => (major, minor) >= DEVICE_REQUESTS_MIN_API,
        _ => false,
    }
}

fn create_body(spec: &ContainerSpec) -> CoordResult<ContainerCreateBody> {
    let shm_size = match spec.shm_size {
        Some(bytes) => Some(i64::try_from(bytes).map_err(|_| {
            CoordinatorError::InvalidArgument(format!("shm_size {} out of range", bytes))
        })?),
        None => None,
    };

    let device_requests = spec.gpu.as_ref().map(|gpu| {
        vec![DeviceRequest {
            driver: Some(gpu.driver.clone()),
            count: Some(gpu.count),
            capabilities: Some(gpu.capabilities.clone()),
            ..Default::default()
        }]
    });

    let host_config = HostConfig {
        binds: Some(spec.binds()),
        device_requests,
        shm_size,
        network_mode: spec.network.clone(),
        auto_remove: Some(spec.auto_remove),
        ..Default::default()
    };

    Ok(ContainerCreateBody {
        image: Some(spec.image.clone()),
        env: Some(spec.env_strings()),
        host_config: Some(host_config),
        ..Default::default()
    })
}

fn create_options(spec: &ContainerSpec) -> Option<CreateContainerOptions> {
    spec.name
        .as_deref()
        .map(|name| CreateContainerOptionsBuilder::default().name(name).build())
}

/// Id of the container already holding `name`
async fn existing_container(docker: &Docker, name: &str) -> CoordResult<String> {
    let info = docker
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
        .map_err(runtime_error)?;

    info.id.ok_or_else(|| {
        CoordinatorError::Runtime(format!("container '{}' has no id", name))
    })
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run_detached(&self, spec: &ContainerSpec) -> CoordResult<String> {
        let docker = &self.connection().await?.docker;
        let body = create_body(spec)?;

        let created = docker.create_container(create_options(spec), body).await;
        let id = match (created, spec.name.as_deref()) {
            (Ok(response), _) => response.id,
            (
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }),
                _,
            ) => {
                return Err(CoordinatorError::ImageNotFound {
                    image: spec.image.clone(),
                })
            }
            (
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                }),
                Some(name),
            ) => {
                let id = existing_container(docker, name).await?;
                tracing::warn!(
                    container_name = %name,
                    container_id = %id,
                    "Adopting existing container"
                );
                id
            }
            (Err(e), _) => return Err(runtime_error(e)),
        };

        match docker
            .start_container(&id, None::<StartContainerOptions>)
            .await
        {
            Ok(()) => {}
            // Already running
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {}
            Err(e) => return Err(runtime_error(e)),
        }

        Ok(id)
    }

    async fn capabilities(&self) -> CoordResult<RuntimeCapabilities> {
        Ok(self.connection().await?.capabilities)
    }
}
