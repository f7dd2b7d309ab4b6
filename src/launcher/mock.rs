//! Mock container runtime for testing
//!
//! Records every spec it is asked to run and hands out sequential container
//! ids without touching a real daemon. Like a daemon, it registers a
//! container at create time, before the (optionally delayed) start, and
//! adopts an existing container when a spec names one.
//!
//! # Features
//!
//! - Configurable failure mode (missing image or generic runtime error)
//! - Optional artificial start latency
//! - Launch and create counting, spec recording for assertions
//! - Configurable capabilities

use super::{ContainerRuntime, ContainerSpec, RuntimeCapabilities};
use crate::error::{CoordResult, CoordinatorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the mock should fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFailure {
    ImageNotFound,
    Runtime(String),
}

/// Mock container runtime
#[derive(Clone)]
pub struct MockRuntime {
    /// Failure to report, if any
    failure: Arc<Mutex<Option<MockFailure>>>,

    /// Delay between create and a completed start
    delay: Arc<Mutex<Option<Duration>>>,

    /// Successful launches so far
    launches: Arc<AtomicUsize>,

    /// Containers created so far
    created: Arc<AtomicUsize>,

    /// Named containers and their ids
    named: Arc<Mutex<HashMap<String, String>>>,

    /// Every spec passed to `run_detached`, including failed ones
    specs: Arc<Mutex<Vec<ContainerSpec>>>,

    capabilities: RuntimeCapabilities,
}

impl MockRuntime {
    /// Runtime that succeeds and supports every feature
    pub fn new() -> Self {
        Self::with_capabilities(RuntimeCapabilities {
            device_requests: true,
            shm_size: true,
        })
    }

    pub fn with_capabilities(capabilities: RuntimeCapabilities) -> Self {
        Self {
            failure: Arc::new(Mutex::new(None)),
            delay: Arc::new(Mutex::new(None)),
            launches: Arc::new(AtomicUsize::new(0)),
            created: Arc::new(AtomicUsize::new(0)),
            named: Arc::new(Mutex::new(HashMap::new())),
            specs: Arc::new(Mutex::new(Vec::new())),
            capabilities,
        }
    }

    /// Make every launch fail (or succeed again with `None`)
    pub fn set_failure(&self, failure: Option<MockFailure>) {
        *self.failure.lock().unwrap_or_else(|p| p.into_inner()) = failure;
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(|p| p.into_inner()) = delay;
    }

    /// Number of successful launches
    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Number of containers created (adoptions excluded)
    pub fn containers_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Copy of every spec submitted so far
    pub fn launched_specs(&self) -> Vec<ContainerSpec> {
        self.specs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn run_detached(&self, spec: &ContainerSpec) -> CoordResult<String> {
        self.specs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(spec.clone());

        let failure = self.failure.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match failure {
            Some(MockFailure::ImageNotFound) => {
                return Err(CoordinatorError::ImageNotFound {
                    image: spec.image.clone(),
                })
            }
            Some(MockFailure::Runtime(msg)) => return Err(CoordinatorError::Runtime(msg)),
            None => {}
        }

        let id = {
            let mut named = self.named.lock().unwrap_or_else(|p| p.into_inner());
            match spec.name.as_ref().and_then(|name| named.get(name)) {
                Some(existing) => existing.clone(),
                None => {
                    let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
                    let id = format!("mock-{:04}", n);
                    if let Some(name) = &spec.name {
                        named.insert(name.clone(), id.clone());
                    }
                    id
                }
            }
        };

        let delay = *self.delay.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.launches.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn capabilities(&self) -> CoordResult<RuntimeCapabilities> {
        Ok(self.capabilities)
    }
}
