//! fedlaunch - session-scoped, at-most-once container launches
//!
//! Coordinates a multi-party federated-learning workflow: parties upload
//! local model artifacts for a session, and exactly one aggregation container
//! is launched per session once uploads arrive.
//!
//! # Architecture
//!
//! - **Session store**: shared per-session state and a non-blocking per-session lock (Redis or in-memory)
//! - **Upload tracker**: deterministic artifact paths with atomic completion markers
//! - **Launch coordinator**: fast-path status check, lock, launch, record
//! - **Container launcher**: per-party mounts and environment, Docker or mock runtime
//! - **Result reader**: published scores from the store or a results directory

pub mod config;
pub mod coordinator;
pub mod error;
pub mod launcher;
pub mod results;
pub mod store;
pub mod upload;
pub mod util;

// Re-export commonly used types
pub use config::Config;
pub use coordinator::{Coordinator, CoordinatorOptions, LaunchOutcome, UploadResponse};
pub use error::{CoordResult, CoordinatorError};
pub use store::{ContainerStatus, SessionStore};

/// Result type used for application plumbing
pub type Result<T> = anyhow::Result<T>;
