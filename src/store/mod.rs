//! Session store abstraction
//!
//! The session store is the shared key-value state every coordinator process
//! sees: per-session container status, the registered party list, an
//! advisory per-session lock, and the result documents published by the
//! aggregation workload.
//!
//! # Wire Layout
//!
//! ```text
//! session:<session_id>   hash   container_status = "running"
//!                               container_id     = "<runtime id>"
//!                               party_ids        = "[\"A\",\"B\",\"C\"]"
//! lock:<session_id>      string <owner token>, expires after the lock TTL
//! <session_id>           JSON   result document written by the workload
//! ```
//!
//! # Backends
//!
//! - **redis**: production backend shared between processes (feature `redis-store`)
//! - **memory**: process-local backend for tests and dry runs

pub mod memory;
#[cfg(feature = "redis-store")]
pub mod redis;

use crate::error::{CoordResult, CoordinatorError};
use async_trait::async_trait;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Hash field holding the container status
pub const FIELD_CONTAINER_STATUS: &str = "container_status";

/// Hash field holding the container id
pub const FIELD_CONTAINER_ID: &str = "container_id";

/// Hash field holding the JSON-encoded party list
pub const FIELD_PARTY_IDS: &str = "party_ids";

/// Stored value of `container_status` for a launched container
pub const STATUS_RUNNING: &str = "running";

/// Key of the per-session state hash
pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Key of the per-session lock
pub fn lock_key(session_id: &str) -> String {
    format!("lock:{}", session_id)
}

/// Container status of a session
///
/// A container id exists only in the `Running` variant, so a status can never
/// carry an id without being running (or be running without an id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ContainerStatus {
    /// No record, or no container launched yet
    Absent,
    /// A container was launched for the session
    Running {
        #[serde(rename = "id")]
        container_id: String,
    },
}

impl ContainerStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn container_id(&self) -> Option<&str> {
        match self {
            Self::Running { container_id } => Some(container_id),
            Self::Absent => None,
        }
    }

    /// Decode the two hash fields, rejecting records that break the invariant
    pub fn from_fields(
        session_id: &str,
        status: Option<&str>,
        container_id: Option<&str>,
    ) -> CoordResult<Self> {
        match (status, container_id) {
            (None, None) => Ok(Self::Absent),
            (Some(STATUS_RUNNING), Some(id)) if !id.is_empty() => Ok(Self::Running {
                container_id: id.to_string(),
            }),
            (status, id) => Err(CoordinatorError::Store(format!(
                "inconsistent record for session '{}': container_status={:?}, container_id={:?}",
                session_id, status, id
            ))),
        }
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Running { container_id } => write!(f, "running ({})", container_id),
        }
    }
}

/// Opaque proof of lock ownership
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken(String);

impl LockToken {
    /// Generate a token unique to this process and acquisition
    pub fn generate() -> Self {
        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self(format!(
            "{}:{}:{:016x}",
            host,
            std::process::id(),
            rand::random::<u64>()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Shared session state
///
/// Implementations must give read-after-write consistency for a session's
/// status as observed by the writer. Lock acquisition never blocks.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Current container status (`Absent` when there is no record)
    async fn get_status(&self, session_id: &str) -> CoordResult<ContainerStatus>;

    /// Upsert `running` + container id; last writer wins
    async fn record_running(&self, session_id: &str, container_id: &str) -> CoordResult<()>;

    /// Register the ordered party list of a session
    ///
    /// Registering the identical list again succeeds without changes; a
    /// different list for an initiated session is `InvalidArgument`.
    async fn register_parties(&self, session_id: &str, party_ids: &[String]) -> CoordResult<()>;

    /// Registered party list, or `NotFound` if the session was never initiated
    async fn get_parties(&self, session_id: &str) -> CoordResult<Vec<String>>;

    /// Try to take the session lock without waiting
    ///
    /// Returns `None` when another owner holds an unexpired lock.
    async fn try_lock(&self, session_id: &str, ttl: Duration) -> CoordResult<Option<LockToken>>;

    /// Release the lock if `token` still owns it; returns whether it did
    async fn unlock(&self, session_id: &str, token: &LockToken) -> CoordResult<bool>;

    /// Raw JSON document stored under `key`
    async fn get_result_document(&self, key: &str) -> CoordResult<Option<String>>;
}

/// Reject identifiers that are empty or would escape their directory
pub fn validate_identifier(what: &str, value: &str) -> CoordResult<()> {
    if value.trim().is_empty() {
        return Err(CoordinatorError::InvalidArgument(format!("{} must not be empty", what)));
    }

    if value.contains('/') || value.contains('\\') || value == "." || value == ".." {
        return Err(CoordinatorError::InvalidArgument(format!(
            "{} '{}' contains path components",
            what, value
        )));
    }

    Ok(())
}

/// Validate a party list before registration
pub fn validate_party_ids(session_id: &str, party_ids: &[String]) -> CoordResult<()> {
    validate_identifier("session_id", session_id)?;

    if party_ids.is_empty() {
        return Err(CoordinatorError::InvalidArgument(
            "party_ids must be a non-empty sequence".to_string(),
        ));
    }

    for party_id in party_ids {
        validate_identifier("party_id", party_id)?;
        if party_id == crate::upload::GLOBAL_DIR {
            return Err(CoordinatorError::InvalidArgument(format!(
                "party_id '{}' is reserved for global models",
                party_id
            )));
        }
    }

    let mut seen = std::collections::HashSet::new();
    if let Some(dup) = party_ids.iter().find(|p| !seen.insert(p.as_str())) {
        return Err(CoordinatorError::InvalidArgument(format!(
            "party_id '{}' is listed more than once",
            dup
        )));
    }

    Ok(())
}

/// Scoped ownership of a session lock
///
/// Call [`LockGuard::release`] on every normal exit path. If the guard is
/// dropped unreleased (early return, panic unwinding) the release is spawned
/// onto the current tokio runtime; the TTL bounds the hold otherwise.
pub struct LockGuard {
    store: Arc<dyn SessionStore>,
    session_id: String,
    token: Option<LockToken>,
}

impl LockGuard {
    /// Try to acquire the session lock; `None` means it is held elsewhere
    pub async fn try_acquire(
        store: Arc<dyn SessionStore>,
        session_id: &str,
        ttl: Duration,
    ) -> CoordResult<Option<Self>> {
        let token = store.try_lock(session_id, ttl).await?;

        Ok(token.map(|token| Self {
            store,
            session_id: session_id.to_string(),
            token: Some(token),
        }))
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Release the lock now
    pub async fn release(mut self) -> CoordResult<()> {
        if let Some(token) = self.token.take() {
            let released = self.store.unlock(&self.session_id, &token).await?;
            if !released {
                tracing::warn!(
                    session_id = %self.session_id,
                    "Session lock expired before release"
                );
            }
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        let store = self.store.clone();
        let session_id = std::mem::take(&mut self.session_id);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.unlock(&session_id, &token).await {
                        tracing::error!(session_id = %session_id, error = %e, "Deferred lock release failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    session_id = %session_id,
                    "No runtime to release session lock; it will expire on its TTL"
                );
            }
        }
    }
}
