//! In-memory session store
//!
//! Process-local implementation of [`SessionStore`] used by the tests and by
//! `--store memory` dry runs. It follows the Redis semantics closely: the
//! lock is a compare-and-set with a TTL, party registration is set-if-absent,
//! and result documents are opaque JSON strings.
//!
//! Like the mock runtime, it can be told to fail every call so callers can
//! exercise their store-error paths.

use super::{validate_party_ids, ContainerStatus, LockToken, SessionStore};
use crate::error::{CoordResult, CoordinatorError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
struct SessionRecord {
    container_status: Option<String>,
    container_id: Option<String>,
    party_ids: Option<Vec<String>>,
}

#[derive(Debug)]
struct HeldLock {
    token: LockToken,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, SessionRecord>,
    locks: HashMap<String, HeldLock>,
    documents: HashMap<String, String>,
}

/// Process-local session store
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,

    /// Fail every call with a store error
    unavailable: AtomicBool,

    /// Number of successful lock acquisitions
    lock_acquisitions: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> CoordResult<MutexGuard<'_, Inner>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Store("memory store marked unavailable".to_string()));
        }
        Ok(self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner()))
    }

    /// Simulate an unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Publish a result document (what the aggregation workload does)
    pub fn put_result_document(&self, key: &str, json: &str) -> CoordResult<()> {
        self.state()?.documents.insert(key.to_string(), json.to_string());
        Ok(())
    }

    /// Write raw hash fields, bypassing the invariant checks
    pub fn put_raw_status(&self, session_id: &str, status: Option<&str>, container_id: Option<&str>) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        let record = state.sessions.entry(session_id.to_string()).or_default();
        record.container_status = status.map(str::to_string);
        record.container_id = container_id.map(str::to_string);
    }

    /// Whether an unexpired lock is held for the session
    pub fn is_locked(&self, session_id: &str) -> bool {
        let state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state
            .locks
            .get(session_id)
            .map(|held| held.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub fn lock_acquisitions(&self) -> usize {
        self.lock_acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get_status(&self, session_id: &str) -> CoordResult<ContainerStatus> {
        let state = self.state()?;
        match state.sessions.get(session_id) {
            Some(record) => ContainerStatus::from_fields(
                session_id,
                record.container_status.as_deref(),
                record.container_id.as_deref(),
            ),
            None => Ok(ContainerStatus::Absent),
        }
    }

    async fn record_running(&self, session_id: &str, container_id: &str) -> CoordResult<()> {
        if container_id.is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "container_id must not be empty".to_string(),
            ));
        }

        let mut state = self.state()?;
        let record = state.sessions.entry(session_id.to_string()).or_default();
        record.container_status = Some(super::STATUS_RUNNING.to_string());
        record.container_id = Some(container_id.to_string());
        Ok(())
    }

    async fn register_parties(&self, session_id: &str, party_ids: &[String]) -> CoordResult<()> {
        validate_party_ids(session_id, party_ids)?;

        let mut state = self.state()?;
        let record = state.sessions.entry(session_id.to_string()).or_default();

        match record.party_ids {
            None => {
                record.party_ids = Some(party_ids.to_vec());
                Ok(())
            }
            Some(ref existing) if existing.as_slice() == party_ids => Ok(()),
            Some(ref existing) => Err(CoordinatorError::InvalidArgument(format!(
                "session '{}' is already initiated with parties {:?}",
                session_id, existing
            ))),
        }
    }

    async fn get_parties(&self, session_id: &str) -> CoordResult<Vec<String>> {
        let state = self.state()?;
        state
            .sessions
            .get(session_id)
            .and_then(|record| record.party_ids.clone())
            .ok_or_else(|| CoordinatorError::NotFound(format!("party list for session '{}'", session_id)))
    }

    async fn try_lock(&self, session_id: &str, ttl: Duration) -> CoordResult<Option<LockToken>> {
        let mut state = self.state()?;
        let now = Instant::now();

        if let Some(held) = state.locks.get(session_id) {
            if held.expires_at > now {
                return Ok(None);
            }
        }

        let token = LockToken::generate();
        state.locks.insert(
            session_id.to_string(),
            HeldLock {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        self.lock_acquisitions.fetch_add(1, Ordering::SeqCst);

        Ok(Some(token))
    }

    async fn unlock(&self, session_id: &str, token: &LockToken) -> CoordResult<bool> {
        let mut state = self.state()?;

        let owned = state
            .locks
            .get(session_id)
            .map(|held| &held.token == token && held.expires_at > Instant::now())
            .unwrap_or(false);

        if owned {
            state.locks.remove(session_id);
        }
        Ok(owned)
    }

    async fn get_result_document(&self, key: &str) -> CoordResult<Option<String>> {
        Ok(self.state()?.documents.get(key).cloned())
    }
}
