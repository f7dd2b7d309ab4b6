//! Launch coordinator
//!
//! Decides, per session, whether the aggregation container must be launched
//! and makes sure at most one request ever launches it.
//!
//! # Launch Decision
//!
//! ```text
//! get_status ──Running──────────────────────────────> AlreadyRunning (no lock)
//!     │
//!   Absent
//!     │
//! try_lock ──held elsewhere──> LockContention
//!     │
//! get_status ──Running──────────────────────────────> AlreadyRunning
//!     │
//! get_parties ──missing──> SessionNotInitiated
//!     │
//! launch (bounded by launch_timeout) ──error──> error, session stays Absent
//!     │
//! record_running ──> Launched
//! ```
//!
//! The lock is released on every path. The status read before the lock is
//! only a fast path; the read under the lock is what prevents a second
//! launch after another request has already finished.
//!
//! A launch that times out may still have created its container. Session
//! containers carry a name derived from the session id, so the next launch
//! adopts that container instead of creating another one.

use crate::config::Config;
use crate::error::{CoordResult, CoordinatorError};
use crate::launcher::Launcher;
use crate::results::ResultReader;
use crate::store::{validate_identifier, ContainerStatus, LockGuard, SessionStore};
use crate::upload::{UploadReceipt, UploadRequest, UploadTracker};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Result of a launch decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum LaunchOutcome {
    /// A container was already recorded for the session
    AlreadyRunning { container_id: String },
    /// This request launched the container
    Launched { container_id: String },
}

impl LaunchOutcome {
    pub fn container_id(&self) -> &str {
        match self {
            Self::AlreadyRunning { container_id } | Self::Launched { container_id } => container_id,
        }
    }

    pub fn launched(&self) -> bool {
        matches!(self, Self::Launched { .. })
    }
}

/// Upload outcome and launch outcome, reported independently
#[derive(Debug)]
pub struct UploadResponse {
    pub upload: CoordResult<UploadReceipt>,
    /// Absent when the upload itself failed
    pub launch: Option<CoordResult<LaunchOutcome>>,
}

impl UploadResponse {
    /// Both the upload and the launch decision succeeded
    pub fn is_success(&self) -> bool {
        self.upload.is_ok() && matches!(self.launch, Some(Ok(_)))
    }

    /// JSON response body
    pub fn to_json(&self) -> Value {
        let receipt = match &self.upload {
            Ok(receipt) => receipt,
            Err(e) => {
                return json!({
                    "error": "Failed to save file",
                    "error_kind": e.kind(),
                    "detail": e.to_string(),
                })
            }
        };

        let mut body = json!({
            "message": "File uploaded successfully",
            "filename": receipt.filename,
            "path": receipt.path,
            "bytes": receipt.bytes,
        });

        match &self.launch {
            Some(Ok(outcome)) => {
                body["container"] = json!({
                    "status": "running",
                    "id": outcome.container_id(),
                    "launched": outcome.launched(),
                });
            }
            Some(Err(e)) => {
                body["error"] = json!(launch_error_message(e));
                body["error_kind"] = json!(e.kind());
            }
            None => {}
        }

        body
    }
}

fn launch_error_message(err: &CoordinatorError) -> String {
    match err {
        CoordinatorError::LockContention { .. } => {
            "Failed to acquire lock. Skipping launching container operation ...".to_string()
        }
        CoordinatorError::SessionNotInitiated { session_id } => {
            format!("Session '{}' has not been initiated", session_id)
        }
        other => format!("Failed to start container: {}", other),
    }
}

/// Observable state of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: String,
    /// `None` when the session was never initiated
    pub party_ids: Option<Vec<String>>,
    pub container: ContainerStatus,
}

/// Tunables of the launch path
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Image launched for every session
    pub image: String,
    pub lock_ttl: Duration,
    /// Must be shorter than `lock_ttl`
    pub launch_timeout: Duration,
}

impl CoordinatorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            image: config.launcher.image.clone(),
            lock_ttl: config.lock.timeout(),
            launch_timeout: config.launcher.launch_timeout(),
        }
    }
}

/// Session-scoped, at-most-once launch coordinator
pub struct Coordinator {
    store: Arc<dyn SessionStore>,
    launcher: Launcher,
    tracker: UploadTracker,
    results: ResultReader,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        launcher: Launcher,
        tracker: UploadTracker,
        results: ResultReader,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            store,
            launcher,
            tracker,
            results,
            options,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Register the ordered party list of a session
    pub async fn initiate_session(&self, session_id: &str, party_ids: &[String]) -> CoordResult<()> {
        self.store.register_parties(session_id, party_ids).await?;
        tracing::info!(session_id = %session_id, parties = ?party_ids, "Session initiated");
        Ok(())
    }

    /// Store an artifact, then make sure the session's container runs
    pub async fn upload(&self, request: &UploadRequest, payload: &[u8]) -> UploadResponse {
        let upload = self.tracker.store(request, payload).await;

        let launch = match &upload {
            Ok(_) => Some(self.ensure_container(&request.session_id).await),
            Err(e) => {
                tracing::error!(session_id = %request.session_id, error = %e, "Failed to save file");
                None
            }
        };

        UploadResponse { upload, launch }
    }

    /// Launch the session's container unless one is already recorded
    pub async fn ensure_container(&self, session_id: &str) -> CoordResult<LaunchOutcome> {
        validate_identifier("session_id", session_id)?;

        if let ContainerStatus::Running { container_id } = self.store.get_status(session_id).await? {
            tracing::info!(session_id = %session_id, container_id = %container_id, "Container found, skipping launch");
            return Ok(LaunchOutcome::AlreadyRunning { container_id });
        }

        let guard =
            match LockGuard::try_acquire(self.store.clone(), session_id, self.options.lock_ttl).await? {
                Some(guard) => guard,
                None => {
                    tracing::warn!(session_id = %session_id, "Failed to acquire lock, skipping launch");
                    return Err(CoordinatorError::LockContention {
                        session_id: session_id.to_string(),
                    });
                }
            };

        let outcome = self.launch_locked(session_id).await;

        if let Err(e) = guard.release().await {
            tracing::warn!(session_id = %session_id, error = %e, "Failed to release session lock");
        }

        outcome
    }

    async fn launch_locked(&self, session_id: &str) -> CoordResult<LaunchOutcome> {
        if let ContainerStatus::Running { container_id } = self.store.get_status(session_id).await? {
            tracing::info!(session_id = %session_id, container_id = %container_id, "Container launched by another request");
            return Ok(LaunchOutcome::AlreadyRunning { container_id });
        }

        let party_ids = match self.store.get_parties(session_id).await {
            Ok(parties) => parties,
            Err(CoordinatorError::NotFound(_)) => {
                tracing::warn!(session_id = %session_id, "Session not initiated, skipping launch");
                return Err(CoordinatorError::SessionNotInitiated {
                    session_id: session_id.to_string(),
                });
            }
            Err(e) => return Err(e),
        };

        tracing::info!(session_id = %session_id, parties = party_ids.len(), "Container not found, starting container");

        let launch = self
            .launcher
            .launch(&self.options.image, session_id, &party_ids);
        let container_id = match tokio::time::timeout(self.options.launch_timeout, launch).await {
            Ok(Ok(id)) => id,
            Ok(Err(e)) => {
                tracing::error!(session_id = %session_id, error = %e, "Failed to start container");
                return Err(e);
            }
            Err(_) => {
                tracing::error!(
                    session_id = %session_id,
                    "Container launch timed out; the next launch adopts the session container"
                );
                return Err(CoordinatorError::Runtime(format!(
                    "launch timed out after {:?}",
                    self.options.launch_timeout
                )));
            }
        };

        if let Err(e) = self.store.record_running(session_id, &container_id).await {
            tracing::error!(
                session_id = %session_id,
                container_id = %container_id,
                error = %e,
                "Container started but its status could not be recorded"
            );
            return Err(e);
        }

        Ok(LaunchOutcome::Launched { container_id })
    }

    /// Registered parties and container status, without side effects
    pub async fn session_status(&self, session_id: &str) -> CoordResult<SessionStatus> {
        validate_identifier("session_id", session_id)?;

        let party_ids = match self.store.get_parties(session_id).await {
            Ok(parties) => Some(parties),
            Err(CoordinatorError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };
        let container = self.store.get_status(session_id).await?;

        Ok(SessionStatus {
            session_id: session_id.to_string(),
            party_ids,
            container,
        })
    }

    /// Start an arbitrary image with the logs mount only
    pub async fn start_container(&self, image: &str) -> CoordResult<String> {
        if image.trim().is_empty() {
            return Err(CoordinatorError::InvalidArgument(
                "Image name is required".to_string(),
            ));
        }
        self.launcher.start_adhoc(image).await
    }

    /// Published result of a session
    pub async fn get_result(&self, session_id: &str) -> CoordResult<Value> {
        tracing::info!(session_id = %session_id, "Fetching result");
        self.results.get_result(session_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::mock::{MockFailure, MockRuntime};
    use crate::launcher::LaunchPlanner;
    use crate::store::memory::MemoryStore;
    use crate::upload::ModelKind;
    use std::path::PathBuf;
    use tempfile::TempDir;

    struct Fixture {
        coordinator: Arc<Coordinator>,
        store: Arc<MemoryStore>,
        runtime: Arc<MockRuntime>,
        _temp_dir: TempDir,
    }

    fn fixture_with(options: CoordinatorOptions) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let runtime = Arc::new(MockRuntime::new());

        let mut config = Config::default();
        config.uploads.root = temp_dir.path().join("uploads");
        config.launcher.host_logs_path = PathBuf::from("/srv/logs");
        config.launcher.host_validation_path = PathBuf::from("/srv/validation");

        let launcher = Launcher::new(LaunchPlanner::from_config(&config).unwrap(), runtime.clone());
        let tracker = UploadTracker::new(&config.uploads.root, true);
        let results = ResultReader::Store(store.clone());

        let coordinator = Coordinator::new(store.clone(), launcher, tracker, results, options);

        Fixture {
            coordinator: Arc::new(coordinator),
            store,
            runtime,
            _temp_dir: temp_dir,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CoordinatorOptions::from_config(&Config::default()))
    }

    fn parties(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn local_upload(session_id: &str, party_id: &str) -> UploadRequest {
        UploadRequest {
            session_id: session_id.to_string(),
            party_id: party_id.to_string(),
            epoch: "1".to_string(),
            model_kind: ModelKind::Local,
            filename: "model.tar".to_string(),
        }
    }

    /// Status in the store is readable (the id/status pair is consistent)
    async fn assert_consistent(store: &MemoryStore, session_id: &str) -> ContainerStatus {
        store.get_status(session_id).await.expect("consistent session record")
    }

    #[tokio::test]
    async fn test_upload_launches_container() {
        let f = fixture();
        f.coordinator
            .initiate_session("S1", &parties(&["A", "B", "C"]))
            .await
            .unwrap();

        let response = f.coordinator.upload(&local_upload("S1", "A"), b"weights").await;
        assert!(response.is_success());

        let receipt = response.upload.as_ref().unwrap();
        assert!(receipt.path.ends_with("S1/A/model1.tar.done"));

        let outcome = response.launch.as_ref().unwrap().as_ref().unwrap();
        assert!(outcome.launched());

        let status = assert_consistent(&f.store, "S1").await;
        assert_eq!(status.container_id(), Some(outcome.container_id()));

        let specs = f.runtime.launched_specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].env_var("PARTY_ID0"), Some("A"));
        assert_eq!(specs[0].env_var("PARTY_ID1"), Some("B"));
        assert_eq!(specs[0].env_var("PARTY_ID2"), Some("C"));
        assert_eq!(specs[0].env_var("SESSION_ID"), Some("S1"));
        assert!(!f.store.is_locked("S1"));
    }

    #[tokio::test]
    async fn test_second_upload_takes_fast_path() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A", "B"])).await.unwrap();

        let first = f.coordinator.upload(&local_upload("S1", "A"), b"a").await;
        let second = f.coordinator.upload(&local_upload("S1", "B"), b"b").await;

        let first_id = first.launch.unwrap().unwrap().container_id().to_string();
        let second = second.launch.unwrap().unwrap();
        assert_eq!(
            second,
            LaunchOutcome::AlreadyRunning {
                container_id: first_id
            }
        );

        assert_eq!(f.runtime.launch_count(), 1);
        assert_eq!(f.store.lock_acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_uninitiated_session() {
        let f = fixture();

        let response = f.coordinator.upload(&local_upload("S9", "A"), b"x").await;
        assert!(response.upload.is_ok());

        let err = response.launch.unwrap().unwrap_err();
        assert_eq!(err.kind(), "session_not_initiated");
        assert_eq!(f.runtime.launch_count(), 0);
        assert!(!f.store.is_locked("S9"));
        assert_eq!(assert_consistent(&f.store, "S9").await, ContainerStatus::Absent);
    }

    #[tokio::test]
    async fn test_lock_contention_fails_fast() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        let _held = f.store.try_lock("S1", Duration::from_secs(10)).await.unwrap().unwrap();

        let err = f.coordinator.ensure_container("S1").await.unwrap_err();
        assert_eq!(err.kind(), "lock_contention");
        assert_eq!(f.runtime.launch_count(), 0);
        assert_eq!(assert_consistent(&f.store, "S1").await, ContainerStatus::Absent);
    }

    #[tokio::test]
    async fn test_launch_failure_releases_lock() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();
        f.runtime.set_failure(Some(MockFailure::ImageNotFound));

        let err = f.coordinator.ensure_container("S1").await.unwrap_err();
        assert_eq!(err.kind(), "image_not_found");
        assert!(!f.store.is_locked("S1"));
        assert_eq!(assert_consistent(&f.store, "S1").await, ContainerStatus::Absent);

        // No automatic retry, but the next request can launch
        f.runtime.set_failure(None);
        let outcome = f.coordinator.ensure_container("S1").await.unwrap();
        assert!(outcome.launched());
    }

    #[tokio::test]
    async fn test_runtime_error_reported_with_upload() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();
        f.runtime
            .set_failure(Some(MockFailure::Runtime("daemon unavailable".to_string())));

        let response = f.coordinator.upload(&local_upload("S1", "A"), b"x").await;
        assert!(response.upload.is_ok());
        assert!(!response.is_success());

        let body = response.to_json();
        assert_eq!(body["message"], "File uploaded successfully");
        assert_eq!(body["filename"], "model1.tar");
        assert_eq!(body["error_kind"], "runtime_error");
        assert!(body.get("container").is_none());
    }

    #[tokio::test]
    async fn test_launch_timeout_releases_lock() {
        let f = fixture_with(CoordinatorOptions {
            image: "img".to_string(),
            lock_ttl: Duration::from_secs(5),
            launch_timeout: Duration::from_millis(50),
        });
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();
        f.runtime.set_delay(Some(Duration::from_millis(500)));

        let err = f.coordinator.ensure_container("S1").await.unwrap_err();
        assert_eq!(err.kind(), "runtime_error");
        assert!(err.to_string().contains("timed out"));
        assert!(!f.store.is_locked("S1"));
        assert_eq!(assert_consistent(&f.store, "S1").await, ContainerStatus::Absent);
    }

    #[tokio::test]
    async fn test_timed_out_launch_is_adopted() {
        let f = fixture_with(CoordinatorOptions {
            image: "img".to_string(),
            lock_ttl: Duration::from_secs(5),
            launch_timeout: Duration::from_millis(50),
        });
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        // Container is created, but its start outlives the launch timeout
        f.runtime.set_delay(Some(Duration::from_millis(200)));
        let err = f.coordinator.ensure_container("S1").await.unwrap_err();
        assert_eq!(err.kind(), "runtime_error");
        assert_eq!(f.runtime.containers_created(), 1);

        f.runtime.set_delay(None);
        let outcome = f.coordinator.ensure_container("S1").await.unwrap();
        assert!(outcome.launched());
        assert_eq!(outcome.container_id(), "mock-0001");
        assert_eq!(f.runtime.containers_created(), 1);

        let status = assert_consistent(&f.store, "S1").await;
        assert_eq!(status.container_id(), Some("mock-0001"));
        assert_eq!(
            f.runtime.launched_specs()[1].name.as_deref(),
            Some("fedlaunch_S1")
        );
    }

    #[tokio::test]
    async fn test_store_failure_skips_launch() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();
        f.store.set_unavailable(true);

        let response = f.coordinator.upload(&local_upload("S1", "A"), b"x").await;
        assert!(response.upload.is_ok());
        assert_eq!(response.launch.unwrap().unwrap_err().kind(), "store_error");
        assert_eq!(f.runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_upload_skips_launch() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        let mut request = local_upload("S1", "A");
        request.filename = "noextension".to_string();

        let response = f.coordinator.upload(&request, b"x").await;
        assert_eq!(response.upload.as_ref().unwrap_err().kind(), "invalid_argument");
        assert!(response.launch.is_none());
        assert_eq!(f.runtime.launch_count(), 0);

        let body = response.to_json();
        assert_eq!(body["error"], "Failed to save file");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_uploads_launch_once() {
        let f = fixture();
        f.coordinator
            .initiate_session("S1", &parties(&["A", "B", "C"]))
            .await
            .unwrap();
        f.runtime.set_delay(Some(Duration::from_millis(50)));

        let mut handles = Vec::new();
        for i in 0..16 {
            let coordinator = f.coordinator.clone();
            let party = ["A", "B", "C"][i % 3];
            handles.push(tokio::spawn(async move {
                coordinator.upload(&local_upload("S1", party), b"w").await
            }));
        }

        let mut launched = 0;
        for handle in handles {
            let response = handle.await.unwrap();
            assert!(response.upload.is_ok());
            match response.launch.unwrap() {
                Ok(LaunchOutcome::Launched { .. }) => launched += 1,
                Ok(LaunchOutcome::AlreadyRunning { .. }) => {}
                Err(e) => assert_eq!(e.kind(), "lock_contention"),
            }
        }

        assert_eq!(launched, 1);
        assert_eq!(f.runtime.launch_count(), 1);
        assert_eq!(f.runtime.launched_specs().len(), 1);
        assert_eq!(f.runtime.containers_created(), 1);
        assert!(assert_consistent(&f.store, "S1").await.is_running());
    }

    #[tokio::test]
    async fn test_status_changed_between_read_and_lock() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        // Another request launched after our fast-path read
        f.store.record_running("S1", "other-container").await.unwrap();

        let outcome = f.coordinator.launch_locked("S1").await.unwrap();
        assert_eq!(
            outcome,
            LaunchOutcome::AlreadyRunning {
                container_id: "other-container".to_string()
            }
        );
        assert_eq!(f.runtime.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_lock_released_after_panic() {
        let f = fixture();
        let store: Arc<dyn SessionStore> = f.store.clone();

        let task = tokio::spawn(async move {
            let _guard = LockGuard::try_acquire(store, "S1", Duration::from_secs(10))
                .await
                .unwrap()
                .unwrap();
            panic!("launch path panicked");
        });
        assert!(task.await.is_err());

        for _ in 0..50 {
            if !f.store.is_locked("S1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!f.store.is_locked("S1"));
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        let _stale = f
            .store
            .try_lock("S1", Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(f.coordinator.ensure_container("S1").await.unwrap().launched());
    }

    #[tokio::test]
    async fn test_session_status() {
        let f = fixture();

        let status = f.coordinator.session_status("S1").await.unwrap();
        assert_eq!(status.party_ids, None);
        assert_eq!(status.container, ContainerStatus::Absent);

        f.coordinator.initiate_session("S1", &parties(&["A", "B"])).await.unwrap();
        f.coordinator.ensure_container("S1").await.unwrap();

        let status = f.coordinator.session_status("S1").await.unwrap();
        assert_eq!(status.party_ids, Some(parties(&["A", "B"])));
        assert!(status.container.is_running());
        assert_eq!(f.store.lock_acquisitions(), 1);
    }

    #[tokio::test]
    async fn test_start_container() {
        let f = fixture();

        let err = f.coordinator.start_container("").await.unwrap_err();
        assert_eq!(err.kind(), "invalid_argument");

        let id = f.coordinator.start_container("busybox").await.unwrap();
        assert!(!id.is_empty());

        let spec = &f.runtime.launched_specs()[0];
        assert_eq!(spec.image, "busybox");
        assert_eq!(spec.env_var("TZ"), Some("Asia/Singapore"));
        assert_eq!(spec.volumes.len(), 1);
        assert_eq!(f.store.lock_acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_get_result() {
        let f = fixture();

        let err = f.coordinator.get_result("unknown-session").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");

        f.store.put_result_document("S1", r#"{"A": 0.4}"#).unwrap();
        assert_eq!(f.coordinator.get_result("S1").await.unwrap(), json!({"A": 0.4}));
    }

    #[tokio::test]
    async fn test_response_json_shape() {
        let f = fixture();
        f.coordinator.initiate_session("S1", &parties(&["A"])).await.unwrap();

        let body = f.coordinator.upload(&local_upload("S1", "A"), b"x").await.to_json();
        assert_eq!(body["message"], "File uploaded successfully");
        assert_eq!(body["container"]["status"], "running");
        assert_eq!(body["container"]["id"], "mock-0001");
        assert_eq!(body["container"]["launched"], true);
    }

    #[test]
    fn test_launch_outcome_serialization() {
        let value = serde_json::to_value(LaunchOutcome::Launched {
            container_id: "c1".to_string(),
        })
        .unwrap();
        assert_eq!(value, json!({"outcome": "launched", "container_id": "c1"}));
    }
}
