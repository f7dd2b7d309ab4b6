//! Upload tracking
//!
//! Maps an incoming artifact to its deterministic location in the upload tree
//! and commits it so that a reader never observes a partially written file
//! under its final name.
//!
//! # Layout
//!
//! ```text
//! <root>/<session_id>/<party_id>/<stem><epoch>.<ext>[.done]   local models
//! <root>/<session_id>/global/<stem><epoch>.<ext>[.done]       global models
//! ```
//!
//! Every commit writes to its own hidden staging file in the target
//! directory, syncs it, and renames it onto the final name: `<name>.done`
//! when the completion marker is enabled (the launched container polls for
//! it), the plain name otherwise. Concurrent commits of the same file never
//! share a staging file; the last rename wins.

use crate::error::{CoordResult, CoordinatorError};
use crate::store::validate_identifier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Directory name shared by global model uploads
pub const GLOBAL_DIR: &str = "global";

/// Suffix marking a completely written artifact
pub const COMPLETION_SUFFIX: &str = ".done";

/// Kind of uploaded model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// Per-party artifact
    Local,
    /// Aggregated artifact shared by all parties
    Global,
}

impl ModelKind {
    /// Decode the upstream `local_model` form flag ("1" = local)
    pub fn from_local_flag(flag: &str) -> Self {
        if flag.trim() == "1" {
            Self::Local
        } else {
            Self::Global
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Global => write!(f, "global"),
        }
    }
}

/// One artifact upload
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub session_id: String,
    pub party_id: String,
    pub epoch: String,
    pub model_kind: ModelKind,
    /// Client-supplied filename, already allow-listed
    pub filename: String,
}

/// Outcome of a committed upload
#[derive(Debug, Clone, Serialize)]
pub struct UploadReceipt {
    /// Stored filename (`<stem><epoch>.<ext>`)
    pub filename: String,
    /// Final on-disk location, including the completion suffix if any
    pub path: PathBuf,
    pub bytes: u64,
    /// Whether the completion marker rename was performed
    pub completed: bool,
    /// RFC 3339 commit time
    pub committed_at: String,
}

/// Resolves and commits uploads under a root directory
#[derive(Debug, Clone)]
pub struct UploadTracker {
    root: PathBuf,
    completion_marker: bool,
}

impl UploadTracker {
    pub fn new(root: impl Into<PathBuf>, completion_marker: bool) -> Self {
        Self {
            root: root.into(),
            completion_marker,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the upload root if it does not exist
    pub fn ensure_root(&self) -> CoordResult<()> {
        std::fs::create_dir_all(&self.root)
            .map_err(|e| CoordinatorError::io(format!("create {}", self.root.display()), e))
    }

    /// Directory that receives a session's artifacts of the given kind
    pub fn upload_dir(&self, session_id: &str, party_id: &str, kind: ModelKind) -> PathBuf {
        match kind {
            ModelKind::Local => self.root.join(session_id).join(party_id),
            ModelKind::Global => self.root.join(session_id).join(GLOBAL_DIR),
        }
    }

    /// Resolve the target path of an upload, creating its directory
    ///
    /// Calling this twice with the same arguments returns the same path; an
    /// existing directory is not an error.
    pub fn resolve_upload_path(
        &self,
        session_id: &str,
        party_id: &str,
        epoch: &str,
        kind: ModelKind,
        original_filename: &str,
    ) -> CoordResult<PathBuf> {
        validate_identifier("session_id", session_id)?;
        if kind == ModelKind::Local {
            validate_identifier("party_id", party_id)?;
        }
        if epoch.contains('/') || epoch.contains('\\') {
            return Err(CoordinatorError::InvalidArgument(format!(
                "epoch '{}' contains path separators",
                epoch
            )));
        }

        let filename = epoch_filename(original_filename, epoch)?;
        let dir = self.upload_dir(session_id, party_id, kind);

        std::fs::create_dir_all(&dir)
            .map_err(|e| CoordinatorError::io(format!("create {}", dir.display()), e))?;

        tracing::debug!(directory = %dir.display(), kind = %kind, "Resolved upload directory");
        Ok(dir.join(filename))
    }

    /// Write `payload` to `path` and mark it complete
    pub async fn commit_upload(&self, path: &Path, payload: &[u8]) -> CoordResult<UploadReceipt> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                CoordinatorError::InvalidArgument(format!("{} has no file name", path.display()))
            })?;

        let final_path = if self.completion_marker {
            with_suffix(path, COMPLETION_SUFFIX)
        } else {
            path.to_path_buf()
        };

        let staging = staging_path(path, &filename);
        if let Err(e) = write_and_sync(&staging, payload).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        if let Err(e) = tokio::fs::rename(&staging, &final_path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(CoordinatorError::io(
                format!("rename {} -> {}", staging.display(), final_path.display()),
                e,
            ));
        }

        tracing::info!(path = %final_path.display(), bytes = payload.len(), "File saved");

        Ok(UploadReceipt {
            filename,
            path: final_path,
            bytes: payload.len() as u64,
            completed: self.completion_marker,
            committed_at: chrono::Utc::now().to_rfc3339(),
        })
    }

    /// Resolve and commit in one step
    pub async fn store(&self, request: &UploadRequest, payload: &[u8]) -> CoordResult<UploadReceipt> {
        let path = self.resolve_upload_path(
            &request.session_id,
            &request.party_id,
            &request.epoch,
            request.model_kind,
            &request.filename,
        )?;

        self.commit_upload(&path, payload).await
    }
}

/// Embed the epoch into a filename: `model.tar.gz` + `3` -> `model3.tar.gz`
pub fn epoch_filename(original_filename: &str, epoch: &str) -> CoordResult<String> {
    let name = Path::new(original_filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    if name != original_filename {
        return Err(CoordinatorError::InvalidArgument(format!(
            "filename '{}' must not contain directories",
            original_filename
        )));
    }

    match name.split_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            Ok(format!("{}{}.{}", stem, epoch, ext))
        }
        _ => Err(CoordinatorError::InvalidArgument(format!(
            "filename '{}' must have a stem and an extension",
            original_filename
        ))),
    }
}

/// Hidden sibling unique to one commit
fn staging_path(path: &Path, filename: &str) -> PathBuf {
    path.with_file_name(format!(".{}.{:016x}.partial", filename, rand::random::<u64>()))
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

async fn write_and_sync(path: &Path, payload: &[u8]) -> CoordResult<()> {
    let context = || format!("write {}", path.display());

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
        .map_err(|e| CoordinatorError::io(context(), e))?;
    file.write_all(payload)
        .await
        .map_err(|e| CoordinatorError::io(context(), e))?;
    file.sync_all()
        .await
        .map_err(|e| CoordinatorError::io(context(), e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_epoch_filename() {
        assert_eq!(epoch_filename("model.tar", "1").unwrap(), "model1.tar");
        assert_eq!(epoch_filename("model.tar.gz", "3").unwrap(), "model3.tar.gz");
        assert_eq!(epoch_filename("weights.pt", "").unwrap(), "weights.pt");
    }

    #[test]
    fn test_epoch_filename_rejects_bad_names() {
        assert!(epoch_filename("noext", "1").is_err());
        assert!(epoch_filename(".hidden", "1").is_err());
        assert!(epoch_filename("trailing.", "1").is_err());
        assert!(epoch_filename("../model.tar", "1").is_err());
        assert!(epoch_filename("dir/model.tar", "1").is_err());
    }

    #[test]
    fn test_model_kind_flag() {
        assert_eq!(ModelKind::from_local_flag("1"), ModelKind::Local);
        assert_eq!(ModelKind::from_local_flag("0"), ModelKind::Global);
        assert_eq!(ModelKind::from_local_flag(""), ModelKind::Global);
    }

    #[test]
    fn test_resolve_local_path() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let path = tracker
            .resolve_upload_path("S1", "A", "1", ModelKind::Local, "model.tar")
            .unwrap();

        assert!(path.ends_with("S1/A/model1.tar"));
        assert!(path.parent().unwrap().is_dir());
    }

    #[test]
    fn test_resolve_global_path_ignores_party() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let path = tracker
            .resolve_upload_path("S1", "Unknown", "7", ModelKind::Global, "agg.tar")
            .unwrap();

        assert!(path.ends_with("S1/global/agg7.tar"));
    }

    #[test]
    fn test_resolve_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let first = tracker
            .resolve_upload_path("S1", "A", "1", ModelKind::Local, "model.tar")
            .unwrap();
        let second = tracker
            .resolve_upload_path("S1", "A", "1", ModelKind::Local, "model.tar")
            .unwrap();

        assert_eq!(first, second);
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        assert!(tracker
            .resolve_upload_path("..", "A", "1", ModelKind::Local, "model.tar")
            .is_err());
        assert!(tracker
            .resolve_upload_path("S1", "../B", "1", ModelKind::Local, "model.tar")
            .is_err());
        assert!(tracker
            .resolve_upload_path("S1", "A", "1/2", ModelKind::Local, "model.tar")
            .is_err());
        assert!(tracker
            .resolve_upload_path("", "A", "1", ModelKind::Local, "model.tar")
            .is_err());
    }

    #[tokio::test]
    async fn test_resolve_concurrently() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tracker = tracker.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                tracker.resolve_upload_path("S1", "A", "1", ModelKind::Local, "model.tar")
            }));
        }

        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }

    #[tokio::test]
    async fn test_commit_with_completion_marker() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let path = tracker
            .resolve_upload_path("S1", "A", "1", ModelKind::Local, "model.tar")
            .unwrap();
        let receipt = tracker.commit_upload(&path, b"weights").await.unwrap();

        assert!(receipt.completed);
        assert_eq!(receipt.filename, "model1.tar");
        assert_eq!(receipt.bytes, 7);
        assert!(receipt.path.ends_with("S1/A/model1.tar.done"));
        assert!(!path.exists());
        assert_eq!(std::fs::read(&receipt.path).unwrap(), b"weights");
    }

    #[tokio::test]
    async fn test_commit_without_marker_leaves_no_staging_file() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), false);

        let path = tracker
            .resolve_upload_path("S1", "B", "2", ModelKind::Local, "model.tar")
            .unwrap();
        let receipt = tracker.commit_upload(&path, b"abc").await.unwrap();

        assert!(!receipt.completed);
        assert_eq!(receipt.path, path);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");

        let entries: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn test_commit_last_write_wins() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let request = UploadRequest {
            session_id: "S1".to_string(),
            party_id: "A".to_string(),
            epoch: "1".to_string(),
            model_kind: ModelKind::Local,
            filename: "model.tar".to_string(),
        };

        tracker.store(&request, b"first").await.unwrap();
        let receipt = tracker.store(&request, b"second").await.unwrap();

        assert_eq!(std::fs::read(&receipt.path).unwrap(), b"second");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_commits_of_same_file() {
        let temp_dir = TempDir::new().unwrap();

        for completion_marker in [true, false] {
            let root = temp_dir.path().join(completion_marker.to_string());
            let tracker = UploadTracker::new(root, completion_marker);
            let request = UploadRequest {
                session_id: "S1".to_string(),
                party_id: "A".to_string(),
                epoch: "0".to_string(),
                model_kind: ModelKind::Local,
                filename: "model.tar".to_string(),
            };

            for _round in 0..5 {
                let mut handles = Vec::new();
                for writer in 0..8u8 {
                    let tracker = tracker.clone();
                    let request = request.clone();
                    handles.push(tokio::spawn(async move {
                        let payload = vec![writer; 1 << 20];
                        tracker.store(&request, &payload).await
                    }));
                }

                let mut final_path = None;
                for handle in handles {
                    let receipt = handle.await.unwrap().expect("every overlapping upload succeeds");
                    final_path = Some(receipt.path);
                }
                let final_path = final_path.unwrap();

                // Whole payload of exactly one writer
                let contents = std::fs::read(&final_path).unwrap();
                assert_eq!(contents.len(), 1 << 20);
                assert!(contents.iter().all(|b| *b == contents[0]));

                // No staging files or plain-name leftovers
                let entries: Vec<_> = std::fs::read_dir(final_path.parent().unwrap())
                    .unwrap()
                    .map(|e| e.unwrap().file_name())
                    .collect();
                assert_eq!(entries.len(), 1, "unexpected files: {:?}", entries);
            }
        }
    }

    #[tokio::test]
    async fn test_commit_into_missing_directory_fails() {
        let temp_dir = TempDir::new().unwrap();
        let tracker = UploadTracker::new(temp_dir.path(), true);

        let path = temp_dir.path().join("missing").join("model1.tar");
        let err = tracker.commit_upload(&path, b"x").await.unwrap_err();
        assert_eq!(err.kind(), "io_failure");
    }
}
