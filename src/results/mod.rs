//! Result retrieval
//!
//! The aggregation workload publishes its per-party scores either as a JSON
//! document in the session store (keyed by the session id) or as a file in a
//! results directory whose name starts with the session id. A deployment
//! picks one source; lookups take no lock.

use crate::error::{CoordResult, CoordinatorError};
use crate::store::{validate_identifier, SessionStore};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;

/// Source of published results
#[derive(Clone)]
pub enum ResultReader {
    /// JSON document under the session id in the store
    Store(Arc<dyn SessionStore>),
    /// First file (lexicographic) in the directory prefixed by the session id
    Directory(PathBuf),
}

impl ResultReader {
    /// Fetch the published result of a session
    pub async fn get_result(&self, session_id: &str) -> CoordResult<Value> {
        validate_identifier("session_id", session_id)?;

        match self {
            Self::Store(store) => {
                let raw = store.get_result_document(session_id).await?.ok_or_else(|| {
                    CoordinatorError::NotFound(format!("result for session '{}'", session_id))
                })?;

                serde_json::from_str(&raw).map_err(|e| {
                    CoordinatorError::IoFailure(format!(
                        "result document for session '{}' is not valid JSON: {}",
                        session_id, e
                    ))
                })
            }
            Self::Directory(dir) => read_from_directory(dir.clone(), session_id.to_string()).await,
        }
    }
}

async fn read_from_directory(dir: PathBuf, session_id: String) -> CoordResult<Value> {
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CoordinatorError::NotFound(format!(
                "results directory {}",
                dir.display()
            )))
        }
        Err(e) => return Err(CoordinatorError::io(format!("read {}", dir.display()), e)),
    };

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| CoordinatorError::io(format!("read {}", dir.display()), e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&session_id) {
            candidates.push(name);
        }
    }
    candidates.sort();

    let Some(first) = candidates.into_iter().next() else {
        return Err(CoordinatorError::NotFound(format!(
            "result for session '{}'",
            session_id
        )));
    };

    let path = dir.join(&first);
    tracing::debug!(path = %path.display(), "Reading result file");

    let contents = tokio::fs::read_to_string(&path)
        .await
        .map_err(|e| CoordinatorError::io(format!("read {}", path.display()), e))?;

    serde_json::from_str(&contents).map_err(|e| {
        CoordinatorError::IoFailure(format!("{} is not valid JSON: {}", path.display(), e))
    })
}
