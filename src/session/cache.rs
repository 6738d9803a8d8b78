use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::ArgValue;

/// One memoized outcome, keyed by the payload content hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub value: ArgValue,
    pub worker_id: String,
    pub elapsed: Duration,
}

/// Submitter-local memo of completed jobs.
///
/// Identical payloads hash identically, so resubmitting an
/// already-completed job resolves here without touching the backend. The
/// cache is a JSON file under the state directory; a corrupt file is
/// discarded and rebuilt, never fatal.
#[derive(Debug)]
pub struct LocalResultCache {
    path: PathBuf,
    entries: HashMap<String, CachedResult>,
}

impl LocalResultCache {
    pub fn open(state_dir: &Path) -> Self {
        let path = state_dir.join("results.json");
        let entries = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Result cache corrupt, reinitializing");
                    let _ = std::fs::remove_file(&path);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };
        Self { path, entries }
    }

    pub fn get(&self, payload_hash: &str) -> Option<&CachedResult> {
        self.entries.get(payload_hash)
    }

    /// Insert and persist. Persistence is best-effort — losing the file
    /// only costs a recomputation.
    pub fn insert(&mut self, payload_hash: String, result: CachedResult) {
        self.entries.insert(payload_hash, result);
        self.save();
    }

    fn save(&self) {
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec(&self.entries) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&self.path, bytes) {
                    tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist result cache");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize result cache"),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
