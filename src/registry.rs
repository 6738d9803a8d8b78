//! Backend discovery, ranking, and connection.
//!
//! The registry keeps a local file of every backend that ever worked —
//! `(last_used, kind, credential)` — and walks it most-recently-useful
//! first when asked for a connection. Peers advertise their own lists
//! through the store under a well-known key, and the merged view flows
//! back to both the file and the store.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RegistryConfig;
use crate::error::Result;
use crate::store::{BackendKind, BlobStore, StoreFactory};

/// Store key under which the merged candidate list is advertised to peers.
pub const INFO_KEY: &str = "info";

/// One known backend: where it is, how to get in, and when it last proved
/// useful.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendCandidate {
    pub last_used: DateTime<Utc>,
    pub kind: BackendKind,
    pub credential: String,
}

/// Options for a connection attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Candidates of this kind sort ahead of the rest.
    pub preferred_kind: Option<BackendKind>,
    /// Explicit credential to try ahead of every discovered candidate.
    pub credential: Option<String>,
    /// Only attempt the head of the list.
    pub try_first_only: bool,
    /// Skip candidates whose kind differs from `preferred_kind`.
    pub restrict_to_kind: bool,
}

/// Produces connected [`BlobStore`] handles, preferring previously
/// successful, recently used backends.
pub struct BackendRegistry {
    config: RegistryConfig,
    factory: Arc<dyn StoreFactory>,
    candidates: Vec<BackendCandidate>,
    loaded: bool,
    /// Cursor into `candidates`; connection attempts resume after the last
    /// connected entry so "no work here" rotates through peers instead of
    /// hammering the head of the list.
    cursor: usize,
    /// Identity of the connected candidate. Kept as `(kind, credential)`
    /// rather than an index because ranking reorders the list.
    current: Option<(BackendKind, String)>,
}

impl BackendRegistry {
    pub fn new(config: RegistryConfig, factory: Arc<dyn StoreFactory>) -> Self {
        Self {
            config,
            factory,
            candidates: Vec::new(),
            loaded: false,
            cursor: 0,
            current: None,
        }
    }

    fn candidate_file(&self) -> PathBuf {
        self.config.state_dir.join("backends.json")
    }

    /// Load (once) and rank the candidate list: most recently used first,
    /// preferred kind ahead of everything else. A missing or corrupt file
    /// is treated as empty, never as an error.
    pub fn discover(&mut self, preferred_kind: Option<BackendKind>) -> &[BackendCandidate] {
        if !self.loaded {
            self.candidates = self.load_file();
            self.loaded = true;
        }
        self.rank(preferred_kind);
        &self.candidates
    }

    fn load_file(&self) -> Vec<BackendCandidate> {
        let path = self.candidate_file();
        match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(list) => list,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Candidate file corrupt, starting empty");
                    let _ = std::fs::remove_file(&path);
                    Vec::new()
                }
            },
            Err(_) => {
                // First run: leave an empty file behind so the path is
                // known-writable before anything depends on it.
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let _ = std::fs::write(&path, b"[]");
                Vec::new()
            }
        }
    }

    fn rank(&mut self, preferred_kind: Option<BackendKind>) {
        self.candidates.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        if let Some(kind) = preferred_kind {
            // Stable partition: preferred kind first, recency preserved
            // within each group.
            let (mut preferred, rest): (Vec<_>, Vec<_>) = self
                .candidates
                .drain(..)
                .partition(|c| c.kind == kind);
            preferred.extend(rest);
            self.candidates = preferred;
        }
    }

    fn save_file(&self) {
        let path = self.candidate_file();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_vec_pretty(&self.candidates) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(&path, bytes) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to persist candidate file");
                }
            }
            Err(e) => tracing::warn!(error = %e, "Failed to serialize candidate list"),
        }
    }

    /// Iterate the discovered candidates and return the first store that
    /// connects. `None` means no backend is reachable — callers treat this
    /// as "stay local", not as a fatal condition.
    pub async fn connect(&mut self, opts: &ConnectOptions) -> Option<Box<dyn BlobStore>> {
        self.discover(opts.preferred_kind);

        // An explicit credential is an unranked candidate tried before
        // everything from the file.
        if let (Some(kind), Some(credential)) = (opts.preferred_kind, opts.credential.as_deref()) {
            if let Some(store) = self.try_candidate(kind, credential).await {
                self.remember(kind, credential);
                self.current = Some((kind, credential.to_string()));
                return Some(store);
            }
            if opts.try_first_only {
                return None;
            }
        }

        if self.candidates.is_empty() {
            return None;
        }

        let attempts = if opts.try_first_only {
            self.cursor = 0;
            1
        } else {
            self.candidates.len()
        };

        for step in 0..attempts {
            let idx = (self.cursor + step) % self.candidates.len();
            let candidate = self.candidates[idx].clone();
            if opts.restrict_to_kind {
                if let Some(kind) = opts.preferred_kind {
                    if candidate.kind != kind {
                        continue;
                    }
                }
            }
            if let Some(store) = self.try_candidate(candidate.kind, &candidate.credential).await {
                tracing::info!(kind = %candidate.kind, "Connected to backend");
                self.current = Some((candidate.kind, candidate.credential.clone()));
                self.cursor = (idx + 1) % self.candidates.len();
                return Some(store);
            }
        }
        self.current = None;
        None
    }

    async fn try_candidate(&self, kind: BackendKind, credential: &str) -> Option<Box<dyn BlobStore>> {
        let store = self.factory.open(kind, credential)?;
        match store.connect().await {
            Ok(()) => Some(store),
            Err(e) => {
                tracing::debug!(kind = %kind, error = %e, "Candidate unusable");
                None
            }
        }
    }

    /// Record a working backend in the local list (deduplicated, freshest
    /// timestamp wins) and persist.
    pub fn remember(&mut self, kind: BackendKind, credential: &str) {
        let now = Utc::now();
        if let Some(existing) = self
            .candidates
            .iter_mut()
            .find(|c| c.kind == kind && c.credential == credential)
        {
            existing.last_used = now;
        } else {
            self.candidates.push(BackendCandidate {
                last_used: now,
                kind,
                credential: credential.to_string(),
            });
        }
        self.save_file();
    }

    /// Merge a peer-advertised candidate list into ours, write the merged
    /// view back to the local file and to the store's `"info"` key, and
    /// re-rank.
    pub async fn refresh_candidates(
        &mut self,
        remote: Vec<BackendCandidate>,
        store: &dyn BlobStore,
    ) -> Result<()> {
        let mut merged: Vec<BackendCandidate> = Vec::new();
        for candidate in remote.into_iter().chain(self.candidates.drain(..)) {
            match merged
                .iter_mut()
                .find(|c| c.kind == candidate.kind && c.credential == candidate.credential)
            {
                Some(existing) => {
                    existing.last_used = existing.last_used.max(candidate.last_used);
                }
                None => merged.push(candidate),
            }
        }
        self.candidates = merged;
        self.save_file();

        let bytes = serde_json::to_vec(&self.candidates)?;
        if let Err(e) = store.put(INFO_KEY, &bytes).await {
            // Advertising is best-effort; the local merge already stuck.
            tracing::debug!(error = %e, "Failed to advertise candidate list");
        }
        self.rank(None);
        Ok(())
    }

    /// Bump `last_used` for the currently connected candidate after a
    /// successful round of work, keeping good backends near the front of
    /// future searches.
    pub fn touch_current(&mut self) {
        if let Some((kind, credential)) = &self.current {
            if let Some(candidate) = self
                .candidates
                .iter_mut()
                .find(|c| c.kind == *kind && c.credential == *credential)
            {
                candidate.last_used = Utc::now();
                self.save_file();
            }
        }
    }

    /// The candidate list as currently held (for advertising to peers).
    pub fn candidates(&self) -> &[BackendCandidate] {
        &self.candidates
    }
}
