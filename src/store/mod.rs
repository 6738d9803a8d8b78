//! The shared, passive coordination medium.
//!
//! A [`BlobStore`] is the only thing participants have in common: a
//! key/value object store with list/get/put/delete. Everything above it —
//! locks, job claims, result collection — is built from those four calls
//! plus patience.
//!
//! New backend types plug in through [`StoreFactory`], which turns a
//! `(kind, credential)` candidate into an unconnected store instance.

pub mod dir;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use dir::DirStore;
pub use memory::MemoryStore;

/// Which backend implementation a candidate refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process store, shared by handle. Used by tests and single-machine
    /// setups.
    Memory,
    /// A directory reachable by all participants (network mount, synced
    /// folder). The credential is the directory path.
    Dir,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Dir => write!(f, "dir"),
        }
    }
}

impl std::str::FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "memory" => Ok(BackendKind::Memory),
            "dir" => Ok(BackendKind::Dir),
            other => Err(format!("unknown backend kind: {other}")),
        }
    }
}

/// A connected (or connectable) key/value object store.
///
/// Every operation may fail at any time — the medium is assumed
/// unreliable. Callers treat failures as "this backend is unusable right
/// now", never as fatal.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Validate the credential bound at construction. Must succeed before
    /// any other call is meaningful.
    async fn connect(&self) -> Result<(), StoreError>;

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// `Ok(None)` means the key does not exist; errors mean the store
    /// itself misbehaved.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    async fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

/// Extension seam mapping a backend candidate to a store instance.
///
/// The default factory knows the built-in kinds; tests inject a factory
/// that hands out shared [`MemoryStore`] handles so several simulated
/// machines observe the same medium.
pub trait StoreFactory: Send + Sync {
    /// Build an unconnected store for the candidate, or `None` if the kind
    /// is not constructible here.
    fn open(&self, kind: BackendKind, credential: &str) -> Option<Box<dyn BlobStore>>;
}

/// Builds the built-in store kinds. `Memory` candidates are not
/// constructible from a credential string (handles must be shared
/// in-process), so only `Dir` resolves here.
#[derive(Debug, Default, Clone)]
pub struct DefaultStoreFactory;

impl StoreFactory for DefaultStoreFactory {
    fn open(&self, kind: BackendKind, credential: &str) -> Option<Box<dyn BlobStore>> {
        match kind {
            BackendKind::Dir => Some(Box::new(DirStore::new(credential))),
            BackendKind::Memory => None,
        }
    }
}
