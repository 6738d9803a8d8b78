use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::StoreError;
use crate::store::BlobStore;

/// Blob store backed by a directory every participant can reach — a
/// network mount or a synced folder. One object per file, named by key.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

#[async_trait]
impl BlobStore for DirStore {
    async fn connect(&self) -> Result<(), StoreError> {
        let meta = fs::metadata(&self.root).await.map_err(|_| {
            StoreError::NotConnected(format!("{} is not reachable", self.root.display()))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::NotConnected(format!(
                "{} is not a directory",
                self.root.display()
            )));
        }
        // Probe for write access; a read-only mount is useless as a
        // coordination medium.
        let probe = self.root.join(".raisin-probe");
        fs::write(&probe, b"probe").await?;
        fs::remove_file(&probe).await?;
        Ok(())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        // Write to a temp name then rename so readers never observe a
        // partially written object.
        let tmp = self.object_path(&format!(".{key}.tmp"));
        fs::write(&tmp, bytes).await?;
        fs::rename(&tmp, self.object_path(key)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.object_path(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            // Already gone is as deleted as it gets.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(name) = entry.file_name().into_string() {
                if !name.starts_with('.') {
                    keys.push(name);
                }
            }
        }
        Ok(keys)
    }
}
