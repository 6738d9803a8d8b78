use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::store::BlobStore;

/// In-process blob store. Cloning shares the underlying map, so every
/// participant holding a clone observes the same medium — exactly what the
/// simulated-cluster tests need.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects. Test helper.
    pub fn len(&self) -> usize {
        self.objects.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn connect(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.objects
            .lock()
            .expect("store mutex poisoned")
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("store mutex poisoned")
            .get(key)
            .cloned())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.objects
            .lock()
            .expect("store mutex poisoned")
            .remove(key);
        Ok(())
    }

    async fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self
            .objects
            .lock()
            .expect("store mutex poisoned")
            .keys()
            .cloned()
            .collect())
    }
}
