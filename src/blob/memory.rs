//! In-memory blob store.

use super::{BlobLocation, BlobResult, BlobStore, digest, validate_key};
use crate::error::BlobError;

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keys currently stored under `prefix`, in order.
    pub fn keys(&self, prefix: &str) -> Vec<String> {
        self.blobs
            .read()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> BlobResult<BlobLocation> {
        validate_key(key)?;
        let location = BlobLocation {
            key: key.to_string(),
            digest: digest(&bytes),
            size: bytes.len() as u64,
        };
        self.blobs.write().insert(key.to_string(), bytes);
        Ok(location)
    }

    async fn get(&self, key: &str) -> BlobResult<Vec<u8>> {
        self.blobs
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn delete(&self, prefix: &str) -> BlobResult<usize> {
        let keys = self.keys(prefix);
        let mut blobs = self.blobs.write();
        for key in &keys {
            blobs.remove(key);
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delete_removes_only_the_prefix() {
        let store = MemoryBlobStore::new();
        store.put("p1/1/a", b"one".to_vec()).await.unwrap();
        store.put("p1/2/a", b"two".to_vec()).await.unwrap();
        store.put("p10/1/a", b"other".to_vec()).await.unwrap();

        assert_eq!(store.delete("p1/").await.unwrap(), 2);
        assert_eq!(store.keys(""), vec!["p10/1/a".to_string()]);
        assert_eq!(store.delete("p1/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn get_missing_blob_is_not_found() {
        let store = MemoryBlobStore::new();
        let error = store.get("p1/1/a").await.unwrap_err();
        assert!(matches!(error, BlobError::NotFound(_)));
    }
}
