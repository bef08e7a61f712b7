//! Filesystem blob store rooted at a directory.
//!
//! Writes go to a temporary sibling and are renamed into place, so readers
//! never observe a partially written artifact.

use super::{BlobLocation, BlobResult, BlobStore, digest, validate_key};
use crate::error::BlobError;

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> BlobResult<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> BlobResult<PathBuf> {
        validate_key(key.trim_end_matches('/'))?;
        Ok(self.root.join(key.trim_end_matches('/')))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> BlobResult<BlobLocation> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let temp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp, &bytes).await?;
        if let Err(error) = tokio::fs::rename(&temp, &path).await {
            tokio::fs::remove_file(&temp).await.ok();
            return Err(error.into());
        }

        tracing::debug!(key, size = bytes.len(), "blob written");
        Ok(BlobLocation {
            key: key.to_string(),
            digest: digest(&bytes),
            size: bytes.len() as u64,
        })
    }

    async fn get(&self, key: &str) -> BlobResult<Vec<u8>> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(error) if error.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(key.to_string()))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, prefix: &str) -> BlobResult<usize> {
        let path = self.path_for(prefix)?;
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(0),
            Err(error) => return Err(error.into()),
        };

        if metadata.is_file() {
            tokio::fs::remove_file(&path).await?;
            return Ok(1);
        }

        let removed = count_files(&path).await?;
        tokio::fs::remove_dir_all(&path).await?;
        tracing::debug!(prefix, removed, "blob prefix deleted");
        Ok(removed)
    }
}

async fn count_files(dir: &Path) -> BlobResult<usize> {
    let mut pending = vec![dir.to_path_buf()];
    let mut count = 0;
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                pending.push(entry.path());
            } else {
                count += 1;
            }
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_and_prefix_delete() {
        let temp = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp.path().join("blobs")).await.unwrap();

        let location = store.put("p1/1/index.bin", b"abc".to_vec()).await.unwrap();
        assert_eq!(location.size, 3);
        assert_eq!(location.digest, crate::blob::digest(b"abc"));
        store.put("p1/2/index.bin", b"def".to_vec()).await.unwrap();
        store.put("p2/1/index.bin", b"ghi".to_vec()).await.unwrap();

        assert_eq!(store.get("p1/1/index.bin").await.unwrap(), b"abc");
        assert_eq!(store.delete("p1/").await.unwrap(), 2);
        assert!(matches!(
            store.get("p1/2/index.bin").await,
            Err(BlobError::NotFound(_))
        ));
        assert_eq!(store.get("p2/1/index.bin").await.unwrap(), b"ghi");
        assert_eq!(store.delete("p1/").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn refuses_keys_outside_the_root() {
        let temp = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(temp.path()).await.unwrap();
        let error = store.put("../escape", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(error, BlobError::InvalidKey(_)));
    }
}
