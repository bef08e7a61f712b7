//! Blob store for index artifacts.
//!
//! Artifacts are addressed by `project_id/version/...` keys, so deleting a
//! project is a prefix delete of `project_id/`.

pub mod fs;
pub mod memory;

use crate::Version;
use crate::error::BlobError;

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};

pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;

pub type BlobResult<T> = std::result::Result<T, BlobError>;

/// Where a blob was written and what it contained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlobLocation {
    pub key: String,
    /// Hex-encoded SHA-256 of the stored bytes.
    pub digest: String,
    pub size: u64,
}

#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    async fn put(&self, key: &str, bytes: Vec<u8>) -> BlobResult<BlobLocation>;

    async fn get(&self, key: &str) -> BlobResult<Vec<u8>>;

    /// Remove every blob under `prefix`. Returns the number of blobs removed.
    /// Deleting an empty prefix is not an error.
    async fn delete(&self, prefix: &str) -> BlobResult<usize>;
}

/// Key prefix holding the artifacts of one index version.
pub fn artifact_prefix(project_id: &str, version: Version) -> String {
    format!("{project_id}/{version}")
}

/// Key prefix holding every artifact of a project.
pub fn project_prefix(project_id: &str) -> String {
    format!("{project_id}/")
}

pub(crate) fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Reject keys that are empty, absolute, or that escape the store root.
pub(crate) fn validate_key(key: &str) -> BlobResult<()> {
    let invalid = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment == ".." || segment == ".");
    if invalid {
        return Err(BlobError::InvalidKey(key.to_string()));
    }
    Ok(())
}
