//! Metadata store: typed access to Project, Index and DeletedIndex records.
//!
//! All writes are atomic per row. Version creation, status transitions and
//! promotion are conditional, so two dispatcher workers handling duplicate
//! messages cannot both create the same version or leave two READY rows.

pub mod memory;
pub mod sqlite;

use crate::error::StoreError;
use crate::model::{BuildStatus, DeletedIndex, Index, IndexStatus, Project, Promotion};
use crate::{JobId, Version};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    /// Register a project. Returns `false` if it already exists.
    async fn create_project(&self, project: &Project) -> StoreResult<bool>;

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>>;

    /// Record the outcome of a build attempt. `at` is only written when set.
    async fn record_build(
        &self,
        project_id: &str,
        at: Option<DateTime<Utc>>,
        status: BuildStatus,
    ) -> StoreResult<()>;

    /// All index rows of a project, ascending by version.
    async fn list_indexes(&self, project_id: &str) -> StoreResult<Vec<Index>>;

    async fn get_index(&self, project_id: &str, version: Version) -> StoreResult<Option<Index>>;

    /// Insert a new index row.
    ///
    /// Fails with `Conflict` if the version already exists and with
    /// `Tombstoned` if the project has been deleted.
    async fn put_index(&self, index: &Index) -> StoreResult<()>;

    /// Attach a build job to a BUILDING row. Re-attaching the same job is a no-op.
    async fn set_index_job(&self, project_id: &str, version: Version, job_id: JobId) -> StoreResult<()>;

    /// Compare-and-set the status of an index row.
    async fn transition_index(
        &self,
        project_id: &str,
        version: Version,
        from: IndexStatus,
        to: IndexStatus,
    ) -> StoreResult<Index>;

    /// Make `version` the active READY version, superseding the previous one
    /// in the same atomic write.
    async fn promote(&self, project_id: &str, version: Version) -> StoreResult<Promotion>;

    /// Projects whose rebuild interval has elapsed at `now`, excluding
    /// tombstoned projects and projects with a BUILDING index.
    async fn list_buildable(&self, now: DateTime<Utc>) -> StoreResult<Vec<Project>>;

    /// Write the tombstone for a project. Idempotent: an existing tombstone
    /// is returned unchanged.
    async fn tombstone(
        &self,
        project_id: &str,
        last_active_version: Option<Version>,
    ) -> StoreResult<DeletedIndex>;

    async fn get_tombstone(&self, project_id: &str) -> StoreResult<Option<DeletedIndex>>;

    /// Remove every index row of a project. Returns the number removed.
    async fn delete_indexes(&self, project_id: &str) -> StoreResult<usize>;
}

/// Checks the transition against the lifecycle rules and the expected current status.
pub(crate) fn check_transition(
    index: &Index,
    from: IndexStatus,
    to: IndexStatus,
) -> StoreResult<()> {
    if !from.can_transition_to(to) {
        return Err(StoreError::Integrity(format!(
            "illegal transition {from} -> {to} for {}/{}",
            index.project_id, index.version
        )));
    }
    if index.status != from {
        return Err(StoreError::Conflict(format!(
            "{}/{} is {}, expected {from}",
            index.project_id, index.version, index.status
        )));
    }
    Ok(())
}
