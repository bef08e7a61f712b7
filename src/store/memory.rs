//! In-memory metadata store.
//!
//! One `RwLock` guards every table, so each conditional write is atomic with
//! respect to the reads it depends on. Used by tests and single-process runs.

use super::{MetadataStore, StoreResult, check_transition};
use crate::error::StoreError;
use crate::model::{BuildStatus, DeletedIndex, Index, IndexStatus, Project, Promotion};
use crate::{JobId, ProjectId, Version};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

#[derive(Default)]
struct Tables {
    projects: HashMap<ProjectId, Project>,
    indexes: HashMap<ProjectId, BTreeMap<Version, Index>>,
    tombstones: HashMap<ProjectId, DeletedIndex>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tables = self.tables.read();
        f.debug_struct("MemoryStore")
            .field("project_count", &tables.projects.len())
            .field("tombstone_count", &tables.tombstones.len())
            .finish()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryStore {
    async fn create_project(&self, project: &Project) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        if tables.projects.contains_key(&project.project_id) {
            return Ok(false);
        }
        tables
            .projects
            .insert(project.project_id.clone(), project.clone());
        Ok(true)
    }

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        Ok(self.tables.read().projects.get(project_id).cloned())
    }

    async fn record_build(
        &self,
        project_id: &str,
        at: Option<DateTime<Utc>>,
        status: BuildStatus,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let project = tables
            .projects
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("project {project_id}")))?;
        if let Some(at) = at {
            project.last_build_at = Some(at);
        }
        project.last_build_status = status;
        Ok(())
    }

    async fn list_indexes(&self, project_id: &str) -> StoreResult<Vec<Index>> {
        Ok(self
            .tables
            .read()
            .indexes
            .get(project_id)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_index(&self, project_id: &str, version: Version) -> StoreResult<Option<Index>> {
        Ok(self
            .tables
            .read()
            .indexes
            .get(project_id)
            .and_then(|versions| versions.get(&version))
            .cloned())
    }

    async fn put_index(&self, index: &Index) -> StoreResult<()> {
        let mut tables = self.tables.write();
        if tables.tombstones.contains_key(&index.project_id) {
            return Err(StoreError::Tombstoned(index.project_id.clone()));
        }
        let versions = tables.indexes.entry(index.project_id.clone()).or_default();
        if versions.contains_key(&index.version) {
            return Err(StoreError::Conflict(format!(
                "{}/{} already exists",
                index.project_id, index.version
            )));
        }
        versions.insert(index.version, index.clone());
        Ok(())
    }

    async fn set_index_job(&self, project_id: &str, version: Version, job_id: JobId) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let index = tables
            .indexes
            .get_mut(project_id)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;

        match index.job_id {
            Some(existing) if existing == job_id => Ok(()),
            Some(existing) => Err(StoreError::Integrity(format!(
                "{project_id}/{version} already attached to job {existing}"
            ))),
            None if index.status != IndexStatus::Building => Err(StoreError::Conflict(format!(
                "{project_id}/{version} is {}",
                index.status
            ))),
            None => {
                index.job_id = Some(job_id);
                index.updated_at = Utc::now();
                Ok(())
            }
        }
    }

    async fn transition_index(
        &self,
        project_id: &str,
        version: Version,
        from: IndexStatus,
        to: IndexStatus,
    ) -> StoreResult<Index> {
        let mut tables = self.tables.write();
        let index = tables
            .indexes
            .get_mut(project_id)
            .and_then(|versions| versions.get_mut(&version))
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;

        check_transition(index, from, to)?;
        index.status = to;
        index.updated_at = Utc::now();
        Ok(index.clone())
    }

    async fn promote(&self, project_id: &str, version: Version) -> StoreResult<Promotion> {
        let mut tables = self.tables.write();
        if tables.tombstones.contains_key(project_id) {
            return Err(StoreError::Tombstoned(project_id.to_string()));
        }
        let versions = tables
            .indexes
            .get_mut(project_id)
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;

        let ready: Vec<Version> = versions
            .values()
            .filter(|index| index.status == IndexStatus::Ready)
            .map(|index| index.version)
            .collect();
        if ready.len() > 1 {
            return Err(StoreError::Integrity(format!(
                "{project_id} has {} READY versions",
                ready.len()
            )));
        }
        let active = ready.first().copied();

        let now = Utc::now();
        let target = versions
            .get_mut(&version)
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;
        match target.status {
            IndexStatus::Ready => return Ok(Promotion::AlreadyReady),
            IndexStatus::Failed | IndexStatus::Superseded => {
                return Ok(Promotion::Rejected(target.status));
            }
            IndexStatus::Building => {}
        }

        if let Some(active) = active.filter(|active| *active > version) {
            target.status = IndexStatus::Superseded;
            target.updated_at = now;
            return Ok(Promotion::Stale { active });
        }

        target.status = IndexStatus::Ready;
        target.updated_at = now;
        if let Some(previous) = active.and_then(|active| versions.get_mut(&active)) {
            previous.status = IndexStatus::Superseded;
            previous.updated_at = now;
        }
        Ok(Promotion::Promoted { superseded: active })
    }

    async fn list_buildable(&self, now: DateTime<Utc>) -> StoreResult<Vec<Project>> {
        let tables = self.tables.read();
        let mut buildable: Vec<Project> = tables
            .projects
            .values()
            .filter(|project| project.is_due(now))
            .filter(|project| !tables.tombstones.contains_key(&project.project_id))
            .filter(|project| {
                !tables
                    .indexes
                    .get(&project.project_id)
                    .is_some_and(|versions| {
                        versions
                            .values()
                            .any(|index| index.status == IndexStatus::Building)
                    })
            })
            .cloned()
            .collect();
        buildable.sort_by(|a, b| a.project_id.cmp(&b.project_id));
        Ok(buildable)
    }

    async fn tombstone(
        &self,
        project_id: &str,
        last_active_version: Option<Version>,
    ) -> StoreResult<DeletedIndex> {
        let mut tables = self.tables.write();
        let tombstone = tables
            .tombstones
            .entry(project_id.to_string())
            .or_insert_with(|| DeletedIndex {
                project_id: project_id.to_string(),
                deleted_at: Utc::now(),
                last_active_version,
            });
        Ok(tombstone.clone())
    }

    async fn get_tombstone(&self, project_id: &str) -> StoreResult<Option<DeletedIndex>> {
        Ok(self.tables.read().tombstones.get(project_id).cloned())
    }

    async fn delete_indexes(&self, project_id: &str) -> StoreResult<usize> {
        Ok(self
            .tables
            .write()
            .indexes
            .remove(project_id)
            .map(|versions| versions.len())
            .unwrap_or(0))
    }
}
