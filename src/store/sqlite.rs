//! SQLite-backed metadata store.
//!
//! Conditional writes are single guarded statements where possible; promotion
//! runs in a transaction. A partial unique index keeps at most one READY row
//! per project even if two promotions race.

use super::{MetadataStore, StoreResult, check_transition};
use crate::error::StoreError;
use crate::model::{BuildStatus, DeletedIndex, Index, IndexStatus, Project, Promotion};
use crate::{JobId, Version};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ProjectRow {
    project_id: String,
    index_class: String,
    build_interval_secs: i64,
    last_build_at: Option<i64>,
    last_build_status: String,
    created_at: i64,
}

impl ProjectRow {
    fn into_project(self) -> StoreResult<Project> {
        Ok(Project {
            index_class: parse_column(&self.index_class)?,
            build_interval_secs: self.build_interval_secs.max(0) as u64,
            last_build_at: self.last_build_at.map(from_millis).transpose()?,
            last_build_status: parse_column::<BuildStatus>(&self.last_build_status)?,
            created_at: from_millis(self.created_at)?,
            project_id: self.project_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct IndexRow {
    project_id: String,
    version: i64,
    artifact_location: String,
    status: String,
    index_class: String,
    job_id: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl IndexRow {
    fn into_index(self) -> StoreResult<Index> {
        let job_id = self
            .job_id
            .as_deref()
            .map(uuid::Uuid::parse_str)
            .transpose()
            .map_err(|error| StoreError::Integrity(format!("bad job id: {error}")))?;
        Ok(Index {
            version: self.version as Version,
            artifact_location: self.artifact_location,
            status: parse_column(&self.status)?,
            index_class: parse_column(&self.index_class)?,
            job_id,
            created_at: from_millis(self.created_at)?,
            updated_at: from_millis(self.updated_at)?,
            project_id: self.project_id,
        })
    }
}

#[derive(sqlx::FromRow)]
struct TombstoneRow {
    project_id: String,
    deleted_at: i64,
    last_active_version: Option<i64>,
}

impl TombstoneRow {
    fn into_tombstone(self) -> StoreResult<DeletedIndex> {
        Ok(DeletedIndex {
            project_id: self.project_id,
            deleted_at: from_millis(self.deleted_at)?,
            last_active_version: self.last_active_version.map(|v| v as Version),
        })
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(value: &str) -> StoreResult<T> {
    value.parse().map_err(StoreError::Integrity)
}

fn from_millis(millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| StoreError::Integrity(format!("timestamp out of range: {millis}")))
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.is_unique_violation())
}

const INDEX_COLUMNS: &str =
    "project_id, version, artifact_location, status, index_class, job_id, created_at, updated_at";

impl SqliteStore {
    /// Open (or create) the database at `path` and apply migrations.
    pub async fn connect(path: &Path, max_connections: u32) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(pool: SqlitePool) -> StoreResult<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        tracing::debug!("metadata store migrations applied");
        Ok(Self { pool })
    }

    async fn fetch_index<'e, E>(executor: E, project_id: &str, version: Version) -> StoreResult<Option<Index>>
    where
        E: sqlx::Executor<'e, Database = sqlx::Sqlite>,
    {
        let row: Option<IndexRow> = sqlx::query_as(&format!(
            "SELECT {INDEX_COLUMNS} FROM indexes WHERE project_id = ? AND version = ?"
        ))
        .bind(project_id)
        .bind(version as i64)
        .fetch_optional(executor)
        .await?;
        row.map(IndexRow::into_index).transpose()
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn create_project(&self, project: &Project) -> StoreResult<bool> {
        let result = sqlx::query(
            "INSERT INTO projects \
             (project_id, index_class, build_interval_secs, last_build_at, last_build_status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT(project_id) DO NOTHING",
        )
        .bind(&project.project_id)
        .bind(project.index_class.as_str())
        .bind(project.build_interval_secs as i64)
        .bind(project.last_build_at.map(|at| at.timestamp_millis()))
        .bind(project.last_build_status.as_str())
        .bind(project.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
        let row: Option<ProjectRow> = sqlx::query_as(
            "SELECT project_id, index_class, build_interval_secs, last_build_at, \
             last_build_status, created_at FROM projects WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(ProjectRow::into_project).transpose()
    }

    async fn record_build(
        &self,
        project_id: &str,
        at: Option<DateTime<Utc>>,
        status: BuildStatus,
    ) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE projects SET last_build_at = COALESCE(?, last_build_at), \
             last_build_status = ? WHERE project_id = ?",
        )
        .bind(at.map(|at| at.timestamp_millis()))
        .bind(status.as_str())
        .bind(project_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("project {project_id}")));
        }
        Ok(())
    }

    async fn list_indexes(&self, project_id: &str) -> StoreResult<Vec<Index>> {
        let rows: Vec<IndexRow> = sqlx::query_as(&format!(
            "SELECT {INDEX_COLUMNS} FROM indexes WHERE project_id = ? ORDER BY version ASC"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(IndexRow::into_index).collect()
    }

    async fn get_index(&self, project_id: &str, version: Version) -> StoreResult<Option<Index>> {
        Self::fetch_index(&self.pool, project_id, version).await
    }

    async fn put_index(&self, index: &Index) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            "INSERT INTO indexes ({INDEX_COLUMNS}) \
             SELECT ?, ?, ?, ?, ?, ?, ?, ? \
             WHERE NOT EXISTS (SELECT 1 FROM deleted_indexes WHERE project_id = ?)"
        ))
        .bind(&index.project_id)
        .bind(index.version as i64)
        .bind(&index.artifact_location)
        .bind(index.status.as_str())
        .bind(index.index_class.as_str())
        .bind(index.job_id.map(|id| id.to_string()))
        .bind(index.created_at.timestamp_millis())
        .bind(index.updated_at.timestamp_millis())
        .bind(&index.project_id)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => {
                Err(StoreError::Tombstoned(index.project_id.clone()))
            }
            Ok(_) => Ok(()),
            Err(error) if is_unique_violation(&error) => Err(StoreError::Conflict(format!(
                "{}/{} already exists",
                index.project_id, index.version
            ))),
            Err(error) => Err(error.into()),
        }
    }

    async fn set_index_job(&self, project_id: &str, version: Version, job_id: JobId) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE indexes SET job_id = ?, updated_at = ? \
             WHERE project_id = ? AND version = ? AND status = 'BUILDING' AND job_id IS NULL",
        )
        .bind(job_id.to_string())
        .bind(Utc::now().timestamp_millis())
        .bind(project_id)
        .bind(version as i64)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }

        let index = Self::fetch_index(&self.pool, project_id, version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;
        match index.job_id {
            Some(existing) if existing == job_id => Ok(()),
            Some(existing) => Err(StoreError::Integrity(format!(
                "{project_id}/{version} already attached to job {existing}"
            ))),
            None => Err(StoreError::Conflict(format!(
                "{project_id}/{version} is {}",
                index.status
            ))),
        }
    }

    async fn transition_index(
        &self,
        project_id: &str,
        version: Version,
        from: IndexStatus,
        to: IndexStatus,
    ) -> StoreResult<Index> {
        let mut tx = self.pool.begin().await?;
        let index = Self::fetch_index(&mut *tx, project_id, version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;
        check_transition(&index, from, to)?;

        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE indexes SET status = ?, updated_at = ? \
             WHERE project_id = ? AND version = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(now.timestamp_millis())
        .bind(project_id)
        .bind(version as i64)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "{project_id}/{version} changed concurrently"
            )));
        }
        tx.commit().await?;

        Ok(Index {
            status: to,
            updated_at: now,
            ..index
        })
    }

    async fn promote(&self, project_id: &str, version: Version) -> StoreResult<Promotion> {
        let mut tx = self.pool.begin().await?;

        let tombstoned: Option<(String,)> =
            sqlx::query_as("SELECT project_id FROM deleted_indexes WHERE project_id = ?")
                .bind(project_id)
                .fetch_optional(&mut *tx)
                .await?;
        if tombstoned.is_some() {
            return Err(StoreError::Tombstoned(project_id.to_string()));
        }

        let target = Self::fetch_index(&mut *tx, project_id, version)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("index {project_id}/{version}")))?;
        match target.status {
            IndexStatus::Ready => return Ok(Promotion::AlreadyReady),
            IndexStatus::Failed | IndexStatus::Superseded => {
                return Ok(Promotion::Rejected(target.status));
            }
            IndexStatus::Building => {}
        }

        let ready: Vec<(i64,)> = sqlx::query_as(
            "SELECT version FROM indexes WHERE project_id = ? AND status = 'READY'",
        )
        .bind(project_id)
        .fetch_all(&mut *tx)
        .await?;
        if ready.len() > 1 {
            return Err(StoreError::Integrity(format!(
                "{project_id} has {} READY versions",
                ready.len()
            )));
        }
        let active = ready.first().map(|(v,)| *v as Version);
        let now = Utc::now().timestamp_millis();

        let update = "UPDATE indexes SET status = ?, updated_at = ? \
                      WHERE project_id = ? AND version = ? AND status = ?";

        if let Some(active) = active.filter(|active| *active > version) {
            sqlx::query(update)
                .bind(IndexStatus::Superseded.as_str())
                .bind(now)
                .bind(project_id)
                .bind(version as i64)
                .bind(IndexStatus::Building.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Ok(Promotion::Stale { active });
        }

        if let Some(previous) = active {
            sqlx::query(update)
                .bind(IndexStatus::Superseded.as_str())
                .bind(now)
                .bind(project_id)
                .bind(previous as i64)
                .bind(IndexStatus::Ready.as_str())
                .execute(&mut *tx)
                .await?;
        }

        let promoted = sqlx::query(update)
            .bind(IndexStatus::Ready.as_str())
            .bind(now)
            .bind(project_id)
            .bind(version as i64)
            .bind(IndexStatus::Building.as_str())
            .execute(&mut *tx)
            .await;
        match promoted {
            Ok(done) if done.rows_affected() == 1 => {}
            Ok(_) => {
                return Err(StoreError::Conflict(format!(
                    "{project_id}/{version} changed concurrently"
                )));
            }
            Err(error) if is_unique_violation(&error) => {
                return Err(StoreError::Conflict(format!(
                    "{project_id} promoted concurrently"
                )));
            }
            Err(error) => return Err(error.into()),
        }

        tx.commit().await?;
        Ok(Promotion::Promoted { superseded: active })
    }

    async fn list_buildable(&self, now: DateTime<Utc>) -> StoreResult<Vec<Project>> {
        let rows: Vec<ProjectRow> = sqlx::query_as(
            "SELECT p.project_id, p.index_class, p.build_interval_secs, p.last_build_at, \
             p.last_build_status, p.created_at FROM projects p \
             WHERE (p.last_build_at IS NULL OR p.last_build_at + p.build_interval_secs * 1000 < ?) \
             AND NOT EXISTS (SELECT 1 FROM deleted_indexes d WHERE d.project_id = p.project_id) \
             AND NOT EXISTS (SELECT 1 FROM indexes i \
                             WHERE i.project_id = p.project_id AND i.status = 'BUILDING') \
             ORDER BY p.project_id",
        )
        .bind(now.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ProjectRow::into_project).collect()
    }

    async fn tombstone(
        &self,
        project_id: &str,
        last_active_version: Option<Version>,
    ) -> StoreResult<DeletedIndex> {
        sqlx::query(
            "INSERT INTO deleted_indexes (project_id, deleted_at, last_active_version) \
             VALUES (?, ?, ?) ON CONFLICT(project_id) DO NOTHING",
        )
        .bind(project_id)
        .bind(Utc::now().timestamp_millis())
        .bind(last_active_version.map(|v| v as i64))
        .execute(&self.pool)
        .await?;

        self.get_tombstone(project_id)
            .await?
            .ok_or_else(|| StoreError::Integrity(format!("tombstone for {project_id} vanished")))
    }

    async fn get_tombstone(&self, project_id: &str) -> StoreResult<Option<DeletedIndex>> {
        let row: Option<TombstoneRow> = sqlx::query_as(
            "SELECT project_id, deleted_at, last_active_version \
             FROM deleted_indexes WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(TombstoneRow::into_tombstone).transpose()
    }

    async fn delete_indexes(&self, project_id: &str) -> StoreResult<usize> {
        let result = sqlx::query("DELETE FROM indexes WHERE project_id = ?")
            .bind(project_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
