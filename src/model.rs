//! Records kept by the metadata store and messages carried by the control queue.

use crate::{JobId, MessageId, ProjectId, SlotId, Version};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Fleet and storage tier an index is served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexClass {
    /// Standard fleet.
    #[serde(rename = "STD")]
    Std,
    /// Infrequent-access fleet.
    #[serde(rename = "IA")]
    Ia,
}

impl IndexClass {
    pub const ALL: [IndexClass; 2] = [IndexClass::Std, IndexClass::Ia];

    pub fn as_str(&self) -> &'static str {
        match self {
            IndexClass::Std => "STD",
            IndexClass::Ia => "IA",
        }
    }
}

impl FromStr for IndexClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "STD" | "STANDARD" => Ok(IndexClass::Std),
            "IA" | "INFREQUENT_ACCESS" => Ok(IndexClass::Ia),
            other => Err(format!("unknown index class: {other}")),
        }
    }
}

impl fmt::Display for IndexClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of one index version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexStatus {
    Building,
    Ready,
    Failed,
    Superseded,
}

impl IndexStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexStatus::Building => "BUILDING",
            IndexStatus::Ready => "READY",
            IndexStatus::Failed => "FAILED",
            IndexStatus::Superseded => "SUPERSEDED",
        }
    }

    /// Transitions the store accepts. Everything else is an integrity violation.
    pub fn can_transition_to(&self, next: IndexStatus) -> bool {
        matches!(
            (self, next),
            (IndexStatus::Building, IndexStatus::Ready)
                | (IndexStatus::Building, IndexStatus::Failed)
                | (IndexStatus::Building, IndexStatus::Superseded)
                | (IndexStatus::Ready, IndexStatus::Superseded)
        )
    }
}

impl FromStr for IndexStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BUILDING" => Ok(IndexStatus::Building),
            "READY" => Ok(IndexStatus::Ready),
            "FAILED" => Ok(IndexStatus::Failed),
            "SUPERSEDED" => Ok(IndexStatus::Superseded),
            other => Err(format!("unknown index status: {other}")),
        }
    }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of the most recent build attempt for a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Never,
    Building,
    Succeeded,
    Failed,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Never => "NEVER",
            BuildStatus::Building => "BUILDING",
            BuildStatus::Succeeded => "SUCCEEDED",
            BuildStatus::Failed => "FAILED",
        }
    }
}

impl FromStr for BuildStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "NEVER" => Ok(BuildStatus::Never),
            "BUILDING" => Ok(BuildStatus::Building),
            "SUCCEEDED" => Ok(BuildStatus::Succeeded),
            "FAILED" => Ok(BuildStatus::Failed),
            other => Err(format!("unknown build status: {other}")),
        }
    }
}

/// A registered project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub project_id: ProjectId,
    pub index_class: IndexClass,
    /// Seconds between scheduled rebuilds.
    pub build_interval_secs: u64,
    pub last_build_at: Option<DateTime<Utc>>,
    pub last_build_status: BuildStatus,
    pub created_at: DateTime<Utc>,
}

impl Project {
    pub fn new(
        project_id: impl Into<ProjectId>,
        index_class: IndexClass,
        build_interval_secs: u64,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            index_class,
            build_interval_secs,
            last_build_at: None,
            last_build_status: BuildStatus::Never,
            created_at: Utc::now(),
        }
    }

    /// Whether the rebuild interval has elapsed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.last_build_at {
            None => true,
            Some(at) => at + chrono::Duration::seconds(self.build_interval_secs as i64) < now,
        }
    }
}

/// One version of a project's index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub project_id: ProjectId,
    pub version: Version,
    pub artifact_location: String,
    pub status: IndexStatus,
    pub index_class: IndexClass,
    /// Build job attached after a successful submission.
    pub job_id: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Index {
    /// A fresh BUILDING row whose artifacts will live under `project_id/version/`.
    pub fn building(project_id: impl Into<ProjectId>, version: Version, index_class: IndexClass) -> Self {
        let project_id = project_id.into();
        let now = Utc::now();
        Self {
            artifact_location: crate::blob::artifact_prefix(&project_id, version),
            project_id,
            version,
            status: IndexStatus::Building,
            index_class,
            job_id: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Tombstone written when a project's index is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeletedIndex {
    pub project_id: ProjectId,
    pub deleted_at: DateTime<Utc>,
    pub last_active_version: Option<Version>,
}

/// Result of promoting a version to READY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// The version is now READY; the previous READY version, if any, was superseded.
    Promoted { superseded: Option<Version> },
    /// The version was already READY.
    AlreadyReady,
    /// A newer version is READY; this one was marked SUPERSEDED instead.
    Stale { active: Version },
    /// The version is FAILED or SUPERSEDED and can no longer become READY.
    Rejected(IndexStatus),
}

/// Kind of control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandType {
    IndexBuild,
    IndexResched,
    IndexRefresh,
    IndexDelete,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::IndexBuild => "INDEX_BUILD",
            CommandType::IndexResched => "INDEX_RESCHED",
            CommandType::IndexRefresh => "INDEX_REFRESH",
            CommandType::IndexDelete => "INDEX_DELETE",
        }
    }
}

impl FromStr for CommandType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INDEX_BUILD" => Ok(CommandType::IndexBuild),
            "INDEX_RESCHED" => Ok(CommandType::IndexResched),
            "INDEX_REFRESH" => Ok(CommandType::IndexRefresh),
            "INDEX_DELETE" => Ok(CommandType::IndexDelete),
            other => Err(format!("unknown command type: {other}")),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JSON body of a control message.
///
/// ```json
/// {"type": "INDEX_REFRESH", "projectId": "p1", "version": 4}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlCommand {
    #[serde(rename = "type")]
    pub kind: CommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

impl ControlCommand {
    pub fn build(project_id: impl Into<ProjectId>) -> Self {
        Self::for_project(CommandType::IndexBuild, project_id)
    }

    pub fn resched() -> Self {
        Self {
            kind: CommandType::IndexResched,
            project_id: None,
            version: None,
            job_id: None,
        }
    }

    pub fn refresh(project_id: impl Into<ProjectId>, version: Version, job_id: Option<JobId>) -> Self {
        Self {
            version: Some(version),
            job_id,
            ..Self::for_project(CommandType::IndexRefresh, project_id)
        }
    }

    pub fn delete(project_id: impl Into<ProjectId>) -> Self {
        Self::for_project(CommandType::IndexDelete, project_id)
    }

    fn for_project(kind: CommandType, project_id: impl Into<ProjectId>) -> Self {
        Self {
            kind,
            project_id: Some(project_id.into()),
            version: None,
            job_id: None,
        }
    }
}

/// A command as delivered by the control queue.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub message_id: MessageId,
    pub command: ControlCommand,
    /// Number of times the queue has handed this message out, including this one.
    pub receive_count: u32,
    pub sent_at: DateTime<Utc>,
}

/// State of a build job as reported by the fleet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Submitted,
    Running,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Submitted => "SUBMITTED",
            JobState::Running => "RUNNING",
            JobState::Succeeded => "SUCCEEDED",
            JobState::Failed => "FAILED",
            JobState::TimedOut => "TIMED_OUT",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A build job correlated 1:1 with a BUILDING index row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuildJob {
    pub job_id: JobId,
    pub project_id: ProjectId,
    pub index_version: Version,
    pub attempt: u32,
    pub state: JobState,
}

/// Snapshot of one query-serving slot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FleetSlot {
    pub slot_id: SlotId,
    pub index_class: IndexClass,
    /// Loaded version per project.
    pub loaded: Vec<(ProjectId, Version)>,
}

impl FleetSlot {
    pub fn loaded_version(&self, project_id: &str) -> Option<Version> {
        self.loaded
            .iter()
            .find(|(id, _)| id == project_id)
            .map(|(_, version)| *version)
    }
}
