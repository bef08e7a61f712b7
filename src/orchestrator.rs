//! Build job orchestration.
//!
//! The orchestrator turns a BUILDING index row into a job on the build
//! fleet, tracks it until it reaches a terminal state, and reports the
//! outcome: success re-enters the control queue as `INDEX_REFRESH`, failure
//! marks the row FAILED directly. The fleet itself owns queueing, attempts
//! and per-attempt timeouts.

pub mod local;
pub mod scripted;

use crate::config::BuilderConfig;
use crate::error::{FleetError, StoreError};
use crate::model::{BuildJob, BuildStatus, ControlCommand, IndexClass, IndexStatus, JobState};
use crate::queue::CommandPublisher;
use crate::retry::{RetryError, RetryPolicy};
use crate::store::MetadataStore;
use crate::{JobId, ProjectId, Version};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

pub use local::LocalFleet;
pub use scripted::ScriptedFleet;

/// Everything the fleet needs to run one build.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobDescriptor {
    pub name: String,
    pub project_id: ProjectId,
    pub version: Version,
    pub index_class: IndexClass,
    pub command: Vec<String>,
    pub image: String,
    pub vcpu: u32,
    pub memory_mib: u64,
    pub ephemeral_storage_gib: u32,
    pub mounted_volume: Option<PathBuf>,
    pub retry_attempts: u32,
    pub attempt_timeout: Duration,
    pub environment: Vec<(String, String)>,
}

impl JobDescriptor {
    pub fn for_build(
        config: &BuilderConfig,
        project_id: &str,
        version: Version,
        index_class: IndexClass,
    ) -> Self {
        let prefix = crate::blob::artifact_prefix(project_id, version);
        let mut environment = vec![
            ("PROJECT_ID".to_string(), project_id.to_string()),
            ("INDEX_VERSION".to_string(), version.to_string()),
            ("INDEX_CLASS".to_string(), index_class.to_string()),
            ("ARTIFACT_PREFIX".to_string(), prefix.clone()),
        ];
        if let Some(root) = &config.artifact_root {
            environment.push(("BLOB_ROOT".to_string(), root.display().to_string()));
            environment.push((
                "ARTIFACT_DIR".to_string(),
                root.join(&prefix).display().to_string(),
            ));
        }
        Self {
            name: format!("index-build-{project_id}-{version}"),
            project_id: project_id.to_string(),
            version,
            index_class,
            command: config.command.clone(),
            image: config.image.clone(),
            vcpu: config.vcpu,
            memory_mib: config.memory_mib,
            ephemeral_storage_gib: config.ephemeral_storage_gib,
            mounted_volume: config.mounted_volume.clone(),
            retry_attempts: config.retry_attempts,
            attempt_timeout: config.attempt_timeout(),
            environment,
        }
    }

    pub fn validate(&self) -> Result<(), FleetError> {
        if self.command.is_empty() {
            return Err(FleetError::InvalidDescriptor(format!("{}: empty command", self.name)));
        }
        if self.vcpu == 0 || self.retry_attempts == 0 || self.attempt_timeout.is_zero() {
            return Err(FleetError::InvalidDescriptor(format!(
                "{}: vcpu, retry attempts and timeout must be positive",
                self.name
            )));
        }
        Ok(())
    }
}

/// State of a job as reported by the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FleetJobStatus {
    pub state: JobState,
    /// Attempt currently running, or the last one made.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A compute fleet that runs build jobs.
#[async_trait]
pub trait BuildFleet: Send + Sync + 'static {
    /// Queue a job. Returns the fleet's identifier for it.
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, FleetError>;

    async fn describe(&self, fleet_job_id: &str) -> Result<FleetJobStatus, FleetError>;

    async fn cancel(&self, fleet_job_id: &str) -> Result<(), FleetError>;
}

#[derive(Debug, Clone)]
struct TrackedJob {
    job: BuildJob,
    fleet_job_id: String,
    vcpu: u32,
    cancelled: bool,
}

#[derive(Debug, Default)]
struct JobTable {
    jobs: HashMap<JobId, TrackedJob>,
    by_version: HashMap<(ProjectId, Version), JobId>,
}

impl JobTable {
    fn remove(&mut self, job_id: JobId) -> Option<TrackedJob> {
        let tracked = self.jobs.remove(&job_id)?;
        self.by_version
            .remove(&(tracked.job.project_id.clone(), tracked.job.index_version));
        Some(tracked)
    }

    fn in_flight_vcpus(&self) -> u32 {
        self.jobs
            .values()
            .filter(|tracked| !tracked.job.state.is_terminal())
            .map(|tracked| tracked.vcpu)
            .sum()
    }
}

pub struct BuildOrchestrator {
    fleet: Arc<dyn BuildFleet>,
    store: Arc<dyn MetadataStore>,
    publisher: Arc<dyn CommandPublisher>,
    config: BuilderConfig,
    table: Mutex<JobTable>,
    /// Serializes submissions of the same version. Entries live while a
    /// submission for the pair is in progress.
    submit_locks: Mutex<HashMap<(ProjectId, Version), Arc<tokio::sync::Mutex<()>>>>,
}

impl std::fmt::Debug for BuildOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOrchestrator")
            .field("tracked_jobs", &self.table.lock().jobs.len())
            .finish()
    }
}

impl BuildOrchestrator {
    pub fn new(
        fleet: Arc<dyn BuildFleet>,
        store: Arc<dyn MetadataStore>,
        publisher: Arc<dyn CommandPublisher>,
        config: BuilderConfig,
    ) -> Self {
        Self {
            fleet,
            store,
            publisher,
            config,
            table: Mutex::new(JobTable::default()),
            submit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    /// Submit a build for `(project_id, version)`.
    ///
    /// Idempotent: a job already tracked for the pair is returned as-is.
    /// Fleet throttling is retried with backoff up to the configured bound.
    pub async fn submit(
        &self,
        project_id: &str,
        version: Version,
        index_class: IndexClass,
    ) -> Result<BuildJob, FleetError> {
        let key = (project_id.to_string(), version);
        let lock = self.submit_locks.lock().entry(key.clone()).or_default().clone();
        let guard = lock.lock().await;
        let result = self.submit_locked(project_id, version, index_class).await;
        drop(guard);

        let mut locks = self.submit_locks.lock();
        if locks.get(&key).is_some_and(|held| Arc::strong_count(held) == 2) {
            locks.remove(&key);
        }
        result
    }

    async fn submit_locked(
        &self,
        project_id: &str,
        version: Version,
        index_class: IndexClass,
    ) -> Result<BuildJob, FleetError> {
        if let Some(existing) = self.job_for(project_id, version) {
            tracing::debug!(project_id, version, job_id = %existing.job_id, "build already submitted");
            return Ok(existing);
        }

        let descriptor = JobDescriptor::for_build(&self.config, project_id, version, index_class);
        descriptor.validate()?;

        let in_flight = self.in_flight_vcpus();
        if in_flight + descriptor.vcpu > self.config.max_vcpus {
            tracing::warn!(
                project_id,
                version,
                in_flight_vcpus = in_flight,
                requested = descriptor.vcpu,
                max_vcpus = self.config.max_vcpus,
                "build fleet over vCPU ceiling, job will queue"
            );
        }

        let policy = RetryPolicy::new(
            self.config.submit_max_attempts,
            Duration::from_millis(self.config.submit_base_delay_ms),
            Duration::from_millis(self.config.submit_max_delay_ms),
        );
        let fleet = &self.fleet;
        let pending = &descriptor;
        let fleet_job_id = policy
            .run(
                move |_| fleet.submit(pending),
                |error| matches!(error, FleetError::CapacityExceeded(_)),
            )
            .await
            .map_err(|error| match error {
                RetryError::Permanent(error) | RetryError::Exhausted { last: error, .. } => error,
                RetryError::TimedOut { attempts } => FleetError::CapacityExceeded(format!(
                    "submission timed out after {attempts} attempts"
                )),
            })?;

        let job = BuildJob {
            job_id: uuid::Uuid::new_v4(),
            project_id: project_id.to_string(),
            index_version: version,
            attempt: 0,
            state: JobState::Submitted,
        };
        {
            let mut table = self.table.lock();
            table
                .by_version
                .insert((job.project_id.clone(), version), job.job_id);
            table.jobs.insert(
                job.job_id,
                TrackedJob {
                    job: job.clone(),
                    fleet_job_id: fleet_job_id.clone(),
                    vcpu: descriptor.vcpu,
                    cancelled: false,
                },
            );
        }

        tracing::info!(
            project_id,
            version,
            job_id = %job.job_id,
            %fleet_job_id,
            "build job submitted"
        );
        Ok(job)
    }

    /// Refresh a job's state from the fleet.
    pub async fn poll(&self, job_id: JobId) -> Result<BuildJob, FleetError> {
        let fleet_job_id = self
            .table
            .lock()
            .jobs
            .get(&job_id)
            .map(|tracked| tracked.fleet_job_id.clone())
            .ok_or_else(|| FleetError::UnknownJob(job_id.to_string()))?;

        let status = self.fleet.describe(&fleet_job_id).await?;

        let mut table = self.table.lock();
        let tracked = table
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| FleetError::UnknownJob(job_id.to_string()))?;
        if tracked.job.state != status.state {
            tracing::debug!(
                job_id = %job_id,
                from = %tracked.job.state,
                to = %status.state,
                attempt = status.attempt,
                "build job state changed"
            );
        }
        tracked.job.state = status.state;
        tracked.job.attempt = status.attempt;
        Ok(tracked.job.clone())
    }

    /// Request cancellation. Completion of a cancelled job is never reported.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), FleetError> {
        let fleet_job_id = {
            let mut table = self.table.lock();
            let tracked = table
                .jobs
                .get_mut(&job_id)
                .ok_or_else(|| FleetError::UnknownJob(job_id.to_string()))?;
            tracked.cancelled = true;
            tracked.fleet_job_id.clone()
        };
        self.fleet.cancel(&fleet_job_id).await?;
        tracing::info!(job_id = %job_id, "build job cancellation requested");
        Ok(())
    }

    pub fn job_for(&self, project_id: &str, version: Version) -> Option<BuildJob> {
        let table = self.table.lock();
        table
            .by_version
            .get(&(project_id.to_string(), version))
            .and_then(|job_id| table.jobs.get(job_id))
            .map(|tracked| tracked.job.clone())
    }

    pub fn jobs(&self) -> Vec<BuildJob> {
        let mut jobs: Vec<BuildJob> = self
            .table
            .lock()
            .jobs
            .values()
            .map(|tracked| tracked.job.clone())
            .collect();
        jobs.sort_by(|a, b| {
            (&a.project_id, a.index_version).cmp(&(&b.project_id, b.index_version))
        });
        jobs
    }

    pub fn in_flight_vcpus(&self) -> u32 {
        self.table.lock().in_flight_vcpus()
    }

    /// Poll every tracked job once and report the ones that finished.
    /// Returns the number of jobs reported.
    pub async fn monitor_once(&self) -> usize {
        let job_ids: Vec<JobId> = self.table.lock().jobs.keys().copied().collect();
        let mut reported = 0;

        for job_id in job_ids {
            let job = match self.poll(job_id).await {
                Ok(job) => job,
                Err(error) => {
                    tracing::warn!(job_id = %job_id, %error, "failed to poll build job");
                    continue;
                }
            };
            if !job.state.is_terminal() {
                continue;
            }

            match self.report(&job).await {
                Ok(()) => {
                    self.table.lock().remove(job_id);
                    reported += 1;
                }
                Err(error) => {
                    tracing::warn!(
                        job_id = %job_id,
                        project_id = %job.project_id,
                        %error,
                        "failed to report build outcome, will retry"
                    );
                }
            }
        }
        reported
    }

    async fn report(&self, job: &BuildJob) -> crate::Result<()> {
        let cancelled = self
            .table
            .lock()
            .jobs
            .get(&job.job_id)
            .is_some_and(|tracked| tracked.cancelled);
        if cancelled {
            tracing::debug!(job_id = %job.job_id, state = %job.state, "ignoring cancelled build job");
            return Ok(());
        }
        if self.store.get_tombstone(&job.project_id).await?.is_some() {
            tracing::info!(
                job_id = %job.job_id,
                project_id = %job.project_id,
                "ignoring build result for deleted project"
            );
            return Ok(());
        }

        if job.state == JobState::Succeeded {
            let message_id = self
                .publisher
                .publish(ControlCommand::refresh(
                    job.project_id.clone(),
                    job.index_version,
                    Some(job.job_id),
                ))
                .await?;
            tracing::info!(
                job_id = %job.job_id,
                project_id = %job.project_id,
                version = job.index_version,
                %message_id,
                "build succeeded, refresh queued"
            );
            return Ok(());
        }

        match self
            .store
            .transition_index(
                &job.project_id,
                job.index_version,
                IndexStatus::Building,
                IndexStatus::Failed,
            )
            .await
        {
            Ok(_) | Err(StoreError::Conflict(_)) | Err(StoreError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        match self
            .store
            .record_build(&job.project_id, None, BuildStatus::Failed)
            .await
        {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }

        tracing::warn!(
            job_id = %job.job_id,
            project_id = %job.project_id,
            version = job.index_version,
            state = %job.state,
            attempts = job.attempt,
            "build failed, previous READY version stays active"
        );
        Ok(())
    }

    /// Poll until `shutdown` flips to true.
    pub async fn run_monitor(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval().max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(poll_interval = ?self.config.poll_interval(), "build monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.monitor_once().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("build monitor stopped");
    }
}
