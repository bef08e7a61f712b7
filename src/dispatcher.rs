//! Command dispatcher: applies control messages to the metadata store, the
//! build orchestrator, the query fleet and the blob store.
//!
//! Handlers hold no locks of their own. Every guarantee (one build in flight
//! per project, one READY version, idempotent delete) comes from the store's
//! conditional writes, so any number of workers may run `handle` at once and
//! any message may be delivered more than once.

use crate::blob::{BlobStore, project_prefix};
use crate::config::Config;
use crate::error::StoreError;
use crate::fleet::FleetRegistry;
use crate::model::{
    BuildStatus, CommandType, ControlCommand, ControlMessage, Index, IndexStatus, Project,
    Promotion,
};
use crate::orchestrator::BuildOrchestrator;
use crate::queue::CommandPublisher;
use crate::store::MetadataStore;
use crate::{Error, MessageId, Result, Version};

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// What the worker should do with a message after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// Delete the message.
    Ack,
    /// Make the message visible again for another attempt.
    Retry,
    /// Move the message to the dead-letter list.
    Drop,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_receive_count: u32,
    /// How long a handled message id is remembered.
    pub dedup_window: Duration,
    pub dedup_capacity: u64,
    /// Local re-reads after losing a conditional write.
    pub conflict_retries: u32,
    /// Age at which a BUILDING row is treated as abandoned.
    pub stale_build_after: Duration,
}

impl DispatcherConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_receive_count: config.queue.max_receive_count,
            dedup_window: config.queue.visibility_timeout(),
            dedup_capacity: config.queue.dedup_capacity,
            conflict_retries: 3,
            stale_build_after: config.builder.failure_timeout(),
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Default)]
struct Counters {
    acked: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
    duplicates: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DispatchStats {
    pub acked: u64,
    pub retried: u64,
    pub dropped: u64,
    pub duplicates: u64,
}

pub struct CommandDispatcher {
    store: Arc<dyn MetadataStore>,
    blobs: Arc<dyn BlobStore>,
    orchestrator: Arc<BuildOrchestrator>,
    fleet: Arc<FleetRegistry>,
    publisher: Arc<dyn CommandPublisher>,
    config: DispatcherConfig,
    processed: moka::future::Cache<MessageId, ()>,
    counters: Counters,
}

impl std::fmt::Debug for CommandDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandDispatcher")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl CommandDispatcher {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        blobs: Arc<dyn BlobStore>,
        orchestrator: Arc<BuildOrchestrator>,
        fleet: Arc<FleetRegistry>,
        publisher: Arc<dyn CommandPublisher>,
        config: DispatcherConfig,
    ) -> Self {
        let processed = moka::future::Cache::builder()
            .max_capacity(config.dedup_capacity)
            .time_to_live(config.dedup_window)
            .build();
        Self {
            store,
            blobs,
            orchestrator,
            fleet,
            publisher,
            config,
            processed,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            acked: self.counters.acked.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            duplicates: self.counters.duplicates.load(Ordering::Relaxed),
        }
    }

    /// Handle one delivery of a control message.
    pub async fn handle(&self, message: &ControlMessage) -> Disposition {
        let command = &message.command;
        let project_id = command.project_id.as_deref().unwrap_or("-");

        if self.processed.contains_key(&message.message_id) {
            tracing::debug!(
                message_id = %message.message_id,
                kind = %command.kind,
                project_id,
                "duplicate control message, already handled"
            );
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            return self.settle(message, Disposition::Ack).await;
        }

        if message.receive_count > self.config.max_receive_count {
            self.exhaust(message, "receive count above ceiling on arrival")
                .await;
            return self.settle(message, Disposition::Drop).await;
        }

        tracing::debug!(
            message_id = %message.message_id,
            kind = %command.kind,
            project_id,
            receive_count = message.receive_count,
            "handling control message"
        );

        let disposition = match self.execute(command).await {
            Ok(()) => Disposition::Ack,
            Err(error) if !error.is_transient() => {
                tracing::error!(
                    message_id = %message.message_id,
                    kind = %command.kind,
                    project_id,
                    %error,
                    "permanent failure handling control message, dead-lettering"
                );
                Disposition::Drop
            }
            Err(error) if message.receive_count >= self.config.max_receive_count => {
                self.exhaust(message, &error.to_string()).await;
                Disposition::Drop
            }
            Err(error) => {
                tracing::warn!(
                    message_id = %message.message_id,
                    kind = %command.kind,
                    project_id,
                    receive_count = message.receive_count,
                    %error,
                    "control message failed, will retry"
                );
                Disposition::Retry
            }
        };
        self.settle(message, disposition).await
    }

    async fn settle(&self, message: &ControlMessage, disposition: Disposition) -> Disposition {
        let counter = match disposition {
            Disposition::Ack => {
                self.processed.insert(message.message_id.clone(), ()).await;
                &self.counters.acked
            }
            Disposition::Retry => &self.counters.retried,
            Disposition::Drop => &self.counters.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        disposition
    }

    async fn execute(&self, command: &ControlCommand) -> Result<()> {
        match command.kind {
            CommandType::IndexBuild => self.build(require_project(command)?).await,
            CommandType::IndexResched => self.resched().await,
            CommandType::IndexRefresh => {
                let version = command.version.ok_or_else(|| {
                    Error::Malformed("INDEX_REFRESH requires a version".into())
                })?;
                self.refresh(require_project(command)?, version).await
            }
            CommandType::IndexDelete => self.delete(require_project(command)?).await,
        }
    }

    async fn build(&self, project_id: &str) -> Result<()> {
        if self.store.get_tombstone(project_id).await?.is_some() {
            tracing::info!(project_id, "build requested for deleted project, skipping");
            return Ok(());
        }
        let Some(project) = self.store.get_project(project_id).await? else {
            tracing::warn!(project_id, "build requested for unknown project, skipping");
            return Ok(());
        };

        for _ in 0..=self.config.conflict_retries {
            let indexes = self.store.list_indexes(project_id).await?;

            if let Some(building) = indexes
                .iter()
                .rev()
                .find(|index| index.status == IndexStatus::Building)
            {
                if self.is_abandoned(building) {
                    self.fail_abandoned(building).await?;
                    continue;
                }
                if let Some(job_id) = building.job_id {
                    tracing::debug!(
                        project_id,
                        version = building.version,
                        job_id = %job_id,
                        "build already in flight"
                    );
                    return Ok(());
                }
                // Row written but the job was never attached: resume it.
                return self.submit_build(&project, building.version).await;
            }

            let next = indexes.last().map_or(1, |index| index.version + 1);
            match self
                .store
                .put_index(&Index::building(project_id, next, project.index_class))
                .await
            {
                Ok(()) => return self.submit_build(&project, next).await,
                Err(StoreError::Conflict(_)) => {
                    tracing::debug!(project_id, version = next, "lost version race, re-reading");
                }
                Err(StoreError::Tombstoned(_)) => {
                    tracing::info!(project_id, "project deleted during build request");
                    return Ok(());
                }
                Err(error) => return Err(error.into()),
            }
        }

        Err(StoreError::Conflict(format!(
            "{project_id}: could not claim a build version after {} attempts",
            self.config.conflict_retries + 1
        ))
        .into())
    }

    fn is_abandoned(&self, index: &Index) -> bool {
        let age = Utc::now().signed_duration_since(index.created_at);
        age.to_std()
            .is_ok_and(|age| age > self.config.stale_build_after)
    }

    async fn fail_abandoned(&self, index: &Index) -> Result<()> {
        tracing::warn!(
            project_id = %index.project_id,
            version = index.version,
            created_at = %index.created_at,
            "BUILDING index exceeded the builder failure timeout, marking FAILED"
        );
        if let Some(job_id) = index.job_id {
            self.orchestrator.cancel(job_id).await.ok();
        }
        match self
            .store
            .transition_index(
                &index.project_id,
                index.version,
                IndexStatus::Building,
                IndexStatus::Failed,
            )
            .await
        {
            Ok(_) | Err(StoreError::Conflict(_)) => {}
            Err(error) => return Err(error.into()),
        }
        self.store
            .record_build(&index.project_id, None, BuildStatus::Failed)
            .await?;
        Ok(())
    }

    async fn submit_build(&self, project: &Project, version: Version) -> Result<()> {
        let project_id = project.project_id.as_str();
        let job = self
            .orchestrator
            .submit(project_id, version, project.index_class)
            .await?;

        match self.store.set_index_job(project_id, version, job.job_id).await {
            Ok(()) => {}
            Err(
                error @ (StoreError::NotFound(_)
                | StoreError::Tombstoned(_)
                | StoreError::Conflict(_)),
            ) => {
                tracing::info!(
                    project_id,
                    version,
                    job_id = %job.job_id,
                    %error,
                    "index row changed before the job was attached, cancelling job"
                );
                self.orchestrator.cancel(job.job_id).await.ok();
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        }

        self.store
            .record_build(project_id, Some(Utc::now()), BuildStatus::Building)
            .await?;
        tracing::info!(
            project_id,
            version,
            job_id = %job.job_id,
            index_class = %project.index_class,
            "index build started"
        );
        Ok(())
    }

    async fn resched(&self) -> Result<()> {
        let due = self.store.list_buildable(Utc::now()).await?;
        let mut failed = 0;
        for project in &due {
            if let Err(error) = self
                .publisher
                .publish(ControlCommand::build(project.project_id.clone()))
                .await
            {
                tracing::warn!(project_id = %project.project_id, %error, "failed to emit build command");
                failed += 1;
            }
        }

        tracing::info!(due = due.len(), failed, "reschedule sweep finished");
        if failed > 0 {
            return Err(anyhow::anyhow!("{failed} of {} build emissions failed", due.len()).into());
        }
        Ok(())
    }

    async fn refresh(&self, project_id: &str, version: Version) -> Result<()> {
        if self.store.get_tombstone(project_id).await?.is_some() {
            tracing::info!(project_id, version, "refresh for deleted project, ignoring");
            return Ok(());
        }
        let Some(index) = self.store.get_index(project_id, version).await? else {
            tracing::warn!(project_id, version, "refresh for unknown index version, ignoring");
            return Ok(());
        };

        match index.status {
            IndexStatus::Failed | IndexStatus::Superseded => {
                tracing::info!(project_id, version, status = %index.status, "late refresh, ignoring");
                return Ok(());
            }
            IndexStatus::Building => match self.store.promote(project_id, version).await {
                Ok(Promotion::Promoted { superseded }) => {
                    tracing::info!(project_id, version, ?superseded, "index version promoted to READY");
                }
                Ok(Promotion::AlreadyReady) => {}
                Ok(Promotion::Stale { active }) => {
                    tracing::info!(project_id, version, active, "newer version already READY, superseding");
                    return Ok(());
                }
                Ok(Promotion::Rejected(status)) => {
                    tracing::info!(project_id, version, %status, "version can no longer be promoted");
                    return Ok(());
                }
                Err(StoreError::Tombstoned(_) | StoreError::NotFound(_)) => return Ok(()),
                Err(error) => return Err(error.into()),
            },
            IndexStatus::Ready => {}
        }

        self.record_success(project_id, version).await?;

        let outcome = self
            .fleet
            .refresh(index.index_class, project_id, version, &index.artifact_location)
            .await;
        if self.store.get_tombstone(project_id).await?.is_some() {
            let evicted = self.fleet.evict(project_id).await?;
            tracing::info!(project_id, version, evicted, "project deleted during refresh, evicted");
            return Ok(());
        }
        if !outcome.is_complete() {
            return Err(Error::PartialRefresh {
                updated: outcome.updated.len() + outcome.skipped.len(),
                failed: outcome.failed.len(),
            });
        }
        Ok(())
    }

    /// Mark the project's build SUCCEEDED when `version` is its newest index.
    async fn record_success(&self, project_id: &str, version: Version) -> Result<()> {
        let newest = self
            .store
            .list_indexes(project_id)
            .await?
            .last()
            .map(|index| index.version);
        if newest == Some(version) {
            match self
                .store
                .record_build(project_id, None, BuildStatus::Succeeded)
                .await
            {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(error) => return Err(error.into()),
            }
        }
        Ok(())
    }

    async fn delete(&self, project_id: &str) -> Result<()> {
        let indexes = self.store.list_indexes(project_id).await?;
        let active = indexes
            .iter()
            .find(|index| index.status == IndexStatus::Ready)
            .map(|index| index.version);
        let tombstone = self.store.tombstone(project_id, active).await?;

        // Rows created before the tombstone landed are only visible after it.
        let building = self.store.list_indexes(project_id).await?;
        for index in building
            .iter()
            .filter(|index| index.status == IndexStatus::Building)
        {
            let job_id = index.job_id.or_else(|| {
                self.orchestrator
                    .job_for(project_id, index.version)
                    .map(|job| job.job_id)
            });
            if let Some(job_id) = job_id {
                if let Err(error) = self.orchestrator.cancel(job_id).await {
                    tracing::warn!(project_id, version = index.version, %error, "failed to cancel build job");
                }
            }
        }

        let evicted = self.fleet.evict(project_id).await?;
        let blobs = self.blobs.delete(&project_prefix(project_id)).await?;
        let rows = self.store.delete_indexes(project_id).await?;

        tracing::info!(
            project_id,
            last_active_version = ?tombstone.last_active_version,
            evicted,
            blobs,
            rows,
            "project index deleted"
        );
        Ok(())
    }

    /// Dead-letter bookkeeping: the build this message was driving is over.
    async fn exhaust(&self, message: &ControlMessage, reason: &str) {
        let command = &message.command;
        tracing::error!(
            alert = true,
            message_id = %message.message_id,
            kind = %command.kind,
            project_id = command.project_id.as_deref().unwrap_or("-"),
            receive_count = message.receive_count,
            reason,
            "control message exhausted its retries, dead-lettering"
        );

        let Some(project_id) = command.project_id.as_deref() else {
            return;
        };
        let target = match command.kind {
            CommandType::IndexBuild => self
                .store
                .list_indexes(project_id)
                .await
                .ok()
                .and_then(|indexes| {
                    indexes
                        .into_iter()
                        .rev()
                        .find(|index| index.status == IndexStatus::Building)
                }),
            CommandType::IndexRefresh => match command.version {
                Some(version) => self
                    .store
                    .get_index(project_id, version)
                    .await
                    .ok()
                    .flatten()
                    .filter(|index| index.status == IndexStatus::Building),
                None => None,
            },
            CommandType::IndexResched | CommandType::IndexDelete => None,
        };
        let Some(index) = target else {
            return;
        };

        if let Some(job_id) = index.job_id {
            self.orchestrator.cancel(job_id).await.ok();
        }
        if let Err(error) = self
            .store
            .transition_index(project_id, index.version, IndexStatus::Building, IndexStatus::Failed)
            .await
        {
            tracing::warn!(project_id, version = index.version, %error, "failed to mark index FAILED");
        }
        if let Err(error) = self
            .store
            .record_build(project_id, None, BuildStatus::Failed)
            .await
        {
            tracing::warn!(project_id, %error, "failed to record build failure");
        }
    }
}

fn require_project(command: &ControlCommand) -> Result<&str> {
    command
        .project_id
        .as_deref()
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Malformed(format!("{} requires a projectId", command.kind)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::config::BuilderConfig;
    use crate::error::FleetError;
    use crate::fleet::{NoopTransport, SlotTransport};
    use crate::model::{DeletedIndex, IndexClass, JobState};
    use crate::orchestrator::ScriptedFleet;
    use crate::queue::ControlQueue;
    use crate::store::{MemoryStore, StoreResult};
    use crate::{JobId, SlotId};

    use async_trait::async_trait;
    use chrono::DateTime;
    use parking_lot::Mutex;
    use std::collections::HashSet;
    use tokio::sync::{Notify, Semaphore};

    struct Harness {
        store: Arc<MemoryStore>,
        fleet: Arc<ScriptedFleet>,
        queue: Arc<ControlQueue>,
        dispatcher: CommandDispatcher,
    }

    fn harness(config: DispatcherConfig) -> Harness {
        let store = Arc::new(MemoryStore::new());
        assemble(config, store.clone(), store, Arc::new(NoopTransport))
    }

    fn assemble(
        config: DispatcherConfig,
        store: Arc<MemoryStore>,
        backend: Arc<dyn MetadataStore>,
        transport: Arc<dyn SlotTransport>,
    ) -> Harness {
        let fleet = Arc::new(ScriptedFleet::new());
        let queue = Arc::new(ControlQueue::new(Duration::from_secs(60)));
        let orchestrator = Arc::new(BuildOrchestrator::new(
            fleet.clone(),
            backend.clone(),
            queue.clone(),
            BuilderConfig {
                submit_max_attempts: 2,
                submit_base_delay_ms: 1,
                submit_max_delay_ms: 2,
                ..BuilderConfig::default()
            },
        ));
        let dispatcher = CommandDispatcher::new(
            backend,
            Arc::new(MemoryBlobStore::new()),
            orchestrator,
            Arc::new(FleetRegistry::new(2, 1, transport)),
            queue.clone(),
            config,
        );
        Harness {
            store,
            fleet,
            queue,
            dispatcher,
        }
    }

    /// Fails loads on the slots listed in `broken`.
    #[derive(Default)]
    struct BrokenSlots {
        broken: Mutex<HashSet<SlotId>>,
    }

    #[async_trait]
    impl SlotTransport for BrokenSlots {
        async fn load(
            &self,
            _index_class: IndexClass,
            slot_id: SlotId,
            _project_id: &str,
            _version: Version,
            _artifact_location: &str,
        ) -> std::result::Result<(), FleetError> {
            if self.broken.lock().contains(&slot_id) {
                return Err(FleetError::SlotUnavailable {
                    slot: slot_id,
                    reason: "connection refused".into(),
                });
            }
            Ok(())
        }

        async fn unload(
            &self,
            _index_class: IndexClass,
            _slot_id: SlotId,
            _project_id: &str,
        ) -> std::result::Result<(), FleetError> {
            Ok(())
        }
    }

    /// Holds every load until `gate` hands out a permit.
    struct GatedLoads {
        started: Notify,
        gate: Semaphore,
    }

    impl GatedLoads {
        fn new() -> Self {
            Self {
                started: Notify::new(),
                gate: Semaphore::new(0),
            }
        }
    }

    #[async_trait]
    impl SlotTransport for GatedLoads {
        async fn load(
            &self,
            _index_class: IndexClass,
            slot_id: SlotId,
            _project_id: &str,
            _version: Version,
            _artifact_location: &str,
        ) -> std::result::Result<(), FleetError> {
            self.started.notify_one();
            let permit = self.gate.acquire().await.map_err(|_| FleetError::SlotUnavailable {
                slot: slot_id,
                reason: "gate closed".into(),
            })?;
            permit.forget();
            Ok(())
        }

        async fn unload(
            &self,
            _index_class: IndexClass,
            _slot_id: SlotId,
            _project_id: &str,
        ) -> std::result::Result<(), FleetError> {
            Ok(())
        }
    }

    /// Inserts `late` the moment a tombstone is requested, as a concurrent
    /// build would between the delete's first read and its tombstone write.
    struct RacingStore {
        inner: Arc<MemoryStore>,
        late: Mutex<Option<Index>>,
    }

    #[async_trait]
    impl MetadataStore for RacingStore {
        async fn create_project(&self, project: &Project) -> StoreResult<bool> {
            self.inner.create_project(project).await
        }

        async fn get_project(&self, project_id: &str) -> StoreResult<Option<Project>> {
            self.inner.get_project(project_id).await
        }

        async fn record_build(
            &self,
            project_id: &str,
            at: Option<DateTime<Utc>>,
            status: BuildStatus,
        ) -> StoreResult<()> {
            self.inner.record_build(project_id, at, status).await
        }

        async fn list_indexes(&self, project_id: &str) -> StoreResult<Vec<Index>> {
            self.inner.list_indexes(project_id).await
        }

        async fn get_index(&self, project_id: &str, version: Version) -> StoreResult<Option<Index>> {
            self.inner.get_index(project_id, version).await
        }

        async fn put_index(&self, index: &Index) -> StoreResult<()> {
            self.inner.put_index(index).await
        }

        async fn set_index_job(&self, project_id: &str, version: Version, job_id: JobId) -> StoreResult<()> {
            self.inner.set_index_job(project_id, version, job_id).await
        }

        async fn transition_index(
            &self,
            project_id: &str,
            version: Version,
            from: IndexStatus,
            to: IndexStatus,
        ) -> StoreResult<Index> {
            self.inner.transition_index(project_id, version, from, to).await
        }

        async fn promote(&self, project_id: &str, version: Version) -> StoreResult<Promotion> {
            self.inner.promote(project_id, version).await
        }

        async fn list_buildable(&self, now: DateTime<Utc>) -> StoreResult<Vec<Project>> {
            self.inner.list_buildable(now).await
        }

        async fn tombstone(
            &self,
            project_id: &str,
            last_active_version: Option<Version>,
        ) -> StoreResult<DeletedIndex> {
            let late = self.late.lock().take();
            if let Some(index) = late {
                self.inner.put_index(&index).await?;
            }
            self.inner.tombstone(project_id, last_active_version).await
        }

        async fn get_tombstone(&self, project_id: &str) -> StoreResult<Option<DeletedIndex>> {
            self.inner.get_tombstone(project_id).await
        }

        async fn delete_indexes(&self, project_id: &str) -> StoreResult<usize> {
            self.inner.delete_indexes(project_id).await
        }
    }

    fn message(command: ControlCommand, receive_count: u32) -> ControlMessage {
        ControlMessage {
            message_id: uuid::Uuid::new_v4().to_string(),
            command,
            receive_count,
            sent_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn missing_fields_are_dropped() {
        let h = harness(DispatcherConfig::default());
        let refresh = ControlCommand {
            version: None,
            ..ControlCommand::refresh("p1", 1, None)
        };
        assert_eq!(h.dispatcher.handle(&message(refresh, 1)).await, Disposition::Drop);

        let build = ControlCommand {
            project_id: None,
            ..ControlCommand::build("p1")
        };
        assert_eq!(h.dispatcher.handle(&message(build, 1)).await, Disposition::Drop);
    }

    #[tokio::test]
    async fn handled_message_id_is_not_processed_twice() {
        let h = harness(DispatcherConfig::default());
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        let build = message(ControlCommand::build("p1"), 1);

        assert_eq!(h.dispatcher.handle(&build).await, Disposition::Ack);
        assert_eq!(h.dispatcher.handle(&build).await, Disposition::Ack);
        assert_eq!(h.fleet.submissions().len(), 1);
        assert_eq!(h.dispatcher.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn throttled_build_retries_then_exhausts() {
        let h = harness(DispatcherConfig {
            max_receive_count: 2,
            ..DispatcherConfig::default()
        });
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        h.fleet.throttle_next(100);

        let first = message(ControlCommand::build("p1"), 1);
        assert_eq!(h.dispatcher.handle(&first).await, Disposition::Retry);

        let second = ControlMessage {
            receive_count: 2,
            ..first
        };
        assert_eq!(h.dispatcher.handle(&second).await, Disposition::Drop);

        let index = h.store.get_index("p1", 1).await.unwrap().unwrap();
        assert_eq!(index.status, IndexStatus::Failed);
        let project = h.store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(project.last_build_status, BuildStatus::Failed);
    }

    #[tokio::test]
    async fn abandoned_build_is_failed_and_replaced() {
        let h = harness(DispatcherConfig {
            stale_build_after: Duration::from_secs(60),
            ..DispatcherConfig::default()
        });
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        let mut stuck = Index::building("p1", 1, IndexClass::Std);
        stuck.created_at = Utc::now() - chrono::Duration::minutes(5);
        stuck.job_id = Some(uuid::Uuid::new_v4());
        h.store.put_index(&stuck).await.unwrap();

        let build = message(ControlCommand::build("p1"), 1);
        assert_eq!(h.dispatcher.handle(&build).await, Disposition::Ack);

        let statuses: Vec<(Version, IndexStatus)> = h
            .store
            .list_indexes("p1")
            .await
            .unwrap()
            .into_iter()
            .map(|index| (index.version, index.status))
            .collect();
        assert_eq!(
            statuses,
            vec![(1, IndexStatus::Failed), (2, IndexStatus::Building)]
        );
    }

    #[tokio::test]
    async fn resched_emits_builds_for_due_projects() {
        let h = harness(DispatcherConfig::default());
        for id in ["p1", "p2"] {
            h.store
                .create_project(&Project::new(id, IndexClass::Std, 60))
                .await
                .unwrap();
        }
        h.store
            .record_build("p2", Some(Utc::now()), BuildStatus::Succeeded)
            .await
            .unwrap();

        let resched = message(ControlCommand::resched(), 1);
        assert_eq!(h.dispatcher.handle(&resched).await, Disposition::Ack);

        let emitted = h.queue.try_receive().unwrap();
        assert_eq!(emitted.message.command, ControlCommand::build("p1"));
        assert!(h.queue.try_receive().is_none());
    }

    #[tokio::test]
    async fn build_success_promotes_through_refresh() {
        let h = harness(DispatcherConfig::default());
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        h.dispatcher
            .handle(&message(ControlCommand::build("p1"), 1))
            .await;
        h.fleet.finish("p1", 1, JobState::Succeeded);
        h.dispatcher.orchestrator.monitor_once().await;

        let refresh = h.queue.try_receive().unwrap();
        assert_eq!(h.dispatcher.handle(&refresh.message).await, Disposition::Ack);

        let index = h.store.get_index("p1", 1).await.unwrap().unwrap();
        assert_eq!(index.status, IndexStatus::Ready);
        assert_eq!(
            h.dispatcher.fleet.current_version(IndexClass::Std, 1, "p1"),
            Some(1)
        );
        let project = h.store.get_project("p1").await.unwrap().unwrap();
        assert_eq!(project.last_build_status, BuildStatus::Succeeded);
    }

    #[tokio::test]
    async fn partial_refresh_retries_until_every_slot_loads() {
        let transport = Arc::new(BrokenSlots::default());
        transport.broken.lock().insert(1);
        let store = Arc::new(MemoryStore::new());
        let h = assemble(DispatcherConfig::default(), store.clone(), store, transport.clone());
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        h.store.put_index(&Index::building("p1", 1, IndexClass::Std)).await.unwrap();

        let first = message(ControlCommand::refresh("p1", 1, None), 1);
        assert_eq!(h.dispatcher.handle(&first).await, Disposition::Retry);
        let index = h.store.get_index("p1", 1).await.unwrap().unwrap();
        assert_eq!(index.status, IndexStatus::Ready);
        assert_eq!(h.dispatcher.fleet.current_version(IndexClass::Std, 0, "p1"), Some(1));
        assert_eq!(h.dispatcher.fleet.current_version(IndexClass::Std, 1, "p1"), None);

        transport.broken.lock().clear();
        let redelivered = ControlMessage {
            receive_count: 2,
            ..first
        };
        assert_eq!(h.dispatcher.handle(&redelivered).await, Disposition::Ack);
        for slot in 0..h.dispatcher.fleet.slot_count(IndexClass::Std) {
            assert_eq!(
                h.dispatcher.fleet.current_version(IndexClass::Std, slot, "p1"),
                Some(1)
            );
        }
        assert_eq!(h.dispatcher.stats().duplicates, 0);
    }

    #[tokio::test]
    async fn delete_during_slot_load_leaves_no_holders() {
        let transport = Arc::new(GatedLoads::new());
        let store = Arc::new(MemoryStore::new());
        let h = assemble(DispatcherConfig::default(), store.clone(), store, transport.clone());
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        h.store.put_index(&Index::building("p1", 1, IndexClass::Std)).await.unwrap();

        let dispatcher = Arc::new(h.dispatcher);
        let refresh = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .handle(&message(ControlCommand::refresh("p1", 1, None), 1))
                    .await
            }
        });
        transport.started.notified().await;

        let delete = message(ControlCommand::delete("p1"), 1);
        assert_eq!(dispatcher.handle(&delete).await, Disposition::Ack);
        assert!(dispatcher.fleet.holders("p1").is_empty());

        transport.gate.add_permits(dispatcher.fleet.slot_count(IndexClass::Std));
        assert_eq!(refresh.await.unwrap(), Disposition::Ack);

        assert!(h.store.get_tombstone("p1").await.unwrap().is_some());
        assert!(dispatcher.fleet.holders("p1").is_empty());
    }

    #[tokio::test]
    async fn delete_cancels_build_created_before_tombstone() {
        let memory = Arc::new(MemoryStore::new());
        let racing = Arc::new(RacingStore {
            inner: memory.clone(),
            late: Mutex::new(None),
        });
        let h = assemble(DispatcherConfig::default(), memory, racing.clone(), Arc::new(NoopTransport));
        h.store
            .create_project(&Project::new("p1", IndexClass::Std, 60))
            .await
            .unwrap();
        h.store.put_index(&Index::building("p1", 1, IndexClass::Std)).await.unwrap();
        h.store.promote("p1", 1).await.unwrap();

        // The competing build has reached the fleet but its row lands late.
        h.dispatcher
            .orchestrator
            .submit("p1", 2, IndexClass::Std)
            .await
            .unwrap();
        *racing.late.lock() = Some(Index::building("p1", 2, IndexClass::Std));

        let delete = message(ControlCommand::delete("p1"), 1);
        assert_eq!(h.dispatcher.handle(&delete).await, Disposition::Ack);

        assert_eq!(h.fleet.cancelled().len(), 1);
        assert!(h.store.list_indexes("p1").await.unwrap().is_empty());
        let tombstone = h.store.get_tombstone("p1").await.unwrap().unwrap();
        assert_eq!(tombstone.last_active_version, Some(1));
    }
}
