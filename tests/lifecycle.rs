//! End-to-end lifecycle scenarios: commands flow through the control queue,
//! the worker pool and the dispatcher against in-memory backends.

use indexplane::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use indexplane::config::{BuilderConfig, QueueConfig};
use indexplane::dispatcher::{CommandDispatcher, Disposition, DispatcherConfig};
use indexplane::error::BlobError;
use indexplane::fleet::{FleetRegistry, NoopTransport};
use indexplane::model::{
    BuildStatus, ControlCommand, ControlMessage, Index, IndexClass, IndexStatus, JobState, Project,
};
use indexplane::orchestrator::{BuildOrchestrator, LocalFleet, ScriptedFleet};
use indexplane::queue::ControlQueue;
use indexplane::store::{MemoryStore, MetadataStore};
use indexplane::worker::WorkerPool;

use std::sync::Arc;
use std::time::Duration;

struct World {
    store: Arc<MemoryStore>,
    blobs: Arc<MemoryBlobStore>,
    builds: Arc<ScriptedFleet>,
    fleet: Arc<FleetRegistry>,
    queue: Arc<ControlQueue>,
    orchestrator: Arc<BuildOrchestrator>,
    dispatcher: Arc<CommandDispatcher>,
    workers: WorkerPool,
}

impl World {
    fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let blobs = Arc::new(MemoryBlobStore::new());
        let builds = Arc::new(ScriptedFleet::new());
        let fleet = Arc::new(FleetRegistry::new(3, 2, Arc::new(NoopTransport)));
        let queue = Arc::new(ControlQueue::new(Duration::from_secs(60)));
        let orchestrator = Arc::new(BuildOrchestrator::new(
            builds.clone(),
            store.clone(),
            queue.clone(),
            BuilderConfig::default(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            store.clone(),
            blobs.clone(),
            orchestrator.clone(),
            fleet.clone(),
            queue.clone(),
            DispatcherConfig::default(),
        ));
        let workers = WorkerPool::new(queue.clone(), dispatcher.clone(), &QueueConfig::default());

        Self {
            store,
            blobs,
            builds,
            fleet,
            queue,
            orchestrator,
            dispatcher,
            workers,
        }
    }

    async fn register(&self, project_id: &str, index_class: IndexClass) {
        assert!(
            self.store
                .create_project(&Project::new(project_id, index_class, 3600))
                .await
                .unwrap()
        );
    }

    /// Finish the build of `version`, report it and drain the resulting refresh.
    async fn complete(&self, project_id: &str, version: u64, state: JobState) {
        assert_eq!(self.builds.finish(project_id, version, state), 1);
        self.orchestrator.monitor_once().await;
        self.workers.drain().await;
    }

    async fn statuses(&self, project_id: &str) -> Vec<(u64, IndexStatus)> {
        self.store
            .list_indexes(project_id)
            .await
            .unwrap()
            .into_iter()
            .map(|index| (index.version, index.status))
            .collect()
    }

    async fn ready_count(&self, project_id: &str) -> usize {
        self.statuses(project_id)
            .await
            .iter()
            .filter(|(_, status)| *status == IndexStatus::Ready)
            .count()
    }
}

fn message(command: ControlCommand) -> ControlMessage {
    ControlMessage {
        message_id: uuid::Uuid::new_v4().to_string(),
        command,
        receive_count: 1,
        sent_at: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn first_build_becomes_ready_on_every_slot() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;

    world.queue.send(&ControlCommand::build("p1")).unwrap();
    assert_eq!(world.workers.drain().await, 1);
    assert_eq!(world.statuses("p1").await, vec![(1, IndexStatus::Building)]);

    let submitted = world.builds.submissions();
    assert_eq!(submitted.len(), 1);
    assert!(
        submitted[0]
            .environment
            .contains(&("ARTIFACT_PREFIX".to_string(), "p1/1".to_string()))
    );

    world.complete("p1", 1, JobState::Succeeded).await;

    assert_eq!(world.statuses("p1").await, vec![(1, IndexStatus::Ready)]);
    for slot in world.fleet.slots(IndexClass::Std) {
        assert_eq!(slot.loaded_version("p1"), Some(1));
    }
    assert!(world.fleet.slots(IndexClass::Ia).iter().all(|slot| slot.loaded.is_empty()));

    let project = world.store.get_project("p1").await.unwrap().unwrap();
    assert_eq!(project.last_build_status, BuildStatus::Succeeded);
    assert!(project.last_build_at.is_some());
}

#[tokio::test]
async fn redelivered_build_creates_one_version() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;

    for _ in 0..5 {
        world.queue.send(&ControlCommand::build("p1")).unwrap();
    }
    assert_eq!(world.workers.drain().await, 5);

    assert_eq!(world.statuses("p1").await, vec![(1, IndexStatus::Building)]);
    assert_eq!(world.builds.submissions().len(), 1);
    assert_eq!(world.queue.stats().dead_letters, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_builds_on_ready_project_claim_one_version() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;
    world.store.put_index(&Index::building("p1", 3, IndexClass::Std)).await.unwrap();
    world.store.promote("p1", 3).await.unwrap();

    let handles: Vec<_> = (0..2)
        .map(|_| {
            let dispatcher = world.dispatcher.clone();
            tokio::spawn(async move { dispatcher.handle(&message(ControlCommand::build("p1"))).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Disposition::Ack);
    }

    assert_eq!(
        world.statuses("p1").await,
        vec![(3, IndexStatus::Ready), (4, IndexStatus::Building)]
    );
    assert_eq!(world.builds.submissions().len(), 1);
    assert_eq!(world.ready_count("p1").await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_refreshes_leave_one_ready_version() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;
    for version in 1..=3 {
        world
            .store
            .put_index(&Index::building("p1", version, IndexClass::Std))
            .await
            .unwrap();
    }

    let handles: Vec<_> = [1, 2, 3, 3, 2, 1]
        .into_iter()
        .map(|version| {
            let dispatcher = world.dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .handle(&message(ControlCommand::refresh("p1", version, None)))
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap(), Disposition::Ack);
    }

    assert_eq!(world.ready_count("p1").await, 1);
    let statuses = world.statuses("p1").await;
    assert_eq!(statuses[2], (3, IndexStatus::Ready));
    for slot in world.fleet.slots(IndexClass::Std) {
        assert_eq!(slot.loaded_version("p1"), Some(3));
    }
}

#[tokio::test]
async fn failed_build_keeps_previous_ready_version() {
    let world = World::new();
    world.register("p1", IndexClass::Ia).await;

    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    world.complete("p1", 1, JobState::Succeeded).await;

    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    world.complete("p1", 2, JobState::Failed).await;

    assert_eq!(
        world.statuses("p1").await,
        vec![(1, IndexStatus::Ready), (2, IndexStatus::Failed)]
    );
    for slot in world.fleet.slots(IndexClass::Ia) {
        assert_eq!(slot.loaded_version("p1"), Some(1));
    }
    let project = world.store.get_project("p1").await.unwrap().unwrap();
    assert_eq!(project.last_build_status, BuildStatus::Failed);

    // The next build claims a fresh version rather than reusing the failed one.
    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    assert_eq!(world.statuses("p1").await.last(), Some(&(3, IndexStatus::Building)));
}

#[tokio::test]
async fn duplicate_deletes_leave_one_tombstone_and_no_slots() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;
    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    world.complete("p1", 1, JobState::Succeeded).await;
    world.blobs.put("p1/1/index.bin", b"segments".to_vec()).await.unwrap();
    world.blobs.put("p10/1/index.bin", b"other".to_vec()).await.unwrap();

    for _ in 0..3 {
        world.queue.send(&ControlCommand::delete("p1")).unwrap();
    }
    assert_eq!(world.workers.drain().await, 3);

    let tombstone = world.store.get_tombstone("p1").await.unwrap().unwrap();
    assert_eq!(tombstone.last_active_version, Some(1));
    assert!(world.fleet.holders("p1").is_empty());
    assert!(world.store.list_indexes("p1").await.unwrap().is_empty());
    assert!(world.blobs.keys("p1/").is_empty());
    assert_eq!(world.blobs.keys("p10/").len(), 1);
    assert_eq!(world.queue.stats().dead_letters, 0);

    // Builds for a deleted project are acknowledged and ignored.
    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    assert!(world.store.list_indexes("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn delete_during_build_cancels_and_ignores_late_success() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;
    world.store.put_index(&Index::building("p1", 3, IndexClass::Std)).await.unwrap();
    world.store.promote("p1", 3).await.unwrap();

    world.queue.send(&ControlCommand::build("p1")).unwrap();
    world.workers.drain().await;
    assert_eq!(world.statuses("p1").await.last(), Some(&(4, IndexStatus::Building)));

    world.queue.send(&ControlCommand::delete("p1")).unwrap();
    world.workers.drain().await;
    assert_eq!(world.builds.cancelled().len(), 1);

    world.builds.finish("p1", 4, JobState::Succeeded);
    world.orchestrator.monitor_once().await;
    assert!(world.queue.try_receive().is_none());

    // A refresh that was already queued is ignored as well.
    world.queue.send(&ControlCommand::refresh("p1", 4, None)).unwrap();
    world.workers.drain().await;

    assert_eq!(world.ready_count("p1").await, 0);
    assert!(world.fleet.holders("p1").is_empty());
    let tombstone = world.store.get_tombstone("p1").await.unwrap().unwrap();
    assert_eq!(tombstone.last_active_version, Some(3));
}

#[tokio::test]
async fn resched_fans_out_to_due_projects() {
    let world = World::new();
    world.register("p1", IndexClass::Std).await;
    world.register("p2", IndexClass::Ia).await;
    world
        .store
        .record_build("p2", Some(chrono::Utc::now()), BuildStatus::Succeeded)
        .await
        .unwrap();

    world.queue.send(&ControlCommand::resched()).unwrap();
    // The sweep plus the build it emits.
    assert_eq!(world.workers.drain().await, 2);

    assert_eq!(world.statuses("p1").await, vec![(1, IndexStatus::Building)]);
    assert!(world.store.list_indexes("p2").await.unwrap().is_empty());
}

#[tokio::test]
async fn unparseable_messages_are_dead_lettered() {
    let world = World::new();
    world.queue.send_raw("{not json").unwrap();
    world.queue.send(&ControlCommand::build("p1")).unwrap();

    world.workers.drain().await;
    let dead = world.queue.dead_letters();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].body, "{not json");
    assert_eq!(world.dispatcher.stats().acked, 1);
}

#[tokio::test]
async fn local_builder_writes_artifacts_into_the_blob_store() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("blobs");
    let store = Arc::new(MemoryStore::new());
    let blobs = Arc::new(FsBlobStore::open(&root).await.unwrap());
    let fleet = Arc::new(FleetRegistry::new(2, 1, Arc::new(NoopTransport)));
    let queue = Arc::new(ControlQueue::new(Duration::from_secs(60)));
    let config = BuilderConfig {
        command: vec![
            "sh".into(),
            "-c".into(),
            r#"mkdir -p "$ARTIFACT_DIR" && printf segments > "$ARTIFACT_DIR/index.bin""#.into(),
        ],
        vcpu: 1,
        artifact_root: Some(root.clone()),
        ..BuilderConfig::default()
    };
    let orchestrator = Arc::new(BuildOrchestrator::new(
        Arc::new(LocalFleet::new(4, 4)),
        store.clone(),
        queue.clone(),
        config,
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        blobs.clone(),
        orchestrator.clone(),
        fleet.clone(),
        queue.clone(),
        DispatcherConfig::default(),
    ));
    let workers = WorkerPool::new(queue.clone(), dispatcher, &QueueConfig::default());
    store
        .create_project(&Project::new("p1", IndexClass::Std, 3600))
        .await
        .unwrap();

    queue.send(&ControlCommand::build("p1")).unwrap();
    workers.drain().await;

    let mut reported = 0;
    for _ in 0..200 {
        reported = orchestrator.monitor_once().await;
        if reported > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(reported, 1, "build never finished");
    workers.drain().await;

    let index = store.get_index("p1", 1).await.unwrap().unwrap();
    assert_eq!(index.status, IndexStatus::Ready);
    let artifact = blobs
        .get(&format!("{}/index.bin", index.artifact_location))
        .await
        .unwrap();
    assert_eq!(artifact, b"segments");

    queue.send(&ControlCommand::delete("p1")).unwrap();
    workers.drain().await;
    assert!(matches!(
        blobs.get("p1/1/index.bin").await,
        Err(BlobError::NotFound(_))
    ));
    assert!(fleet.holders("p1").is_empty());
}
