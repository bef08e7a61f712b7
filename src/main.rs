//! Indexplane CLI: runs the control plane and talks to its API.

use indexplane::api::{self, ApiState};
use indexplane::blob::{BlobStore, FsBlobStore, MemoryBlobStore};
use indexplane::config::{Config, StorageBackend};
use indexplane::dispatcher::{CommandDispatcher, DispatcherConfig};
use indexplane::fleet::{FleetRegistry, NoopTransport};
use indexplane::model::{CommandType, ControlCommand, IndexClass, JobState};
use indexplane::orchestrator::{BuildFleet, BuildOrchestrator, LocalFleet, ScriptedFleet};
use indexplane::queue::ControlQueue;
use indexplane::scheduler::SchedulingTrigger;
use indexplane::store::{MemoryStore, MetadataStore, SqliteStore};
use indexplane::worker::WorkerPool;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "indexplane", version, about = "Control plane for per-project search indexes")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher, build monitor, scheduler and HTTP API
    Start {
        /// Complete every build immediately instead of launching builders
        #[arg(long)]
        dry_run: bool,
    },
    /// Enqueue a control command through a running instance
    Send {
        /// INDEX_BUILD, INDEX_RESCHED, INDEX_REFRESH or INDEX_DELETE
        kind: CommandType,
        project_id: Option<String>,
        #[arg(long)]
        version: Option<u64>,
        /// Base URL of the control API (defaults to the configured bind address)
        #[arg(long)]
        api: Option<String>,
    },
    /// Register a project with a running instance
    Register {
        project_id: String,
        #[arg(long, default_value = "STD")]
        index_class: IndexClass,
        /// Seconds between scheduled rebuilds
        #[arg(long, default_value_t = 3600)]
        interval: u64,
        #[arg(long)]
        api: Option<String>,
    },
    /// Print the effective configuration as TOML
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    match cli.command {
        Command::Start { dry_run } => {
            let _guard = indexplane::logging::init(&config.log)?;
            runtime.block_on(run(config, dry_run))
        }
        Command::Send {
            kind,
            project_id,
            version,
            api,
        } => {
            let command = ControlCommand {
                kind,
                project_id,
                version,
                job_id: None,
            };
            let base = api_base(&config, api);
            runtime.block_on(post(&base, "commands", &command))
        }
        Command::Register {
            project_id,
            index_class,
            interval,
            api,
        } => {
            let body = serde_json::json!({
                "project_id": project_id,
                "index_class": index_class,
                "build_interval_secs": interval,
            });
            let base = api_base(&config, api);
            runtime.block_on(post(&base, "projects", &body))
        }
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn api_base(config: &Config, api: Option<String>) -> String {
    api.unwrap_or_else(|| format!("http://{}/api", config.api.bind))
        .trim_end_matches('/')
        .to_string()
}

async fn post<T: serde::Serialize>(base: &str, path: &str, body: &T) -> anyhow::Result<()> {
    let url = format!("{base}/{path}");
    let response = reqwest::Client::new()
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to reach {url}"))?;

    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    anyhow::ensure!(status.is_success(), "{url} returned {status}: {text}");
    println!("{text}");
    Ok(())
}

async fn run(mut config: Config, dry_run: bool) -> anyhow::Result<()> {
    tracing::info!(
        backend = ?config.storage.backend,
        data_dir = %config.storage.data_dir.display(),
        dry_run,
        "starting indexplane"
    );

    let (store, blobs): (Arc<dyn MetadataStore>, Arc<dyn BlobStore>) = match config.storage.backend {
        StorageBackend::Sqlite => {
            std::fs::create_dir_all(&config.storage.data_dir).with_context(|| {
                format!("failed to create data dir {}", config.storage.data_dir.display())
            })?;
            let store = SqliteStore::connect(&config.storage.sqlite_path(), config.storage.max_connections)
                .await
                .context("failed to open metadata store")?;
            let blobs = FsBlobStore::open(config.storage.blob_dir())
                .await
                .context("failed to open blob store")?;
            let store: Arc<dyn MetadataStore> = Arc::new(store);
            let blobs: Arc<dyn BlobStore> = Arc::new(blobs);
            (store, blobs)
        }
        StorageBackend::Memory => {
            tracing::warn!("memory storage backend selected, state is lost on exit");
            let store: Arc<dyn MetadataStore> = Arc::new(MemoryStore::new());
            let blobs: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
            (store, blobs)
        }
    };

    if config.storage.backend == StorageBackend::Sqlite && config.builder.artifact_root.is_none() {
        config.builder.artifact_root = Some(config.storage.blob_dir());
    }

    let queue = Arc::new(ControlQueue::new(config.queue.visibility_timeout()));
    let fleet = Arc::new(FleetRegistry::new(
        config.fleet.std_slots,
        config.fleet.ia_slots,
        Arc::new(NoopTransport),
    ));
    let build_fleet: Arc<dyn BuildFleet> = if dry_run {
        Arc::new(ScriptedFleet::with_auto_outcome(JobState::Succeeded))
    } else {
        Arc::new(LocalFleet::new(
            config.builder.max_vcpus,
            config.builder.max_queued_jobs,
        ))
    };

    let orchestrator = Arc::new(BuildOrchestrator::new(
        build_fleet,
        store.clone(),
        queue.clone(),
        config.builder.clone(),
    ));
    let dispatcher = Arc::new(CommandDispatcher::new(
        store.clone(),
        blobs,
        orchestrator.clone(),
        fleet.clone(),
        queue.clone(),
        DispatcherConfig::from_config(&config),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Arc::new(WorkerPool::new(queue.clone(), dispatcher.clone(), &config.queue))
        .spawn(shutdown_rx.clone());
    handles.push(tokio::spawn(orchestrator.clone().run_monitor(shutdown_rx.clone())));

    if config.scheduler.enabled {
        let trigger = Arc::new(SchedulingTrigger::from_config(&config.scheduler, queue.clone())?);
        handles.push(tokio::spawn(trigger.run(shutdown_rx.clone())));
    }

    if config.api.enabled {
        let state = Arc::new(ApiState::new(
            queue.clone(),
            store,
            fleet,
            orchestrator,
            dispatcher,
        ));
        let bind = config.api.socket_addr()?;
        handles.push(api::start_http_server(bind, state, shutdown_rx.clone()).await?);
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    shutdown_tx.send(true).ok();
    queue.close();
    let drained = tokio::time::timeout(Duration::from_secs(30), futures::future::join_all(handles)).await;
    if drained.is_err() {
        tracing::warn!("background tasks did not stop within 30s");
    }

    let stats = queue.stats();
    tracing::info!(
        depth = stats.depth,
        in_flight = stats.in_flight,
        dead_letters = stats.dead_letters,
        "indexplane stopped"
    );
    Ok(())
}
