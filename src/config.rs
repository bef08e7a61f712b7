//! Configuration loading and validation.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `INDEXPLANE__SECTION__KEY` environment variables (e.g.
//! `INDEXPLANE__QUEUE__WORKERS=8`).

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const ENV_PREFIX: &str = "INDEXPLANE";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub queue: QueueConfig,
    pub builder: BuilderConfig,
    pub fleet: FleetConfig,
    pub scheduler: SchedulerConfig,
    pub storage: StorageConfig,
    pub api: ApiConfig,
    pub log: LogConfig,
}

/// The `[queue]` section: control queue and dispatcher workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// How long a received message stays invisible. Also bounds each handler
    /// invocation and sizes the dedup window.
    pub visibility_timeout_secs: u64,
    /// Receive count at which a failing message is dead-lettered.
    pub max_receive_count: u32,
    pub workers: usize,
    /// Delay before a message released with `Retry` becomes visible again.
    pub retry_delay_secs: u64,
    /// Upper bound on remembered message ids.
    pub dedup_capacity: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout_secs: 900,
            max_receive_count: 5,
            workers: 4,
            retry_delay_secs: 10,
            dedup_capacity: 100_000,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// The `[builder]` section: build job descriptor and fleet limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Program and arguments run for each build attempt.
    pub command: Vec<String>,
    pub image: String,
    pub vcpu: u32,
    pub memory_mib: u64,
    pub ephemeral_storage_gib: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mounted_volume: Option<PathBuf>,
    /// Directory backing the blob store. Builders write artifacts under it
    /// so the dispatcher finds them at their key. Filled from
    /// `storage.data_dir` when the filesystem blob store is in use.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_root: Option<PathBuf>,
    /// Attempts per job before it is FAILED.
    pub retry_attempts: u32,
    pub attempt_timeout_secs: u64,
    /// Slack added to the worst-case job duration before a BUILDING row is
    /// treated as abandoned.
    pub failure_grace_secs: u64,
    /// vCPU ceiling of the build fleet.
    pub max_vcpus: u32,
    /// Jobs the fleet accepts beyond its running set before throttling.
    pub max_queued_jobs: usize,
    pub poll_interval_secs: u64,
    pub submit_max_attempts: u32,
    pub submit_base_delay_ms: u64,
    pub submit_max_delay_ms: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            command: vec!["index-builder".into()],
            image: "index-builder:latest".into(),
            vcpu: 4,
            memory_mib: 16_384,
            ephemeral_storage_gib: 100,
            mounted_volume: None,
            artifact_root: None,
            retry_attempts: 2,
            attempt_timeout_secs: 3600,
            failure_grace_secs: 60,
            max_vcpus: 64,
            max_queued_jobs: 256,
            poll_interval_secs: 10,
            submit_max_attempts: 5,
            submit_base_delay_ms: 500,
            submit_max_delay_ms: 30_000,
        }
    }
}

impl BuilderConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }

    /// Age after which a BUILDING row is considered abandoned.
    pub fn failure_timeout(&self) -> Duration {
        Duration::from_secs(
            self.attempt_timeout_secs * u64::from(self.retry_attempts.max(1))
                + self.failure_grace_secs,
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// The `[fleet]` section: query-serving slots per index class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub std_slots: usize,
    pub ia_slots: usize,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            std_slots: 4,
            ia_slots: 2,
        }
    }
}

/// A `[[scheduler.schedules]]` entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub name: String,
    /// Six-field cron expression, seconds first.
    pub cron: String,
    /// Pin the schedule to one project; emits `INDEX_BUILD` instead of
    /// `INDEX_RESCHED`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    /// Events that could not be delivered within this age are dropped.
    pub max_event_age_secs: u64,
    pub max_retry_attempts: u32,
    pub schedules: Vec<ScheduleConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_event_age_secs: 3600,
            max_retry_attempts: 3,
            schedules: vec![ScheduleConfig {
                name: "resched".into(),
                cron: "0 */5 * * * *".into(),
                project_id: None,
            }],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub data_dir: PathBuf,
    pub max_connections: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            data_dir: default_data_dir(),
            max_connections: 8,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|dir| dir.join("indexplane"))
        .unwrap_or_else(|| PathBuf::from(".indexplane"))
}

impl StorageConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("metadata.db")
    }

    pub fn blob_dir(&self) -> PathBuf {
        self.data_dir.join("blobs")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:19870".into(),
        }
    }
}

impl ApiConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.bind
            .parse()
            .with_context(|| format!("invalid api.bind address: {}", self.bind))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for daily rolling log files. Console only when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "indexplane=info".into(),
            directory: None,
            file_prefix: "indexplane.log".into(),
        }
    }
}

impl Config {
    /// Load from defaults, `path` (if given and present) and the environment.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(false),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: Config = builder
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(raw).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("failed to render configuration")
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.queue.visibility_timeout_secs > 0,
            "queue.visibility_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.queue.max_receive_count > 0,
            "queue.max_receive_count must be positive"
        );
        anyhow::ensure!(self.queue.workers > 0, "queue.workers must be positive");
        anyhow::ensure!(
            !self.builder.command.is_empty(),
            "builder.command must name a program"
        );
        anyhow::ensure!(
            self.builder.retry_attempts > 0,
            "builder.retry_attempts must be positive"
        );
        anyhow::ensure!(
            self.builder.attempt_timeout_secs > 0,
            "builder.attempt_timeout_secs must be positive"
        );
        anyhow::ensure!(
            self.builder.submit_max_attempts > 0,
            "builder.submit_max_attempts must be positive"
        );
        anyhow::ensure!(self.builder.vcpu > 0, "builder.vcpu must be positive");
        anyhow::ensure!(
            self.fleet.std_slots > 0 && self.fleet.ia_slots > 0,
            "fleet slot counts must be positive"
        );
        for schedule in &self.scheduler.schedules {
            cron::Schedule::from_str(&schedule.cron).with_context(|| {
                format!("invalid cron expression for schedule '{}'", schedule.name)
            })?;
        }
        if self.api.enabled {
            self.api.socket_addr()?;
        }
        Ok(())
    }
}
