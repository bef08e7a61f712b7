//! Build fleet that runs the builder command as a local subprocess.
//!
//! Each attempt acquires `vcpu` permits from a semaphore sized to the fleet's
//! vCPU ceiling, so jobs beyond the ceiling wait in line. Attempts that exit
//! non-zero or exceed the attempt timeout are retried until the descriptor's
//! attempt budget is spent.

use super::{BuildFleet, FleetJobStatus, JobDescriptor};
use crate::error::FleetError;
use crate::model::JobState;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt as _;
use tokio::process::Command;
use tokio::sync::{Semaphore, watch};

/// Bytes of stderr kept as the failure reason.
const STDERR_TAIL: usize = 2048;

struct LocalJob {
    status: FleetJobStatus,
    cancel: watch::Sender<bool>,
}

type JobMap = Arc<Mutex<HashMap<String, LocalJob>>>;

pub struct LocalFleet {
    permits: Arc<Semaphore>,
    max_vcpus: u32,
    max_queued_jobs: usize,
    jobs: JobMap,
}

impl std::fmt::Debug for LocalFleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFleet")
            .field("max_vcpus", &self.max_vcpus)
            .field("available_vcpus", &self.permits.available_permits())
            .field("jobs", &self.jobs.lock().len())
            .finish()
    }
}

impl LocalFleet {
    pub fn new(max_vcpus: u32, max_queued_jobs: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_vcpus as usize)),
            max_vcpus,
            max_queued_jobs,
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn active_jobs(&self) -> usize {
        self.jobs
            .lock()
            .values()
            .filter(|job| !job.status.state.is_terminal())
            .count()
    }
}

fn set_status(jobs: &JobMap, fleet_job_id: &str, status: FleetJobStatus) {
    if let Some(job) = jobs.lock().get_mut(fleet_job_id) {
        // A cancelled job keeps its terminal state.
        if !job.status.state.is_terminal() {
            job.status = status;
        }
    }
}

/// Resolves once the job is cancelled. Pending forever if the fleet dropped
/// the sender, so it never wins a select on its own.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

enum AttemptOutcome {
    Succeeded,
    Failed(String),
    TimedOut,
    Cancelled,
}

async fn run_attempt(
    descriptor: &JobDescriptor,
    attempt: u32,
    cancel: &mut watch::Receiver<bool>,
) -> AttemptOutcome {
    let (program, args) = match descriptor.command.split_first() {
        Some(parts) => parts,
        None => return AttemptOutcome::Failed("empty command".into()),
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .envs(descriptor.environment.iter().map(|(k, v)| (k, v)))
        .env("BUILD_ATTEMPT", attempt.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(volume) = &descriptor.mounted_volume {
        command.current_dir(volume);
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => return AttemptOutcome::Failed(format!("failed to spawn builder: {error}")),
    };

    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut captured = Vec::new();
        if let Some(mut stderr) = stderr {
            stderr.read_to_end(&mut captured).await.ok();
        }
        let start = captured.len().saturating_sub(STDERR_TAIL);
        String::from_utf8_lossy(&captured[start..]).trim().to_string()
    });

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) if status.success() => AttemptOutcome::Succeeded,
            Ok(status) => {
                let tail = stderr_task.await.unwrap_or_default();
                let code = status.code().unwrap_or(-1);
                return AttemptOutcome::Failed(if tail.is_empty() {
                    format!("builder exited with code {code}")
                } else {
                    format!("builder exited with code {code}: {tail}")
                });
            }
            Err(error) => AttemptOutcome::Failed(format!("failed to wait for builder: {error}")),
        },
        _ = tokio::time::sleep(descriptor.attempt_timeout) => {
            child.kill().await.ok();
            AttemptOutcome::TimedOut
        }
        _ = cancelled(cancel) => {
            child.kill().await.ok();
            AttemptOutcome::Cancelled
        }
    };
    stderr_task.abort();
    outcome
}

async fn run_job(
    fleet_job_id: String,
    descriptor: JobDescriptor,
    permits: Arc<Semaphore>,
    jobs: JobMap,
    mut cancel: watch::Receiver<bool>,
) {
    let mut last = (JobState::Failed, None);

    for attempt in 1..=descriptor.retry_attempts {
        let permit = tokio::select! {
            permit = permits.clone().acquire_many_owned(descriptor.vcpu) => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
            _ = cancelled(&mut cancel) => return,
        };

        set_status(
            &jobs,
            &fleet_job_id,
            FleetJobStatus {
                state: JobState::Running,
                attempt,
                reason: None,
            },
        );
        tracing::debug!(%fleet_job_id, job = %descriptor.name, attempt, "build attempt started");

        let outcome = run_attempt(&descriptor, attempt, &mut cancel).await;
        drop(permit);

        match outcome {
            AttemptOutcome::Succeeded => {
                set_status(
                    &jobs,
                    &fleet_job_id,
                    FleetJobStatus {
                        state: JobState::Succeeded,
                        attempt,
                        reason: None,
                    },
                );
                tracing::info!(%fleet_job_id, job = %descriptor.name, attempt, "build attempt succeeded");
                return;
            }
            AttemptOutcome::Cancelled => return,
            AttemptOutcome::TimedOut => {
                tracing::warn!(
                    %fleet_job_id,
                    job = %descriptor.name,
                    attempt,
                    timeout = ?descriptor.attempt_timeout,
                    "build attempt timed out"
                );
                last = (
                    JobState::TimedOut,
                    Some(format!("attempt timed out after {:?}", descriptor.attempt_timeout)),
                );
            }
            AttemptOutcome::Failed(reason) => {
                tracing::warn!(%fleet_job_id, job = %descriptor.name, attempt, %reason, "build attempt failed");
                last = (JobState::Failed, Some(reason));
            }
        }
    }

    let (state, reason) = last;
    set_status(
        &jobs,
        &fleet_job_id,
        FleetJobStatus {
            state,
            attempt: descriptor.retry_attempts,
            reason,
        },
    );
}

#[async_trait]
impl BuildFleet for LocalFleet {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, FleetError> {
        descriptor.validate()?;
        if descriptor.vcpu > self.max_vcpus {
            return Err(FleetError::InvalidDescriptor(format!(
                "{} requests {} vCPUs, fleet has {}",
                descriptor.name, descriptor.vcpu, self.max_vcpus
            )));
        }
        if self.active_jobs() >= self.max_queued_jobs {
            return Err(FleetError::CapacityExceeded(format!(
                "{} jobs already queued or running",
                self.max_queued_jobs
            )));
        }

        let fleet_job_id = format!("{}-{}", descriptor.name, uuid::Uuid::new_v4().simple());
        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.jobs.lock().insert(
            fleet_job_id.clone(),
            LocalJob {
                status: FleetJobStatus {
                    state: JobState::Submitted,
                    attempt: 0,
                    reason: None,
                },
                cancel: cancel_tx,
            },
        );

        tokio::spawn(run_job(
            fleet_job_id.clone(),
            descriptor.clone(),
            self.permits.clone(),
            self.jobs.clone(),
            cancel_rx,
        ));

        tracing::debug!(%fleet_job_id, image = %descriptor.image, "local build job queued");
        Ok(fleet_job_id)
    }

    async fn describe(&self, fleet_job_id: &str) -> Result<FleetJobStatus, FleetError> {
        self.jobs
            .lock()
            .get(fleet_job_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| FleetError::UnknownJob(fleet_job_id.to_string()))
    }

    async fn cancel(&self, fleet_job_id: &str) -> Result<(), FleetError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(fleet_job_id)
            .ok_or_else(|| FleetError::UnknownJob(fleet_job_id.to_string()))?;
        if !job.status.state.is_terminal() {
            job.status = FleetJobStatus {
                state: JobState::Failed,
                attempt: job.status.attempt,
                reason: Some("cancelled".into()),
            };
        }
        job.cancel.send_replace(true);
        Ok(())
    }
}
