//! Deterministic build fleet driven by the caller.
//!
//! Jobs stay SUBMITTED until [`ScriptedFleet::finish`] moves them, unless an
//! automatic outcome is configured. Used by tests and by `--dry-run`, where
//! the control plane runs end to end without launching builders.

use super::{BuildFleet, FleetJobStatus, JobDescriptor};
use crate::Version;
use crate::error::FleetError;
use crate::model::JobState;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
struct ScriptedJob {
    descriptor: JobDescriptor,
    status: FleetJobStatus,
}

#[derive(Debug, Default)]
struct ScriptedState {
    jobs: HashMap<String, ScriptedJob>,
    submissions: Vec<JobDescriptor>,
    cancelled: Vec<String>,
    throttle_remaining: u32,
    throttled_projects: HashSet<String>,
    auto_outcome: Option<JobState>,
    next_id: u64,
}

#[derive(Debug, Default)]
pub struct ScriptedFleet {
    state: Mutex<ScriptedState>,
}

impl ScriptedFleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job reaches `outcome` on its first poll.
    pub fn with_auto_outcome(outcome: JobState) -> Self {
        let fleet = Self::new();
        fleet.state.lock().auto_outcome = Some(outcome);
        fleet
    }

    /// Reject the next `count` submissions with `CapacityExceeded`.
    pub fn throttle_next(&self, count: u32) {
        self.state.lock().throttle_remaining = count;
    }

    /// Reject every submission for `project_id` with `CapacityExceeded`.
    pub fn throttle_project(&self, project_id: &str) {
        self.state.lock().throttled_projects.insert(project_id.to_string());
    }

    /// Move every job for `(project_id, version)` to `state`.
    pub fn finish(&self, project_id: &str, version: Version, state: JobState) -> usize {
        let mut scripted = self.state.lock();
        let mut moved = 0;
        for job in scripted.jobs.values_mut() {
            if job.descriptor.project_id == project_id && job.descriptor.version == version {
                job.status = FleetJobStatus {
                    state,
                    attempt: job.descriptor.retry_attempts.max(1),
                    reason: (state != JobState::Succeeded).then(|| format!("scripted {state}")),
                };
                moved += 1;
            }
        }
        moved
    }

    /// Descriptors accepted so far, in submission order.
    pub fn submissions(&self) -> Vec<JobDescriptor> {
        self.state.lock().submissions.clone()
    }

    /// Fleet job ids that received a cancel request.
    pub fn cancelled(&self) -> Vec<String> {
        self.state.lock().cancelled.clone()
    }
}

#[async_trait]
impl BuildFleet for ScriptedFleet {
    async fn submit(&self, descriptor: &JobDescriptor) -> Result<String, FleetError> {
        descriptor.validate()?;
        let mut state = self.state.lock();
        if state.throttle_remaining > 0 {
            state.throttle_remaining -= 1;
            return Err(FleetError::CapacityExceeded("scripted throttle".into()));
        }
        if state.throttled_projects.contains(&descriptor.project_id) {
            return Err(FleetError::CapacityExceeded(format!(
                "scripted throttle for {}",
                descriptor.project_id
            )));
        }

        state.next_id += 1;
        let fleet_job_id = format!("scripted-{}", state.next_id);
        state.submissions.push(descriptor.clone());
        state.jobs.insert(
            fleet_job_id.clone(),
            ScriptedJob {
                descriptor: descriptor.clone(),
                status: FleetJobStatus {
                    state: JobState::Submitted,
                    attempt: 0,
                    reason: None,
                },
            },
        );
        Ok(fleet_job_id)
    }

    async fn describe(&self, fleet_job_id: &str) -> Result<FleetJobStatus, FleetError> {
        let mut state = self.state.lock();
        let auto_outcome = state.auto_outcome;
        let job = state
            .jobs
            .get_mut(fleet_job_id)
            .ok_or_else(|| FleetError::UnknownJob(fleet_job_id.to_string()))?;
        if let Some(outcome) = auto_outcome {
            if !job.status.state.is_terminal() {
                job.status = FleetJobStatus {
                    state: outcome,
                    attempt: 1,
                    reason: None,
                };
            }
        }
        Ok(job.status.clone())
    }

    async fn cancel(&self, fleet_job_id: &str) -> Result<(), FleetError> {
        let mut state = self.state.lock();
        if !state.jobs.contains_key(fleet_job_id) {
            return Err(FleetError::UnknownJob(fleet_job_id.to_string()));
        }
        state.cancelled.push(fleet_job_id.to_string());
        Ok(())
    }
}
