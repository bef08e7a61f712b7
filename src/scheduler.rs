//! Scheduling trigger: cron schedules that put commands on the control queue.
//!
//! The default schedule emits `INDEX_RESCHED`, which the dispatcher expands
//! into one `INDEX_BUILD` per due project. A schedule pinned to a project
//! emits `INDEX_BUILD` for it directly.

use crate::MessageId;
use crate::config::SchedulerConfig;
use crate::model::ControlCommand;
use crate::queue::CommandPublisher;
use crate::retry::Backoff;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct NamedSchedule {
    pub name: String,
    schedule: cron::Schedule,
    pub command: ControlCommand,
}

impl NamedSchedule {
    pub fn new(name: impl Into<String>, expression: &str, command: ControlCommand) -> anyhow::Result<Self> {
        let name = name.into();
        let schedule = cron::Schedule::from_str(expression)
            .with_context(|| format!("invalid cron expression for schedule '{name}'"))?;
        Ok(Self {
            name,
            schedule,
            command,
        })
    }

    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(after).next()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireOutcome {
    Sent(MessageId),
    /// The event aged out before it could be delivered.
    Expired,
    Failed,
}

pub struct SchedulingTrigger {
    schedules: Vec<NamedSchedule>,
    publisher: Arc<dyn CommandPublisher>,
    max_event_age: Duration,
    max_retry_attempts: u32,
    retry_base: Duration,
    retry_max: Duration,
}

impl std::fmt::Debug for SchedulingTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingTrigger")
            .field("schedules", &self.schedules)
            .field("max_event_age", &self.max_event_age)
            .field("max_retry_attempts", &self.max_retry_attempts)
            .finish()
    }
}

impl SchedulingTrigger {
    pub fn new(
        schedules: Vec<NamedSchedule>,
        publisher: Arc<dyn CommandPublisher>,
        max_event_age: Duration,
        max_retry_attempts: u32,
    ) -> Self {
        Self {
            schedules,
            publisher,
            max_event_age,
            max_retry_attempts,
            retry_base: Duration::from_secs(1),
            retry_max: Duration::from_secs(60),
        }
    }

    pub fn from_config(config: &SchedulerConfig, publisher: Arc<dyn CommandPublisher>) -> anyhow::Result<Self> {
        let schedules = config
            .schedules
            .iter()
            .map(|entry| {
                let command = match &entry.project_id {
                    Some(project_id) => ControlCommand::build(project_id.clone()),
                    None => ControlCommand::resched(),
                };
                NamedSchedule::new(entry.name.clone(), &entry.cron, command)
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self::new(
            schedules,
            publisher,
            Duration::from_secs(config.max_event_age_secs),
            config.max_retry_attempts,
        ))
    }

    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max;
        self
    }

    pub fn schedules(&self) -> &[NamedSchedule] {
        &self.schedules
    }

    /// Earliest upcoming firing across all schedules.
    pub fn next_fire(&self, after: &DateTime<Utc>) -> Option<(usize, DateTime<Utc>)> {
        self.schedules
            .iter()
            .enumerate()
            .filter_map(|(index, schedule)| schedule.next_after(after).map(|at| (index, at)))
            .min_by_key(|(_, at)| *at)
    }

    /// Deliver one event, retrying failed sends. Gives up after
    /// `max_retry_attempts` retries or once the event is older than
    /// `max_event_age`.
    pub async fn fire(&self, schedule: &NamedSchedule, emitted_at: Instant) -> FireOutcome {
        let mut backoff = Backoff::new(self.retry_base, self.retry_max);
        let mut attempt = 0;
        loop {
            if emitted_at.elapsed() > self.max_event_age {
                tracing::warn!(
                    schedule = %schedule.name,
                    age = ?emitted_at.elapsed(),
                    "scheduled event exceeded max age, dropping"
                );
                return FireOutcome::Expired;
            }

            attempt += 1;
            match self.publisher.publish(schedule.command.clone()).await {
                Ok(message_id) => {
                    tracing::info!(
                        schedule = %schedule.name,
                        kind = %schedule.command.kind,
                        %message_id,
                        "scheduled command sent"
                    );
                    return FireOutcome::Sent(message_id);
                }
                Err(error) if attempt > self.max_retry_attempts => {
                    tracing::error!(
                        schedule = %schedule.name,
                        attempts = attempt,
                        %error,
                        "scheduled command could not be sent"
                    );
                    return FireOutcome::Failed;
                }
                Err(error) => {
                    tracing::warn!(schedule = %schedule.name, attempt, %error, "scheduled send failed, retrying");
                    tokio::time::sleep(backoff.next_delay()).await;
                }
            }
        }
    }

    /// Fire schedules until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if self.schedules.is_empty() {
            tracing::info!("no schedules configured, scheduling trigger idle");
            return;
        }
        tracing::info!(schedules = self.schedules.len(), "scheduling trigger started");

        let mut cursor = Utc::now();
        loop {
            let now = Utc::now();
            let Some((index, at)) = self.next_fire(&cursor.max(now)) else {
                tracing::warn!("no upcoming schedule firings, scheduling trigger stopping");
                return;
            };
            let wait = (at - now).to_std().unwrap_or_default();

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.wait_for(|stop| *stop) => break,
            }
            cursor = at;

            let trigger = self.clone();
            tokio::spawn(async move {
                let schedule = &trigger.schedules[index];
                trigger.fire(schedule, Instant::now()).await;
            });
        }
        tracing::info!("scheduling trigger stopped");
    }
}
