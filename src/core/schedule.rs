//! Schedule entity and its state transitions.
//!
//! A schedule describes when a job fires and how its invocation is
//! delivered. The engine owns all mutations: the tick path moves a waiting
//! schedule to `scheduled`, the status path settles it back to `waiting`
//! (next occurrence or retry) or `finished`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::clock::{now_rounded, round_to_seconds, Clock};
use super::frequency::{Frequency, FrequencyError};
use super::retry::RetryPolicy;
use super::types::{GroupId, JobId, ScheduleId};

/// Status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    /// Waiting for `next_execution_date`.
    Waiting,
    /// Dispatched, waiting for a job status.
    Scheduled,
    /// Terminal, nothing left to fire.
    Finished,
}

impl ScheduleStatus {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Waiting => "waiting",
            ScheduleStatus::Scheduled => "scheduled",
            ScheduleStatus::Finished => "finished",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(ScheduleStatus::Waiting),
            "scheduled" => Some(ScheduleStatus::Scheduled),
            "finished" => Some(ScheduleStatus::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery mechanism bound to a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportType {
    /// Synchronous HTTP POST to the configured url.
    Http,
    /// Asynchronous publish to the message broker.
    Rabbitmq,
}

impl TransportType {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportType::Http => "http",
            TransportType::Rabbitmq => "rabbitmq",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(TransportType::Http),
            "rabbitmq" => Some(TransportType::Rabbitmq),
            _ => None,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport binding for a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfiguration {
    /// How dispatches reach the job handler.
    pub transport_type: TransportType,
    /// Target url, required for http, ignored for the broker.
    pub url: Option<String>,
}

/// The job a schedule dispatches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledJob {
    /// Unique job identifier.
    pub id: JobId,
    /// Routing key for the broker, passed through opaquely for http.
    pub slug: String,
    /// Optional free-form payload handed to the job handler.
    pub data: Option<Value>,
}

impl ScheduledJob {
    /// Create a new job with a fresh identifier.
    pub fn new(slug: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            id: JobId::new(),
            slug: slug.into(),
            data,
        }
    }
}

/// The durable unit of work declaration.
#[derive(Debug, Clone)]
pub struct Schedule {
    /// Unique schedule identifier.
    pub id: ScheduleId,
    /// Current retry group; rotates when the schedule advances to a fresh
    /// occurrence, so runs in one group count attempts for one fire.
    pub group_id: GroupId,
    /// Human-readable description.
    pub description: String,
    /// Parsed frequency; the raw expression is kept for persistence.
    pub frequency: Frequency,
    /// Current status.
    pub status: ScheduleStatus,
    /// Optional retry policy.
    pub retry_policy: Option<RetryPolicy>,
    /// Transport binding.
    pub configuration: ScheduleConfiguration,
    /// Optional explicit first-fire time.
    pub schedule_start: Option<DateTime<Utc>>,
    /// Last time the schedule was dispatched.
    pub last_execution_date: Option<DateTime<Utc>>,
    /// Next due time; set exactly when the status is `waiting`.
    pub next_execution_date: Option<DateTime<Utc>>,
    /// The job to dispatch.
    pub job: ScheduledJob,
}

impl Schedule {
    /// Create a new waiting schedule with its first execution computed from
    /// `schedule_start` (when given), or now for `once`, or the next cron
    /// occurrence.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        description: impl Into<String>,
        frequency: &str,
        job_slug: impl Into<String>,
        job_data: Option<Value>,
        retry_policy: Option<RetryPolicy>,
        configuration: ScheduleConfiguration,
        schedule_start: Option<DateTime<Utc>>,
        clock: &Clock,
    ) -> Result<Self, FrequencyError> {
        let frequency = Frequency::parse(frequency)?;
        let first = first_execution(&frequency, schedule_start, clock);

        Ok(Self {
            id: ScheduleId::new(),
            group_id: GroupId::new(),
            description: description.into(),
            frequency,
            status: ScheduleStatus::Waiting,
            retry_policy,
            configuration,
            schedule_start,
            last_execution_date: None,
            next_execution_date: Some(first),
            job: ScheduledJob::new(job_slug, job_data),
        })
    }

    /// Transition `waiting -> scheduled` when the tick claims the schedule.
    pub fn start(&mut self, clock: &Clock) {
        self.last_execution_date = Some(now_rounded(clock));
        self.next_execution_date = None;
        self.status = ScheduleStatus::Scheduled;
    }

    /// Settle a successful outcome: a recurring schedule advances to its
    /// next occurrence, a one-shot finishes.
    pub fn succeed(&mut self, clock: &Clock) {
        self.advance(clock);
    }

    /// Settle a failed outcome for the given 1-indexed attempt. Within the
    /// retry budget the schedule returns to `waiting` at the retry time;
    /// once the budget is spent it advances exactly like `succeed`, so an
    /// exhausted retry chain on a recurring schedule still reaches the next
    /// cron occurrence.
    pub fn failed(&mut self, attempt: u32, clock: &Clock) {
        if let Some(policy) = &self.retry_policy {
            if let Some(retry) = policy.next_execution_time(now_rounded(clock), attempt) {
                self.next_execution_date = Some(round_to_seconds(retry));
                self.status = ScheduleStatus::Waiting;
                return;
            }
        }

        self.advance(clock);
    }

    /// Move to the next occurrence, or finish when there is none. Advancing
    /// to a fresh occurrence starts a new retry group.
    fn advance(&mut self, clock: &Clock) {
        match self.frequency.next_after(now_rounded(clock)) {
            Some(next) => {
                self.next_execution_date = Some(next);
                self.status = ScheduleStatus::Waiting;
                self.group_id = GroupId::new();
            }
            None => {
                self.next_execution_date = None;
                self.status = ScheduleStatus::Finished;
            }
        }
    }
}

fn first_execution(
    frequency: &Frequency,
    schedule_start: Option<DateTime<Utc>>,
    clock: &Clock,
) -> DateTime<Utc> {
    if let Some(start) = schedule_start {
        return round_to_seconds(start);
    }

    let now = now_rounded(clock);
    frequency.next_after(now).unwrap_or(now)
}
