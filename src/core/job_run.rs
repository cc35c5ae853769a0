//! Job run entity.
//!
//! One row per dispatch attempt of a schedule. Runs sharing a `group_id`
//! form one retry sequence; the group length is the attempt count.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::clock::{now_rounded, Clock};
use super::types::{GroupId, JobRunId, ScheduleId};

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobRunStatus {
    /// Dispatched, waiting for a status callback.
    Waiting,
    /// Successfully processed.
    Succeed,
    /// Error during processing.
    Failed,
}

impl JobRunStatus {
    /// Stable string form used in storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobRunStatus::Waiting => "waiting",
            JobRunStatus::Succeed => "succeed",
            JobRunStatus::Failed => "failed",
        }
    }

    /// Parse the stable string form.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "waiting" => Some(JobRunStatus::Waiting),
            "succeed" => Some(JobRunStatus::Succeed),
            "failed" => Some(JobRunStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for JobRunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single dispatch attempt of a schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRun {
    /// Unique run identifier.
    pub id: JobRunId,
    /// Retry group this run belongs to.
    pub group_id: GroupId,
    /// Parent schedule.
    pub schedule_id: ScheduleId,
    /// Run status.
    pub status: JobRunStatus,
    /// Failure reason, set only on `failed`.
    pub reason: Option<String>,
    /// When the run was created.
    pub start_date: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub end_date: Option<DateTime<Utc>>,
}

impl JobRun {
    /// Create a new waiting run for a schedule.
    pub fn new(schedule_id: ScheduleId, group_id: GroupId, clock: &Clock) -> Self {
        Self {
            id: JobRunId::new(),
            group_id,
            schedule_id,
            status: JobRunStatus::Waiting,
            reason: None,
            start_date: now_rounded(clock),
            end_date: None,
        }
    }

    /// Mark the run as succeeded.
    pub fn succeed(&mut self, clock: &Clock) {
        self.status = JobRunStatus::Succeed;
        self.end_date = Some(now_rounded(clock));
    }

    /// Mark the run as failed with a reason.
    pub fn failed(&mut self, reason: impl Into<String>, clock: &Clock) {
        self.status = JobRunStatus::Failed;
        self.reason = Some(reason.into());
        self.end_date = Some(now_rounded(clock));
    }

    /// Whether the run has reached a terminal status. Terminal runs are
    /// append-only, the status path never mutates them again.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobRunStatus::Succeed | JobRunStatus::Failed)
    }
}
