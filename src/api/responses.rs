//! API request and response DTOs.
//!
//! All external JSON is camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::core::job_run::{JobRun, JobRunStatus};
use crate::core::retry::RetryPolicy;
use crate::core::schedule::{Schedule, ScheduleStatus};
use crate::core::types::{GroupId, JobId, JobRunId, ScheduleId};

/// Body of `POST /api/v1/schedules`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateScheduleRequest {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub frequency: String,
    pub job: Option<JobConfigurationDto>,
    pub retry_policy: Option<RetryPolicyDto>,
    pub schedule_start: Option<DateTime<Utc>>,
    pub configuration: Option<ScheduleConfigurationDto>,
}

/// Job part of the create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobConfigurationDto {
    #[serde(default)]
    pub slug: String,
    pub data: Option<Value>,
}

/// Transport binding part of the create request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleConfigurationDto {
    #[serde(default)]
    pub transport_type: String,
    pub url: Option<String>,
}

/// Retry policy in wire form; strategy stays a string so validation owns
/// the rejection message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicyDto {
    pub strategy: String,
    pub count: u32,
    pub interval: String,
}

impl From<&RetryPolicy> for RetryPolicyDto {
    fn from(policy: &RetryPolicy) -> Self {
        Self {
            strategy: policy.strategy().as_str().to_string(),
            count: policy.count(),
            interval: policy.interval_str(),
        }
    }
}

/// Body of the create response.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateScheduleResponse {
    pub id: ScheduleId,
}

/// One schedule in the paged list.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDto {
    pub id: ScheduleId,
    pub description: String,
    pub frequency: String,
    pub status: ScheduleStatus,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub next_execution_date: Option<DateTime<Utc>>,
    pub job: JobDto,
}

/// Job summary in list and detail responses.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDto {
    pub id: JobId,
    pub slug: String,
    pub data: Option<Value>,
}

impl From<&Schedule> for ScheduleDto {
    fn from(schedule: &Schedule) -> Self {
        Self {
            id: schedule.id,
            description: schedule.description.clone(),
            frequency: schedule.frequency.expression().to_string(),
            status: schedule.status,
            last_execution_date: schedule.last_execution_date,
            next_execution_date: schedule.next_execution_date,
            job: JobDto {
                id: schedule.job.id,
                slug: schedule.job.slug.clone(),
                data: schedule.job.data.clone(),
            },
        }
    }
}

/// Detail response for one schedule, including its recent runs grouped by
/// retry group.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleDetailsDto {
    pub id: ScheduleId,
    pub group_id: GroupId,
    pub description: String,
    pub frequency: String,
    pub status: ScheduleStatus,
    pub retry_policy: Option<RetryPolicyDto>,
    pub last_execution_date: Option<DateTime<Utc>>,
    pub next_execution_date: Option<DateTime<Utc>>,
    pub job: JobDto,
    pub recent_job_runs: HashMap<GroupId, Vec<JobRunDto>>,
}

/// One job run in the detail response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRunDto {
    pub id: JobRunId,
    pub status: JobRunStatus,
    pub reason: Option<String>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
}

impl From<&JobRun> for JobRunDto {
    fn from(run: &JobRun) -> Self {
        Self {
            id: run.id,
            status: run.status,
            reason: run.reason.clone(),
            start_date: run.start_date,
            end_date: run.end_date,
        }
    }
}

impl ScheduleDetailsDto {
    /// Assemble the detail DTO from a schedule and its recent runs.
    pub fn from_parts(schedule: &Schedule, recent_runs: &[JobRun]) -> Self {
        let mut recent_job_runs: HashMap<GroupId, Vec<JobRunDto>> = HashMap::new();
        for run in recent_runs {
            recent_job_runs
                .entry(run.group_id)
                .or_default()
                .push(JobRunDto::from(run));
        }

        Self {
            id: schedule.id,
            group_id: schedule.group_id,
            description: schedule.description.clone(),
            frequency: schedule.frequency.expression().to_string(),
            status: schedule.status,
            retry_policy: schedule.retry_policy.as_ref().map(RetryPolicyDto::from),
            last_execution_date: schedule.last_execution_date,
            next_execution_date: schedule.next_execution_date,
            job: JobDto {
                id: schedule.job.id,
                slug: schedule.job.slug.clone(),
                data: schedule.job.data.clone(),
            },
            recent_job_runs,
        }
    }
}
