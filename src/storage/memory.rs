//! In-memory storage implementation.
//!
//! Thread-safe backend for tests and local development. Data is not
//! persisted across restarts.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::{Storage, StorageError, RECENT_JOB_RUNS_LIMIT};
use crate::core::job_run::{JobRun, JobRunStatus};
use crate::core::schedule::{Schedule, ScheduleStatus};
use crate::core::types::{GroupId, JobRunId, ScheduleId};

/// In-memory storage backend.
pub struct InMemoryStorage {
    schedules: RwLock<HashMap<ScheduleId, Schedule>>,
    job_runs: RwLock<HashMap<JobRunId, JobRun>>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            schedules: RwLock::new(HashMap::new()),
            job_runs: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_schedule_by_id(&self, id: ScheduleId) -> Result<Option<Schedule>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(schedules.get(&id).cloned())
    }

    async fn get_awaiting_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut due: Vec<_> = schedules
            .values()
            .filter(|s| {
                s.status == ScheduleStatus::Waiting
                    && s.next_execution_date.is_some_and(|next| next <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_execution_date);
        Ok(due)
    }

    async fn get_schedules_paged(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Schedule>, StorageError> {
        let schedules = self
            .schedules
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut all: Vec<_> = schedules.values().cloned().collect();
        // last_execution_date descending, never-executed schedules last.
        all.sort_by(|a, b| b.last_execution_date.cmp(&a.last_execution_date));

        let offset = (page.saturating_sub(1) as usize) * page_size as usize;
        Ok(all
            .into_iter()
            .skip(offset)
            .take(page_size as usize)
            .collect())
    }

    async fn add(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if schedules.contains_key(&schedule.id) {
            return Err(StorageError::DuplicateKey(format!(
                "schedule: {}",
                schedule.id
            )));
        }
        if schedules.values().any(|s| s.job.slug == schedule.job.slug) {
            return Err(StorageError::DuplicateKey(format!(
                "job slug: {}",
                schedule.job.slug
            )));
        }
        schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let stored = schedules
            .get_mut(&schedule.id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", schedule.id)))?;
        stored.status = schedule.status;
        stored.group_id = schedule.group_id;
        stored.last_execution_date = schedule.last_execution_date;
        stored.next_execution_date = schedule.next_execution_date;
        Ok(())
    }

    async fn delete_schedule_by_id(&self, id: ScheduleId) -> Result<(), StorageError> {
        let mut schedules = self
            .schedules
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        schedules
            .remove(&id)
            .ok_or_else(|| StorageError::NotFound(format!("schedule: {}", id)))?;
        Ok(())
    }

    async fn add_job_run(&self, run: &JobRun) -> Result<(), StorageError> {
        let mut runs = self
            .job_runs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if runs.contains_key(&run.id) {
            return Err(StorageError::DuplicateKey(format!("job run: {}", run.id)));
        }
        runs.insert(run.id, run.clone());
        Ok(())
    }

    async fn update_job_run(&self, run: &JobRun) -> Result<(), StorageError> {
        let mut runs = self
            .job_runs
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let stored = runs
            .get_mut(&run.id)
            .ok_or_else(|| StorageError::NotFound(format!("job run: {}", run.id)))?;
        stored.status = run.status;
        stored.reason = run.reason.clone();
        stored.end_date = run.end_date;
        Ok(())
    }

    async fn get_job_run_group(
        &self,
        schedule_id: ScheduleId,
        group_id: GroupId,
    ) -> Result<Vec<JobRun>, StorageError> {
        let runs = self
            .job_runs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut group: Vec<_> = runs
            .values()
            .filter(|r| r.schedule_id == schedule_id && r.group_id == group_id)
            .cloned()
            .collect();
        group.sort_by_key(|r| r.start_date);
        Ok(group)
    }

    async fn get_recent_job_runs(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Vec<JobRun>, StorageError> {
        let runs = self
            .job_runs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        let mut recent: Vec<_> = runs
            .values()
            .filter(|r| r.schedule_id == schedule_id)
            .cloned()
            .collect();
        recent.sort_by(|a, b| b.start_date.cmp(&a.start_date));
        recent.truncate(RECENT_JOB_RUNS_LIMIT);
        recent.reverse();
        Ok(recent)
    }

    async fn get_stale_job_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError> {
        let runs = self
            .job_runs
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(runs
            .values()
            .filter(|r| r.status == JobRunStatus::Waiting && r.start_date < cutoff)
            .cloned()
            .collect())
    }
}
