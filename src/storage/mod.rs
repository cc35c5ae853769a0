//! Storage abstraction for persisting schedules, jobs, and job runs.
//!
//! This module provides a trait-based storage abstraction with pluggable
//! backends (in-memory, PostgreSQL). Implementations guarantee strict
//! read-after-write for the engine's own writes.

mod memory;
mod postgres;

pub use memory::InMemoryStorage;
pub use postgres::PostgresStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::job_run::JobRun;
use crate::core::schedule::Schedule;
use crate::core::types::{GroupId, ScheduleId};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// A persisted row could not be mapped back to an entity.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Storage trait for the scheduler's durable state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Schedule operations

    /// Get a schedule by id, or `None` when absent.
    async fn get_schedule_by_id(&self, id: ScheduleId) -> Result<Option<Schedule>, StorageError>;

    /// Get all waiting schedules due at or before `now`, ordered by
    /// `next_execution_date` ascending.
    async fn get_awaiting_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, StorageError>;

    /// Get a page of schedules ordered by `last_execution_date` descending.
    /// `page` is 1-indexed. Admin API only.
    async fn get_schedules_paged(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Schedule>, StorageError>;

    /// Insert a schedule together with its job row, transactionally.
    async fn add(&self, schedule: &Schedule) -> Result<(), StorageError>;

    /// Persist the mutable schedule fields (`status`, `group_id`,
    /// `last_execution_date`, `next_execution_date`).
    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StorageError>;

    /// Delete a schedule and its job, transactionally.
    async fn delete_schedule_by_id(&self, id: ScheduleId) -> Result<(), StorageError>;

    // Job run operations

    /// Insert a job run.
    async fn add_job_run(&self, run: &JobRun) -> Result<(), StorageError>;

    /// Persist the mutable job run fields (`status`, `reason`, `end_date`).
    async fn update_job_run(&self, run: &JobRun) -> Result<(), StorageError>;

    /// Get the runs sharing a retry group, ordered by `start_date` ascending.
    async fn get_job_run_group(
        &self,
        schedule_id: ScheduleId,
        group_id: GroupId,
    ) -> Result<Vec<JobRun>, StorageError>;

    /// Get the latest (at most 5) runs of a schedule, chronologically
    /// ascending.
    async fn get_recent_job_runs(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Vec<JobRun>, StorageError>;

    /// Get runs still waiting whose `start_date` is before `cutoff`.
    async fn get_stale_job_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError>;
}

/// Number of runs returned by [`Storage::get_recent_job_runs`].
pub const RECENT_JOB_RUNS_LIMIT: usize = 5;
