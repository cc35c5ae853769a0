//! PostgreSQL storage implementation.
//!
//! Persistent storage using sqlx with automatic schema application at
//! startup. Schedule + job inserts and deletes are transactional.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use uuid::Uuid;

use super::{Storage, StorageError, RECENT_JOB_RUNS_LIMIT};
use crate::core::frequency::Frequency;
use crate::core::job_run::{JobRun, JobRunStatus};
use crate::core::retry::parse_stored_policy;
use crate::core::schedule::{
    Schedule, ScheduleConfiguration, ScheduleStatus, ScheduledJob, TransportType,
};
use crate::core::types::{GroupId, JobId, JobRunId, ScheduleId};

/// PostgreSQL storage backend.
pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    /// Connect to the database and apply the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(16)
            .connect(connection_string)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        let storage = Self { pool };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Create a storage over an existing pool (useful for tests).
    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        let schema = include_str!("../../migrations/001_initial_schema.sql");
        sqlx::raw_sql(schema)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(format!("migration failed: {}", e)))?;
        Ok(())
    }

    /// Close the database connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(FromRow)]
struct ScheduleRow {
    id: Uuid,
    group_id: Uuid,
    description: String,
    status: String,
    frequency: String,
    schedule_start: Option<DateTime<Utc>>,
    retry_policy_strategy: Option<String>,
    retry_policy_count: Option<i32>,
    retry_policy_interval: Option<String>,
    transport_type: String,
    url: Option<String>,
    last_execution_date: Option<DateTime<Utc>>,
    next_execution_date: Option<DateTime<Utc>>,
    job_id: Uuid,
    job_slug: String,
    job_data: Option<serde_json::Value>,
}

const SCHEDULE_SELECT: &str = r#"
    SELECT s.id, s.group_id, s.description, s.status, s.frequency, s.schedule_start,
           s.retry_policy_strategy, s.retry_policy_count, s.retry_policy_interval,
           s.transport_type, s.url, s.last_execution_date, s.next_execution_date,
           j.id AS job_id, j.slug AS job_slug, j.data_json AS job_data
    FROM schedules AS s
    JOIN jobs AS j ON j.schedule_id = s.id
"#;

impl TryFrom<ScheduleRow> for Schedule {
    type Error = StorageError;

    fn try_from(row: ScheduleRow) -> Result<Self, StorageError> {
        let frequency = Frequency::parse(row.frequency)
            .map_err(|e| StorageError::Serialization(e.to_string()))?;

        let status = ScheduleStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown schedule status: {}", row.status))
        })?;

        let transport_type = TransportType::parse(&row.transport_type).ok_or_else(|| {
            StorageError::Serialization(format!("unknown transport type: {}", row.transport_type))
        })?;

        let retry_policy = match (
            row.retry_policy_strategy,
            row.retry_policy_count,
            row.retry_policy_interval,
        ) {
            (Some(strategy), Some(count), Some(interval)) => Some(
                parse_stored_policy(&strategy, count, &interval)
                    .map_err(|e| StorageError::Serialization(e.to_string()))?,
            ),
            _ => None,
        };

        Ok(Schedule {
            id: ScheduleId::from_uuid(row.id),
            group_id: GroupId::from_uuid(row.group_id),
            description: row.description,
            frequency,
            status,
            retry_policy,
            configuration: ScheduleConfiguration {
                transport_type,
                url: row.url,
            },
            schedule_start: row.schedule_start,
            last_execution_date: row.last_execution_date,
            next_execution_date: row.next_execution_date,
            job: ScheduledJob {
                id: JobId::from_uuid(row.job_id),
                slug: row.job_slug,
                data: row.job_data,
            },
        })
    }
}

#[derive(FromRow)]
struct JobRunRow {
    id: Uuid,
    group_id: Uuid,
    schedule_id: Uuid,
    status: String,
    reason: Option<String>,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
}

impl TryFrom<JobRunRow> for JobRun {
    type Error = StorageError;

    fn try_from(row: JobRunRow) -> Result<Self, StorageError> {
        let status = JobRunStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Serialization(format!("unknown job run status: {}", row.status))
        })?;

        Ok(JobRun {
            id: JobRunId::from_uuid(row.id),
            group_id: GroupId::from_uuid(row.group_id),
            schedule_id: ScheduleId::from_uuid(row.schedule_id),
            status,
            reason: row.reason,
            start_date: row.start_date,
            end_date: row.end_date,
        })
    }
}

fn map_sqlx_error(e: sqlx::Error, context: &str) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::DuplicateKey(context.to_string())
        }
        _ => StorageError::Other(e.to_string()),
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn get_schedule_by_id(&self, id: ScheduleId) -> Result<Option<Schedule>, StorageError> {
        let row: Option<ScheduleRow> =
            sqlx::query_as(&format!("{} WHERE s.id = $1", SCHEDULE_SELECT))
                .bind(id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Other(e.to_string()))?;

        row.map(Schedule::try_from).transpose()
    }

    async fn get_awaiting_schedules(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Schedule>, StorageError> {
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "{} WHERE s.status = 'waiting' AND s.next_execution_date <= $1 \
             ORDER BY s.next_execution_date ASC",
            SCHEDULE_SELECT
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn get_schedules_paged(
        &self,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<Schedule>, StorageError> {
        let offset = i64::from(page.saturating_sub(1)) * i64::from(page_size);
        let rows: Vec<ScheduleRow> = sqlx::query_as(&format!(
            "{} ORDER BY s.last_execution_date DESC NULLS LAST LIMIT $1 OFFSET $2",
            SCHEDULE_SELECT
        ))
        .bind(i64::from(page_size))
        .bind(offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(Schedule::try_from).collect()
    }

    async fn add(&self, schedule: &Schedule) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO schedules (id, group_id, description, status, frequency, schedule_start,
                retry_policy_strategy, retry_policy_count, retry_policy_interval,
                transport_type, url, last_execution_date, next_execution_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(schedule.id.as_uuid())
        .bind(schedule.group_id.as_uuid())
        .bind(&schedule.description)
        .bind(schedule.status.as_str())
        .bind(schedule.frequency.expression())
        .bind(schedule.schedule_start)
        .bind(schedule.retry_policy.map(|p| p.strategy().as_str()))
        .bind(schedule.retry_policy.map(|p| p.count() as i32))
        .bind(schedule.retry_policy.map(|p| p.interval_str()))
        .bind(schedule.configuration.transport_type.as_str())
        .bind(&schedule.configuration.url)
        .bind(schedule.last_execution_date)
        .bind(schedule.next_execution_date)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error(e, &format!("schedule: {}", schedule.id)))?;

        sqlx::query("INSERT INTO jobs (id, schedule_id, slug, data_json) VALUES ($1, $2, $3, $4)")
            .bind(schedule.job.id.as_uuid())
            .bind(schedule.id.as_uuid())
            .bind(&schedule.job.slug)
            .bind(&schedule.job.data)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error(e, &format!("job slug: {}", schedule.job.slug)))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))
    }

    async fn update_schedule(&self, schedule: &Schedule) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE schedules SET status = $1, group_id = $2, last_execution_date = $3, \
             next_execution_date = $4 WHERE id = $5",
        )
        .bind(schedule.status.as_str())
        .bind(schedule.group_id.as_uuid())
        .bind(schedule.last_execution_date)
        .bind(schedule.next_execution_date)
        .bind(schedule.id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }

    async fn delete_schedule_by_id(&self, id: ScheduleId) -> Result<(), StorageError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query("DELETE FROM jobs WHERE schedule_id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| StorageError::Other(e.to_string()))
    }

    async fn add_job_run(&self, run: &JobRun) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO job_runs (id, group_id, schedule_id, status, reason, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(run.id.as_uuid())
        .bind(run.group_id.as_uuid())
        .bind(run.schedule_id.as_uuid())
        .bind(run.status.as_str())
        .bind(&run.reason)
        .bind(run.start_date)
        .bind(run.end_date)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error(e, &format!("job run: {}", run.id)))?;

        Ok(())
    }

    async fn update_job_run(&self, run: &JobRun) -> Result<(), StorageError> {
        sqlx::query("UPDATE job_runs SET status = $1, reason = $2, end_date = $3 WHERE id = $4")
            .bind(run.status.as_str())
            .bind(&run.reason)
            .bind(run.end_date)
            .bind(run.id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Other(e.to_string()))?;

        Ok(())
    }

    async fn get_job_run_group(
        &self,
        schedule_id: ScheduleId,
        group_id: GroupId,
    ) -> Result<Vec<JobRun>, StorageError> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            "SELECT id, group_id, schedule_id, status, reason, start_date, end_date \
             FROM job_runs WHERE schedule_id = $1 AND group_id = $2 ORDER BY start_date ASC",
        )
        .bind(schedule_id.as_uuid())
        .bind(group_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(JobRun::try_from).collect()
    }

    async fn get_recent_job_runs(
        &self,
        schedule_id: ScheduleId,
    ) -> Result<Vec<JobRun>, StorageError> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            "SELECT id, group_id, schedule_id, status, reason, start_date, end_date \
             FROM job_runs WHERE schedule_id = $1 ORDER BY start_date DESC LIMIT $2",
        )
        .bind(schedule_id.as_uuid())
        .bind(RECENT_JOB_RUNS_LIMIT as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        let mut runs = rows
            .into_iter()
            .map(JobRun::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        runs.reverse();
        Ok(runs)
    }

    async fn get_stale_job_runs(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<JobRun>, StorageError> {
        let rows: Vec<JobRunRow> = sqlx::query_as(
            "SELECT id, group_id, schedule_id, status, reason, start_date, end_date \
             FROM job_runs WHERE status = 'waiting' AND start_date < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StorageError::Other(e.to_string()))?;

        rows.into_iter().map(JobRun::try_from).collect()
    }
}
