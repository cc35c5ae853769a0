//! Status-event ingestion.
//!
//! [`handle_job_event`] is the single entry point that closes the loop
//! between a dispatch and its persisted outcome. Both the broker consumer on
//! the status queue and the HTTP callback endpoint feed it.

use serde::{Deserialize, Serialize};

use super::engine::SchedulerError;
use crate::core::clock::{now_rounded, Clock};
use crate::core::types::{GroupId, JobRunId, ScheduleId};
use crate::events::{Event, EventBus};
use crate::storage::Storage;

/// Job status reported by a handler.
pub const STATUS_SUCCEED: &str = "succeed";
/// Job failure reported by a handler.
pub const STATUS_FAILED: &str = "failed";

/// Status callback payload.
///
/// `status` stays a plain string so unknown statuses from newer handlers are
/// ignored instead of rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusEvent {
    pub schedule_id: ScheduleId,
    pub group_id: GroupId,
    pub job_run_id: JobRunId,
    pub status: String,
    pub reason: Option<String>,
}

/// Correlate a status event back to its schedule and job run, transition
/// both, and persist them (run first, then schedule).
///
/// Replays of terminal events are no-op successes so broker redelivery
/// cannot corrupt settled state.
pub async fn handle_job_event<S: Storage>(
    storage: &S,
    clock: &Clock,
    event_bus: &EventBus,
    event: JobStatusEvent,
) -> Result<(), SchedulerError> {
    let mut schedule = storage
        .get_schedule_by_id(event.schedule_id)
        .await?
        .ok_or(SchedulerError::UnknownSchedule(event.schedule_id))?;

    let group = storage
        .get_job_run_group(event.schedule_id, event.group_id)
        .await?;

    let mut run = group
        .iter()
        .find(|r| r.id == event.job_run_id)
        .cloned()
        .ok_or(SchedulerError::UnknownJobRun(event.job_run_id))?;

    if run.is_terminal() {
        tracing::debug!(
            job_run_id = %run.id,
            status = %event.status,
            "replayed status for terminal run, ignoring"
        );
        return Ok(());
    }

    let success = match event.status.as_str() {
        STATUS_SUCCEED => {
            run.succeed(clock);
            schedule.succeed(clock);
            true
        }
        STATUS_FAILED => {
            let reason = event
                .reason
                .clone()
                .unwrap_or_else(|| "job failed".to_string());
            run.failed(reason, clock);
            schedule.failed(group.len() as u32, clock);
            false
        }
        other => {
            tracing::debug!(status = other, "ignoring unknown job status");
            return Ok(());
        }
    };

    storage.update_job_run(&run).await?;
    storage.update_schedule(&schedule).await?;

    event_bus
        .emit(Event::JobRunFinished {
            schedule_id: schedule.id,
            job_run_id: run.id,
            success,
            timestamp: now_rounded(clock),
        })
        .await;

    tracing::info!(
        schedule_id = %schedule.id,
        job_run_id = %run.id,
        status = %event.status,
        "settled job run"
    );

    Ok(())
}
