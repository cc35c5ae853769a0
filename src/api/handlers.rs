//! API request handlers.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::core::clock::{now_rounded, Clock};
use crate::core::frequency::Frequency;
use crate::core::retry::{RetryPolicy, RetryStrategy};
use crate::core::schedule::{Schedule, ScheduleConfiguration, TransportType};
use crate::core::types::ScheduleId;
use crate::events::EventBus;
use crate::scheduler::{handle_job_event, JobStatusEvent};
use crate::storage::Storage;

use super::errors::ApiError;
use super::responses::{
    CreateScheduleRequest, CreateScheduleResponse, ScheduleDetailsDto, ScheduleDto,
};

/// Shared application state for API handlers.
pub struct ApiState<S: Storage> {
    pub storage: Arc<S>,
    pub clock: Clock,
    pub event_bus: Arc<EventBus>,
}

impl<S: Storage> Clone for ApiState<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            clock: self.clock.clone(),
            event_bus: Arc::clone(&self.event_bus),
        }
    }
}

/// Query parameters for the paged schedule list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSchedulesQuery {
    pub page: u32,
    pub page_size: u32,
}

/// Create a schedule.
pub async fn create_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Json(request): Json<CreateScheduleRequest>,
) -> Result<Json<CreateScheduleResponse>, ApiError> {
    let validated = validate_create_schedule(&request, &state.clock)?;

    let schedule = Schedule::new(
        request.description.clone(),
        &request.frequency,
        validated.job_slug,
        validated.job_data,
        validated.retry_policy,
        ScheduleConfiguration {
            transport_type: validated.transport_type,
            url: validated.url,
        },
        request.schedule_start,
        &state.clock,
    )
    .map_err(|e| ApiError::Validation(e.to_string()))?;

    state.storage.add(&schedule).await?;

    tracing::info!(schedule_id = %schedule.id, slug = %schedule.job.slug, "created schedule");

    Ok(Json(CreateScheduleResponse { id: schedule.id }))
}

struct ValidatedCreate {
    job_slug: String,
    job_data: Option<serde_json::Value>,
    transport_type: TransportType,
    url: Option<String>,
    retry_policy: Option<RetryPolicy>,
}

fn validate_create_schedule(
    request: &CreateScheduleRequest,
    clock: &Clock,
) -> Result<ValidatedCreate, ApiError> {
    let mut problems: Vec<String> = Vec::new();

    if request.description.trim().is_empty() {
        problems.push("invalid description".to_string());
    }

    if request.frequency.trim().is_empty() {
        problems.push("missing frequency configuration".to_string());
    } else if Frequency::parse(request.frequency.as_str()).is_err() {
        problems.push("invalid frequency configuration".to_string());
    }

    if let Some(start) = request.schedule_start {
        if start <= now_rounded(clock) {
            problems.push("invalid schedule start".to_string());
        }
    }

    let mut job_slug = String::new();
    let mut job_data = None;
    match &request.job {
        None => problems.push("missing job configuration".to_string()),
        Some(job) if job.slug.trim().is_empty() => {
            problems.push("invalid job slug".to_string());
        }
        Some(job) => {
            job_slug = job.slug.clone();
            job_data = job.data.clone();
        }
    }

    let mut transport_type = None;
    let mut url = None;
    match &request.configuration {
        None => problems.push("missing schedule configuration".to_string()),
        Some(configuration) => {
            match TransportType::parse(&configuration.transport_type) {
                None => problems.push("invalid transport type".to_string()),
                Some(transport) => {
                    transport_type = Some(transport);
                    if transport == TransportType::Http {
                        match configuration.url.as_deref() {
                            None | Some("") => {
                                problems.push("missing url for http transport".to_string());
                            }
                            Some(raw) => match reqwest::Url::parse(raw) {
                                Ok(_) => url = configuration.url.clone(),
                                Err(_) => {
                                    problems.push("invalid url for http transport".to_string());
                                }
                            },
                        }
                    }
                }
            }
        }
    }

    let mut retry_policy = None;
    if let Some(policy) = &request.retry_policy {
        match RetryStrategy::parse(&policy.strategy)
            .and_then(|strategy| RetryPolicy::new(strategy, policy.count, &policy.interval))
        {
            Ok(parsed) => retry_policy = Some(parsed),
            Err(e) => problems.push(e.to_string()),
        }
    }

    if !problems.is_empty() {
        return Err(ApiError::Validation(problems.join("; ")));
    }

    // A missing transport type always comes with a recorded problem.
    let Some(transport_type) = transport_type else {
        return Err(ApiError::Validation("invalid transport type".to_string()));
    };

    Ok(ValidatedCreate {
        job_slug,
        job_data,
        transport_type,
        url,
        retry_policy,
    })
}

/// Get a schedule with its recent runs grouped by retry group.
pub async fn get_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduleDetailsDto>, ApiError> {
    let schedule_id = ScheduleId::from_uuid(id);

    let schedule = state
        .storage
        .get_schedule_by_id(schedule_id)
        .await?
        .ok_or_else(|| ApiError::NotFound("schedule not found".to_string()))?;

    let recent_runs = state.storage.get_recent_job_runs(schedule_id).await?;

    Ok(Json(ScheduleDetailsDto::from_parts(&schedule, &recent_runs)))
}

/// List schedules with validated paging.
pub async fn list_schedules<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Query(query): Query<ListSchedulesQuery>,
) -> Result<Json<Vec<ScheduleDto>>, ApiError> {
    if query.page < 1 {
        return Err(ApiError::Validation("invalid page".to_string()));
    }
    if query.page_size < 1 || query.page_size > 100 {
        return Err(ApiError::Validation("invalid pageSize".to_string()));
    }

    let schedules = state
        .storage
        .get_schedules_paged(query.page, query.page_size)
        .await?;

    Ok(Json(schedules.iter().map(ScheduleDto::from).collect()))
}

/// Delete a schedule and its job.
pub async fn delete_schedule<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .storage
        .delete_schedule_by_id(ScheduleId::from_uuid(id))
        .await
        .map_err(|e| ApiError::Unprocessable(e.to_string()))?;

    Ok(StatusCode::NO_CONTENT)
}

/// HTTP ingress for job status callbacks. Shares the ingestion path with
/// the broker consumer; malformed or unknown events are a 400 so the caller
/// can resend.
pub async fn job_status<S: Storage + 'static>(
    State(state): State<ApiState<S>>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let event: JobStatusEvent = serde_json::from_slice(&body)
        .map_err(|e| ApiError::Validation(format!("malformed status event: {}", e)))?;

    handle_job_event(state.storage.as_ref(), &state.clock, &state.event_bus, event)
        .await
        .map_err(|e| ApiError::Validation(format!("{} - {}", e.code(), e)))?;

    Ok(StatusCode::ACCEPTED)
}
