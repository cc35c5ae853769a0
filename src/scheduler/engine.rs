//! Scheduler engine implementation.
//!
//! The engine owns the tick loop that claims due schedules and fans them out
//! under a bounded semaphore, the dispatch path through the configured
//! transports, and the background tasks (status consumer, stale-run sweep).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tokio::task::JoinHandle;

use super::stale::{StaleRunDetector, DEFAULT_STALE_SWEEP_INTERVAL, DEFAULT_STALE_THRESHOLD};
use super::status::{handle_job_event, JobStatusEvent};
use crate::core::clock::{now_rounded, system_clock, Clock};
use crate::core::job_run::JobRun;
use crate::core::schedule::{Schedule, TransportType};
use crate::core::types::{JobRunId, ScheduleId};
use crate::events::{Event, EventBus};
use crate::storage::{Storage, StorageError};
use crate::transport::{
    encode_payload, AsyncTransport, DispatchRequest, SubscriptionHandler, SyncTransport,
    TransportError, EXCHANGE_JOB_STATUS, EXCHANGE_SCHEDULE_JOB, QUEUE_JOB_STATUS,
    ROUTING_KEY_JOB_STATUS,
};

/// Buffer size for the command channel between SchedulerHandle and the loop.
const COMMAND_CHANNEL_BUFFER: usize = 8;

/// Default interval between ticks.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Default cap on concurrent process-schedule tasks.
pub const DEFAULT_TICK_CONCURRENCY: usize = 2;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The status event referenced a schedule that does not exist.
    #[error("unknown schedule: {0}")]
    UnknownSchedule(ScheduleId),

    /// The status event referenced a run missing from its group.
    #[error("unknown job run: {0}")]
    UnknownJobRun(JobRunId),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Channel error.
    #[error("channel error: {0}")]
    Channel(String),
}

impl SchedulerError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::UnknownSchedule(_) => "UNKNOWN_SCHEDULE",
            SchedulerError::UnknownJobRun(_) => "UNKNOWN_JOB_RUN",
            SchedulerError::Storage(_) => "STORAGE_ERROR",
            SchedulerError::Transport(_) => "TRANSPORT_ERROR",
            SchedulerError::Channel(_) => "CHANNEL_ERROR",
        }
    }
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler loop is running.
    Running,
    /// Scheduler has shut down.
    Stopped,
}

/// Commands that can be sent to the scheduler loop.
enum SchedulerCommand {
    /// Stop after the current cycle.
    Shutdown { response: oneshot::Sender<()> },
}

/// Handle for controlling a started scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    command_tx: mpsc::Sender<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Shut the scheduler down. The tick loop exits after the current
    /// cycle; background tasks are stopped.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(SchedulerCommand::Shutdown {
                response: response_tx,
            })
            .await
            .map_err(|_| SchedulerError::Channel("failed to send shutdown command".into()))?;

        response_rx
            .await
            .map_err(|_| SchedulerError::Channel("failed to receive shutdown response".into()))
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }
}

/// Shared engine internals handed to spawned tasks.
pub(crate) struct EngineCore<S: Storage> {
    pub(crate) storage: Arc<S>,
    pub(crate) sync_transport: Option<Arc<dyn SyncTransport>>,
    pub(crate) async_transport: Option<Arc<dyn AsyncTransport>>,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) clock: Clock,
    /// Schedules currently inside a process-schedule task. A claimed
    /// schedule stays `waiting` in storage until its task persists the
    /// outcome, so without this set a slow dispatch would be re-claimed by
    /// the next tick.
    in_flight: Mutex<HashSet<ScheduleId>>,
}

/// Main scheduler for dispatching due schedules.
pub struct Scheduler<S: Storage> {
    storage: Arc<S>,
    sync_transport: Option<Arc<dyn SyncTransport>>,
    async_transport: Option<Arc<dyn AsyncTransport>>,
    event_bus: Arc<EventBus>,
    clock: Clock,
    tick_interval: Duration,
    tick_concurrency: usize,
    stale_sweep_interval: Duration,
    stale_threshold: Duration,
}

impl<S: Storage + 'static> Scheduler<S> {
    /// Create a new scheduler over the given storage.
    pub fn new(storage: S) -> Self {
        Self::with_storage(Arc::new(storage))
    }

    /// Create a new scheduler over shared storage.
    pub fn with_storage(storage: Arc<S>) -> Self {
        Self {
            storage,
            sync_transport: None,
            async_transport: None,
            event_bus: Arc::new(EventBus::new()),
            clock: system_clock(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            tick_concurrency: DEFAULT_TICK_CONCURRENCY,
            stale_sweep_interval: DEFAULT_STALE_SWEEP_INTERVAL,
            stale_threshold: DEFAULT_STALE_THRESHOLD,
        }
    }

    /// Set the synchronous (HTTP) dispatch transport.
    pub fn with_sync_transport(mut self, transport: Arc<dyn SyncTransport>) -> Self {
        self.sync_transport = Some(transport);
        self
    }

    /// Set the asynchronous (broker) transport.
    pub fn with_async_transport(mut self, transport: Arc<dyn AsyncTransport>) -> Self {
        self.async_transport = Some(transport);
        self
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the clock. Tests pass a deterministic clock.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Set the tick interval.
    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    /// Set the cap on concurrent process-schedule tasks.
    pub fn with_tick_concurrency(mut self, concurrency: usize) -> Self {
        self.tick_concurrency = concurrency.max(1);
        self
    }

    /// Set the stale-run sweep interval.
    pub fn with_stale_sweep_interval(mut self, interval: Duration) -> Self {
        self.stale_sweep_interval = interval;
        self
    }

    /// Set the age after which a waiting run counts as stale.
    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.event_bus)
    }

    /// Declare broker plumbing, install the status consumer and the stale
    /// sweeper, then start the tick loop. Returns a handle for shutdown and
    /// the loop's join handle.
    pub async fn start(self) -> Result<(SchedulerHandle, JoinHandle<()>), SchedulerError> {
        let core = Arc::new(EngineCore {
            storage: Arc::clone(&self.storage),
            sync_transport: self.sync_transport.clone(),
            async_transport: self.async_transport.clone(),
            event_bus: Arc::clone(&self.event_bus),
            clock: self.clock.clone(),
            in_flight: Mutex::new(HashSet::new()),
        });

        let mut background: Vec<JoinHandle<()>> = Vec::new();

        if let Some(transport) = &self.async_transport {
            create_internal_plumbing(transport.as_ref()).await?;
            let consumer = transport
                .subscribe(QUEUE_JOB_STATUS, status_consumer(Arc::clone(&core)))
                .await?;
            background.push(consumer);
        }

        let detector = StaleRunDetector::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.event_bus),
            self.clock.clone(),
            self.stale_threshold,
        );
        background.push(tokio::spawn(detector.run(self.stale_sweep_interval)));

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let tick_interval = self.tick_interval;
        let tick_concurrency = self.tick_concurrency;
        let loop_task = tokio::spawn(run_loop(
            core,
            tick_interval,
            tick_concurrency,
            command_rx,
            state,
            background,
        ));

        tracing::info!(
            tick_interval_ms = tick_interval.as_millis() as u64,
            tick_concurrency,
            "scheduler started"
        );

        Ok((handle, loop_task))
    }
}

/// Declare the exchanges and the status queue the engine depends on.
async fn create_internal_plumbing(
    transport: &dyn AsyncTransport,
) -> Result<(), TransportError> {
    transport.create_exchange(EXCHANGE_SCHEDULE_JOB).await?;
    transport.create_exchange(EXCHANGE_JOB_STATUS).await?;
    transport.create_queue(QUEUE_JOB_STATUS).await?;
    transport
        .bind_queue(QUEUE_JOB_STATUS, EXCHANGE_JOB_STATUS, ROUTING_KEY_JOB_STATUS)
        .await
}

/// Build the broker delivery handler that feeds the status ingestion path.
fn status_consumer<S: Storage + 'static>(core: Arc<EngineCore<S>>) -> SubscriptionHandler {
    Arc::new(move |payload: Vec<u8>| {
        let core = Arc::clone(&core);
        Box::pin(async move {
            let event: JobStatusEvent = serde_json::from_slice(&payload)
                .map_err(|e| format!("malformed status event: {}", e))?;

            handle_job_event(core.storage.as_ref(), &core.clock, &core.event_bus, event)
                .await
                .map_err(|e| e.to_string())
        })
    })
}

async fn run_loop<S: Storage + 'static>(
    core: Arc<EngineCore<S>>,
    tick_interval: Duration,
    tick_concurrency: usize,
    mut command_rx: mpsc::Receiver<SchedulerCommand>,
    state: Arc<RwLock<SchedulerState>>,
    background: Vec<JoinHandle<()>>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    let semaphore = Arc::new(Semaphore::new(tick_concurrency.max(1)));

    loop {
        tokio::select! {
            _ = interval.tick() => {
                if *state.read().await == SchedulerState::Running {
                    core.process_tick(&semaphore).await;
                }
            }

            Some(command) = command_rx.recv() => {
                match command {
                    SchedulerCommand::Shutdown { response } => {
                        *state.write().await = SchedulerState::Stopped;
                        for task in &background {
                            task.abort();
                        }
                        let _ = response.send(());
                        tracing::info!("scheduler stopped on demand");
                        break;
                    }
                }
            }
        }
    }
}

impl<S: Storage + 'static> EngineCore<S> {
    /// Read the due set and fan it out under the tick semaphore. The loop
    /// does not wait for the spawned tasks; the semaphore provides
    /// backpressure.
    async fn process_tick(self: &Arc<Self>, semaphore: &Arc<Semaphore>) {
        let now = now_rounded(&self.clock);

        let due = match self.storage.get_awaiting_schedules(now).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "failed to read due schedules, skipping tick");
                return;
            }
        };

        for schedule in due {
            {
                let mut in_flight = self.in_flight.lock().await;
                if !in_flight.insert(schedule.id) {
                    continue;
                }
            }

            let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                return;
            };

            let core = Arc::clone(self);
            tokio::spawn(async move {
                core.process_schedule(schedule, permit).await;
            });
        }
    }

    /// Claim one schedule: transition it, persist the run, dispatch, settle
    /// a dispatch failure against the retry policy, and persist. The permit
    /// is released on drop.
    async fn process_schedule(
        self: Arc<Self>,
        mut schedule: Schedule,
        _permit: OwnedSemaphorePermit,
    ) {
        schedule.start(&self.clock);
        let mut run = JobRun::new(schedule.id, schedule.group_id, &self.clock);

        // The run row must exist before the dispatch goes out, so a status
        // callback that races the dispatch can already find it.
        if let Err(e) = self.storage.add_job_run(&run).await {
            tracing::error!(
                schedule_id = %schedule.id,
                error = %e,
                "failed to persist job run, leaving schedule for the next tick"
            );
            self.in_flight.lock().await.remove(&schedule.id);
            return;
        }

        match self.dispatch(&schedule, &run).await {
            Ok(()) => {
                tracing::info!(
                    schedule_id = %schedule.id,
                    job_run_id = %run.id,
                    slug = %schedule.job.slug,
                    transport = %schedule.configuration.transport_type,
                    "dispatched schedule"
                );
                self.event_bus
                    .emit(Event::ScheduleDispatched {
                        schedule_id: schedule.id,
                        job_run_id: run.id,
                        transport: schedule.configuration.transport_type,
                        timestamp: now_rounded(&self.clock),
                    })
                    .await;
            }
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(
                    schedule_id = %schedule.id,
                    job_run_id = %run.id,
                    error = %reason,
                    "dispatch failed"
                );

                match self
                    .storage
                    .get_job_run_group(schedule.id, schedule.group_id)
                    .await
                {
                    Ok(group) => {
                        // The current run is already persisted, so the group
                        // size is the attempt count.
                        let attempt = group.len().max(1) as u32;
                        run.failed(reason.clone(), &self.clock);
                        schedule.failed(attempt, &self.clock);
                    }
                    Err(group_err) => {
                        run.failed(format!("{}; {}", reason, group_err), &self.clock);
                        schedule.failed(1, &self.clock);
                    }
                }

                if let Err(e) = self.storage.update_job_run(&run).await {
                    tracing::error!(job_run_id = %run.id, error = %e, "failed to persist job run");
                }

                self.event_bus
                    .emit(Event::DispatchFailed {
                        schedule_id: schedule.id,
                        job_run_id: run.id,
                        reason,
                        timestamp: now_rounded(&self.clock),
                    })
                    .await;
            }
        }

        if let Err(e) = self.storage.update_schedule(&schedule).await {
            tracing::error!(schedule_id = %schedule.id, error = %e, "failed to persist schedule");
        }

        self.in_flight.lock().await.remove(&schedule.id);
    }

    /// Dispatch a run through the schedule's transport.
    async fn dispatch(&self, schedule: &Schedule, run: &JobRun) -> Result<(), TransportError> {
        let request = DispatchRequest {
            schedule_id: schedule.id,
            group_id: schedule.group_id,
            job_run_id: run.id,
            job: schedule.job.slug.clone(),
            data: schedule.job.data.clone(),
        };

        match schedule.configuration.transport_type {
            TransportType::Http => {
                let Some(transport) = &self.sync_transport else {
                    return Err(TransportError::Unsupported("http".to_string()));
                };
                let url = schedule.configuration.url.as_deref().ok_or_else(|| {
                    TransportError::Operation("missing url for http transport".to_string())
                })?;
                transport.start(url, &request).await
            }
            TransportType::Rabbitmq => {
                let Some(transport) = &self.async_transport else {
                    return Err(TransportError::Unsupported("rabbitmq".to_string()));
                };
                transport.create_queue(&schedule.job.slug).await?;
                transport
                    .bind_queue(&schedule.job.slug, EXCHANGE_SCHEDULE_JOB, &schedule.job.slug)
                    .await?;
                let payload = encode_payload(&request)?;
                transport
                    .publish(EXCHANGE_SCHEDULE_JOB, &schedule.job.slug, &payload)
                    .await
            }
        }
    }
}
