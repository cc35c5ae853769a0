pub mod api;
pub mod config;
pub mod core;
pub mod events;
pub mod scheduler;
pub mod storage;
pub mod transport;

pub use crate::core::clock::{fixed_clock, system_clock, Clock};
pub use crate::core::frequency::{Frequency, FrequencyError, ONCE};
pub use crate::core::job_run::{JobRun, JobRunStatus};
pub use crate::core::retry::{RetryPolicy, RetryPolicyError, RetryStrategy};
pub use crate::core::schedule::{
    Schedule, ScheduleConfiguration, ScheduleStatus, ScheduledJob, TransportType,
};
pub use crate::core::types::{GroupId, JobId, JobRunId, ScheduleId};

pub use crate::config::{Config, ConfigError};
pub use crate::events::{Event, EventBus, EventHandler};
pub use crate::scheduler::{
    handle_job_event, JobStatusEvent, Scheduler, SchedulerError, SchedulerHandle, SchedulerState,
    StaleRunDetector,
};
pub use crate::storage::{InMemoryStorage, PostgresStorage, Storage, StorageError};
pub use crate::transport::{
    AsyncTransport, DispatchRequest, HttpTransport, RabbitMqTransport, SubscriptionHandler,
    SyncTransport, TransportError, EXCHANGE_JOB_STATUS, EXCHANGE_SCHEDULE_JOB, QUEUE_JOB_STATUS,
    ROUTING_KEY_JOB_STATUS,
};
