//! Pluggable dispatch transports.
//!
//! Two capability sets: [`SyncTransport`] for synchronous HTTP dispatch and
//! [`AsyncTransport`] for broker-backed publish/subscribe with queue and
//! exchange lifecycle. The engine dispatches on the schedule's
//! `transport_type` and never branches on driver-specific error types.

mod http;
mod rabbitmq;

pub use http::HttpTransport;
pub use rabbitmq::RabbitMqTransport;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::types::{GroupId, JobRunId, ScheduleId};

/// Exchange for outbound dispatches to per-job-slug queues.
pub const EXCHANGE_SCHEDULE_JOB: &str = "timely-schedule-job";
/// Exchange for the inbound status stream.
pub const EXCHANGE_JOB_STATUS: &str = "timely-job-status";
/// Queue bound to the status exchange.
pub const QUEUE_JOB_STATUS: &str = "timely-job-status";
/// Routing key on the status exchange.
pub const ROUTING_KEY_JOB_STATUS: &str = "timely-job-status";

/// Default cap on concurrent handler invocations per subscription.
pub const DEFAULT_SUBSCRIPTION_CONCURRENCY: usize = 20;

/// Errors surfaced by transports.
///
/// Low-level driver errors are wrapped here so dispatch failures stay
/// recoverable: the engine records them on the run and counts them against
/// the retry policy.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The broker connection is down; the operation may be retried after
    /// the recovery loop reconnects.
    #[error("transport disconnected: {0}")]
    Disconnected(String),

    /// Publish, declare, or bind failed.
    #[error("transport error: {0}")]
    Operation(String),

    /// The payload could not be serialized.
    #[error("invalid message format: {0}")]
    Serialization(String),

    /// The dispatch target replied with something other than the expected
    /// status.
    #[error("invalid schedule start response: expected 202, got {0}")]
    UnexpectedStatus(u16),

    /// The dispatch request never completed.
    #[error("request error: {0}")]
    Request(String),

    /// The schedule names a transport the engine has not been given.
    #[error("unsupported transport type: {0}")]
    Unsupported(String),
}

/// The body POSTed to a schedule's configured url, and the payload published
/// to the per-slug queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchRequest {
    pub schedule_id: ScheduleId,
    pub group_id: GroupId,
    pub job_run_id: JobRunId,
    /// Job slug, passed through opaquely.
    pub job: String,
    pub data: Option<Value>,
}

/// Handler invoked per delivery on a subscription. `Ok` acknowledges the
/// message, `Err` negative-acknowledges it without requeue.
pub type SubscriptionHandler =
    std::sync::Arc<
        dyn Fn(
                Vec<u8>,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<(), String>> + Send>,
            > + Send
            + Sync,
    >;

/// Synchronous dispatch capability (HTTP).
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// POST the dispatch request to `url`. Success is exactly `202 Accepted`.
    async fn start(&self, url: &str, request: &DispatchRequest) -> Result<(), TransportError>;
}

/// Broker-backed publish/subscribe capability with queue and exchange
/// lifecycle. Queue and exchange names are first-class strings.
#[async_trait]
pub trait AsyncTransport: Send + Sync {
    /// Publish a JSON payload with persistent delivery mode.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Consume a queue with manual acknowledgement under a bounded handler
    /// pool. Deliveries are handled on the returned background task; abort
    /// it to close the subscription.
    async fn subscribe(
        &self,
        queue: &str,
        handler: SubscriptionHandler,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError>;

    /// Declare a durable queue, skipping names already declared on this
    /// connection.
    async fn create_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Delete a queue.
    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    /// Declare a durable direct exchange, skipping names already declared on
    /// this connection.
    async fn create_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Bind a queue to an exchange with a routing key.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError>;
}

/// Serialize a payload for publishing.
pub fn encode_payload<T: Serialize>(payload: &T) -> Result<Vec<u8>, TransportError> {
    serde_json::to_vec(payload).map_err(|e| TransportError::Serialization(e.to_string()))
}
