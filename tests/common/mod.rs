//! Common test utilities shared across integration tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use timely::{
    fixed_clock, AsyncTransport, Clock, DispatchRequest, RetryPolicy, Schedule,
    ScheduleConfiguration, ScheduleStatus, Storage, SubscriptionHandler, SyncTransport,
    TransportError, TransportType,
};

/// Deterministic base instant used across tests.
pub fn fake_date() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2000, 1, 1, 10, 30, 0).unwrap()
}

/// Clock pinned to [`fake_date`].
pub fn fake_clock() -> Clock {
    fixed_clock(fake_date())
}

/// Build a schedule bound to the HTTP transport.
pub fn http_schedule(
    clock: &Clock,
    frequency: &str,
    slug: &str,
    retry_policy: Option<RetryPolicy>,
) -> Schedule {
    Schedule::new(
        "integration test schedule",
        frequency,
        slug,
        None,
        retry_policy,
        ScheduleConfiguration {
            transport_type: TransportType::Http,
            url: Some("http://localhost:5001/api/v1/jobs/run".to_string()),
        },
        None,
        clock,
    )
    .unwrap()
}

/// Build a schedule bound to the broker transport.
pub fn broker_schedule(clock: &Clock, frequency: &str, slug: &str) -> Schedule {
    Schedule::new(
        "integration test schedule",
        frequency,
        slug,
        Some(serde_json::json!({"batch": 25})),
        None,
        ScheduleConfiguration {
            transport_type: TransportType::Rabbitmq,
            url: None,
        },
        None,
        clock,
    )
    .unwrap()
}

/// Poll storage until the schedule reaches the expected status.
///
/// # Panics
///
/// Panics when the timeout elapses first.
pub async fn wait_for_schedule_status(
    storage: &dyn Storage,
    schedule_id: timely::ScheduleId,
    expected: ScheduleStatus,
    timeout: Duration,
) -> Schedule {
    let start = tokio::time::Instant::now();
    loop {
        let schedule = storage
            .get_schedule_by_id(schedule_id)
            .await
            .unwrap()
            .expect("schedule exists");
        if schedule.status == expected {
            return schedule;
        }
        if start.elapsed() > timeout {
            panic!(
                "timeout waiting for schedule {} to reach {:?}, current status: {:?}",
                schedule_id, expected, schedule.status
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Sync transport that records every dispatch and optionally fails.
pub struct RecordingSyncTransport {
    pub requests: Mutex<Vec<(String, DispatchRequest)>>,
    pub fail_with_status: Option<u16>,
}

impl RecordingSyncTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail_with_status: None,
        })
    }

    pub fn failing(status: u16) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            fail_with_status: Some(status),
        })
    }

    pub async fn request_count(&self) -> usize {
        self.requests.lock().await.len()
    }
}

#[async_trait]
impl SyncTransport for RecordingSyncTransport {
    async fn start(&self, url: &str, request: &DispatchRequest) -> Result<(), TransportError> {
        self.requests
            .lock()
            .await
            .push((url.to_string(), request.clone()));

        match self.fail_with_status {
            Some(status) => Err(TransportError::UnexpectedStatus(status)),
            None => Ok(()),
        }
    }
}

/// In-memory broker double: records lifecycle calls and lets tests feed
/// deliveries into installed subscription handlers.
pub struct MockBroker {
    pub published: Mutex<Vec<(String, String, Vec<u8>)>>,
    pub queues: Mutex<Vec<String>>,
    pub exchanges: Mutex<Vec<String>>,
    pub bindings: Mutex<Vec<(String, String, String)>>,
    handlers: Mutex<HashMap<String, SubscriptionHandler>>,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            queues: Mutex::new(Vec::new()),
            exchanges: Mutex::new(Vec::new()),
            bindings: Mutex::new(Vec::new()),
            handlers: Mutex::new(HashMap::new()),
        })
    }

    /// Feed one delivery into the consumer installed on `queue`, returning
    /// the handler verdict (`Ok` would ack, `Err` would nack).
    pub async fn deliver(&self, queue: &str, payload: &[u8]) -> Result<(), String> {
        let handler = {
            let handlers = self.handlers.lock().await;
            Arc::clone(handlers.get(queue).expect("no consumer on queue"))
        };
        handler(payload.to_vec()).await
    }

    pub async fn published_on(&self, exchange: &str) -> Vec<(String, Vec<u8>)> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(e, _, _)| e == exchange)
            .map(|(_, key, payload)| (key.clone(), payload.clone()))
            .collect()
    }
}

#[async_trait]
impl AsyncTransport for MockBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.published.lock().await.push((
            exchange.to_string(),
            routing_key.to_string(),
            payload.to_vec(),
        ));
        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: SubscriptionHandler,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError> {
        self.handlers
            .lock()
            .await
            .insert(queue.to_string(), handler);
        Ok(tokio::spawn(std::future::pending()))
    }

    async fn create_queue(&self, queue: &str) -> Result<(), TransportError> {
        let mut queues = self.queues.lock().await;
        if !queues.iter().any(|q| q == queue) {
            queues.push(queue.to_string());
        }
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.queues.lock().await.retain(|q| q != queue);
        Ok(())
    }

    async fn create_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let mut exchanges = self.exchanges.lock().await;
        if !exchanges.iter().any(|e| e == exchange) {
            exchanges.push(exchange.to_string());
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        self.bindings.lock().await.push((
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        ));
        Ok(())
    }
}
