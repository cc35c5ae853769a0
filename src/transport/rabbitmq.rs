//! RabbitMQ transport driver.
//!
//! Owns one connection and a map from logical names (exchanges, queues, an
//! admin key) to channels. A background recovery loop reconnects after
//! unsolicited closes; declared queue/exchange names are tracked so
//! declaration is skipped for known names and repeated after a reconnect.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, Semaphore};

use super::{AsyncTransport, SubscriptionHandler, TransportError, DEFAULT_SUBSCRIPTION_CONCURRENCY};

/// Logical channel name used for declarations and bindings.
const ADMIN_CHANNEL: &str = "admin";

/// Delay between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// RabbitMQ transport backed by lapin.
pub struct RabbitMqTransport {
    inner: Arc<Inner>,
}

struct Inner {
    uri: String,
    connection: RwLock<Option<Connection>>,
    channels: Mutex<HashMap<String, Channel>>,
    declared_queues: Mutex<HashSet<String>>,
    declared_exchanges: Mutex<HashSet<String>>,
    subscription_concurrency: usize,
}

impl RabbitMqTransport {
    /// Connect to the broker and start the recovery watcher.
    pub async fn connect(uri: &str) -> Result<Self, TransportError> {
        Self::connect_with_concurrency(uri, DEFAULT_SUBSCRIPTION_CONCURRENCY).await
    }

    /// Connect with a custom per-subscription handler pool size.
    pub async fn connect_with_concurrency(
        uri: &str,
        subscription_concurrency: usize,
    ) -> Result<Self, TransportError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| TransportError::Disconnected(e.to_string()))?;

        let inner = Arc::new(Inner {
            uri: uri.to_string(),
            connection: RwLock::new(Some(connection)),
            channels: Mutex::new(HashMap::new()),
            declared_queues: Mutex::new(HashSet::new()),
            declared_exchanges: Mutex::new(HashSet::new()),
            subscription_concurrency: subscription_concurrency.max(1),
        });

        tokio::spawn(Inner::recovery_loop(Arc::clone(&inner)));

        Ok(Self { inner })
    }
}

impl Inner {
    /// Watch the connection and rebuild it after unsolicited closes. Channel
    /// and declared-name caches are dropped on loss so everything is
    /// redeclared before first use on the new connection.
    async fn recovery_loop(inner: Arc<Inner>) {
        loop {
            tokio::time::sleep(RECONNECT_DELAY).await;

            if inner.is_connected().await {
                continue;
            }

            tracing::warn!("broker connection lost, reconnecting");
            inner.channels.lock().await.clear();
            inner.declared_queues.lock().await.clear();
            inner.declared_exchanges.lock().await.clear();

            match Connection::connect(&inner.uri, ConnectionProperties::default()).await {
                Ok(connection) => {
                    *inner.connection.write().await = Some(connection);
                    tracing::info!("broker connection re-established");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker reconnect failed, retrying");
                }
            }
        }
    }

    async fn is_connected(&self) -> bool {
        self.connection
            .read()
            .await
            .as_ref()
            .is_some_and(|c| c.status().connected())
    }

    /// Get the cached channel for a logical name, creating it lazily. A
    /// channel that lost its underlying connection is replaced.
    async fn channel(&self, name: &str) -> Result<Channel, TransportError> {
        let mut channels = self.channels.lock().await;

        if let Some(channel) = channels.get(name) {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            channels.remove(name);
        }

        let guard = self.connection.read().await;
        let connection = guard
            .as_ref()
            .filter(|c| c.status().connected())
            .ok_or_else(|| {
                TransportError::Disconnected("no active broker connection".to_string())
            })?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::Operation(e.to_string()))?;
        channels.insert(name.to_string(), channel.clone());

        Ok(channel)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), TransportError> {
        let queue = queue.trim();

        {
            let declared = self.declared_queues.lock().await;
            if declared.contains(queue) {
                return Ok(());
            }
        }

        let channel = self.channel(ADMIN_CHANNEL).await?;
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Operation(format!("declare queue {}: {}", queue, e)))?;

        self.declared_queues.lock().await.insert(queue.to_string());
        Ok(())
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        let exchange = exchange.trim();

        {
            let declared = self.declared_exchanges.lock().await;
            if declared.contains(exchange) {
                return Ok(());
            }
        }

        let channel = self.channel(ADMIN_CHANNEL).await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Operation(format!("declare exchange {}: {}", exchange, e))
            })?;

        self.declared_exchanges
            .lock()
            .await
            .insert(exchange.to_string());
        Ok(())
    }

    /// Consume a queue until its channel dies, dispatching deliveries into
    /// the bounded handler pool.
    async fn consume(
        &self,
        queue: &str,
        handler: &SubscriptionHandler,
    ) -> Result<(), TransportError> {
        self.declare_queue(queue).await?;

        let channel = self.channel(queue).await?;
        let mut consumer = channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| TransportError::Operation(format!("consume {}: {}", queue, e)))?;

        let pool = Arc::new(Semaphore::new(self.subscription_concurrency));

        while let Some(delivery) = consumer.next().await {
            let delivery = match delivery {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::warn!(queue, error = %e, "delivery error on subscription");
                    continue;
                }
            };

            let Ok(permit) = Arc::clone(&pool).acquire_owned().await else {
                break;
            };
            let handler = Arc::clone(handler);

            tokio::spawn(async move {
                let result = handler(delivery.data.clone()).await;

                let outcome = match result {
                    Ok(()) => delivery.ack(BasicAckOptions::default()).await,
                    Err(reason) => {
                        tracing::warn!(reason, "handler rejected delivery");
                        delivery
                            .nack(BasicNackOptions {
                                requeue: false,
                                ..BasicNackOptions::default()
                            })
                            .await
                    }
                };

                if let Err(e) = outcome {
                    tracing::warn!(error = %e, "failed to settle delivery");
                }

                drop(permit);
            });
        }

        Ok(())
    }
}

#[async_trait]
impl AsyncTransport for RabbitMqTransport {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        self.inner.declare_exchange(exchange).await?;

        let channel = self.inner.channel(exchange).await?;
        channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_content_type("application/json".into())
                    .with_delivery_mode(2),
            )
            .await
            .map_err(|e| TransportError::Operation(format!("publish to {}: {}", exchange, e)))?
            .await
            .map_err(|e| TransportError::Operation(format!("publish to {}: {}", exchange, e)))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        handler: SubscriptionHandler,
    ) -> Result<tokio::task::JoinHandle<()>, TransportError> {
        let inner = Arc::clone(&self.inner);
        let queue = queue.trim().to_string();

        // Supervised consumer: when the channel dies the loop waits for the
        // recovery watcher to restore the connection, then re-consumes.
        let task = tokio::spawn(async move {
            loop {
                match inner.consume(&queue, &handler).await {
                    Ok(()) => {
                        tracing::warn!(queue = %queue, "consumer stream closed, resubscribing");
                    }
                    Err(e) => {
                        tracing::warn!(queue = %queue, error = %e, "subscription failed, retrying");
                    }
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        });

        Ok(task)
    }

    async fn create_queue(&self, queue: &str) -> Result<(), TransportError> {
        self.inner.declare_queue(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError> {
        let queue = queue.trim();
        let channel = self.inner.channel(ADMIN_CHANNEL).await?;

        channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| TransportError::Operation(format!("delete queue {}: {}", queue, e)))?;

        self.inner.declared_queues.lock().await.remove(queue);
        Ok(())
    }

    async fn create_exchange(&self, exchange: &str) -> Result<(), TransportError> {
        self.inner.declare_exchange(exchange).await
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), TransportError> {
        let channel = self.inner.channel(ADMIN_CHANNEL).await?;

        channel
            .queue_bind(
                queue.trim(),
                exchange.trim(),
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                TransportError::Operation(format!(
                    "bind queue {} to exchange {}: {}",
                    queue, exchange, e
                ))
            })?;

        Ok(())
    }
}
