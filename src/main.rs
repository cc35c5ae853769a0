//! timely - a persistent, distributed job scheduler.
//!
//! Registers schedules through an HTTP admin API, fires them at their due
//! time, dispatches over HTTP or RabbitMQ, and correlates asynchronous
//! status callbacks back to the originating job run.

use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use timely::api::{create_api_state, start_server, ApiConfig};
use timely::{
    system_clock, Config, Event, EventBus, EventHandler, HttpTransport, PostgresStorage,
    RabbitMqTransport, Scheduler,
};

/// timely - persistent distributed job scheduler
#[derive(Parser)]
#[command(name = "timely")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Postgres connection string
    #[arg(long, env = "TIMELY_DATABASE_URL")]
    database_url: String,

    /// RabbitMQ connection string
    #[arg(long, env = "TIMELY_RABBITMQ_URL")]
    rabbitmq_url: Option<String>,

    /// Disable the HTTP dispatch transport
    #[arg(long)]
    no_http_transport: bool,

    /// Enable the RabbitMQ dispatch transport (requires --rabbitmq-url)
    #[arg(long)]
    rabbitmq_transport: bool,

    /// Tick interval in seconds
    #[arg(long, default_value = "1")]
    tick_interval: u64,

    /// Maximum concurrent schedule dispatches per tick
    #[arg(long, default_value = "2")]
    tick_concurrency: usize,

    /// Maximum concurrent handler invocations per broker subscription
    #[arg(long, default_value = "20")]
    subscription_concurrency: usize,

    /// Stale-run sweep interval in seconds
    #[arg(long, default_value = "5")]
    stale_sweep_interval: u64,

    /// Age in seconds after which a waiting run counts as stale
    #[arg(long, default_value = "300")]
    stale_threshold: u64,

    /// API bind host
    #[arg(long, default_value = "127.0.0.1")]
    api_host: String,

    /// API bind port
    #[arg(long, default_value = "7468")]
    api_port: u16,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            database_url: self.database_url,
            rabbitmq_url: self.rabbitmq_url,
            enable_http_transport: !self.no_http_transport,
            enable_rabbitmq_transport: self.rabbitmq_transport,
            tick_interval: Duration::from_secs(self.tick_interval.max(1)),
            tick_concurrency: self.tick_concurrency,
            subscription_concurrency: self.subscription_concurrency,
            stale_sweep_interval: Duration::from_secs(self.stale_sweep_interval.max(1)),
            stale_threshold: Duration::from_secs(self.stale_threshold),
            api_host: self.api_host,
            api_port: self.api_port,
        }
    }
}

/// Event handler that mirrors scheduler lifecycle events into the log.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::ScheduleDispatched {
                schedule_id,
                job_run_id,
                transport,
                ..
            } => {
                info!(
                    "schedule {} dispatched over {} (run: {})",
                    schedule_id, transport, job_run_id
                );
            }
            Event::DispatchFailed {
                schedule_id,
                job_run_id,
                reason,
                ..
            } => {
                warn!(
                    "schedule {} dispatch failed (run: {}): {}",
                    schedule_id, job_run_id, reason
                );
            }
            Event::JobRunFinished {
                schedule_id,
                job_run_id,
                success,
                ..
            } => {
                if *success {
                    info!("run {} of schedule {} succeeded", job_run_id, schedule_id);
                } else {
                    warn!("run {} of schedule {} failed", job_run_id, schedule_id);
                }
            }
            Event::StaleRunDetected {
                schedule_id,
                job_run_id,
                waiting_since,
                ..
            } => {
                warn!(
                    "run {} of schedule {} waiting since {}",
                    job_run_id, schedule_id, waiting_since
                );
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Cli::parse().into_config();
    config.validate()?;

    info!("connecting to storage");
    let storage = Arc::new(PostgresStorage::new(&config.database_url).await?);

    let clock = system_clock();
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = Scheduler::with_storage(Arc::clone(&storage))
        .with_event_bus(Arc::clone(&event_bus))
        .with_clock(clock.clone())
        .with_tick_interval(config.tick_interval)
        .with_tick_concurrency(config.tick_concurrency)
        .with_stale_sweep_interval(config.stale_sweep_interval)
        .with_stale_threshold(config.stale_threshold);

    if config.enable_http_transport {
        scheduler = scheduler.with_sync_transport(Arc::new(HttpTransport::new()));
    }

    if config.enable_rabbitmq_transport {
        let url = config
            .rabbitmq_url
            .as_deref()
            .ok_or(timely::ConfigError::MissingBrokerUrl)?;
        info!("connecting to broker");
        let transport =
            RabbitMqTransport::connect_with_concurrency(url, config.subscription_concurrency)
                .await?;
        scheduler = scheduler.with_async_transport(Arc::new(transport));
    }

    let (handle, scheduler_task) = scheduler.start().await?;

    let api_state = create_api_state(Arc::clone(&storage), clock, event_bus);
    let api_config = ApiConfig::new(config.api_host.clone(), config.api_port);
    let api_task = start_server(api_config, api_state).await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            if let Err(e) = handle.shutdown().await {
                error!("shutdown error: {}", e);
            }
        }
        _ = scheduler_task => {
            info!("scheduler stopped");
        }
    }

    api_task.abort();
    storage.close().await;
    info!("goodbye");

    Ok(())
}
