//! RabbitMQ connection manager.
//!
//! Connects with bounded exponential backoff, declares the exchange, queue
//! and binding the dispatcher consumes from, and registers the consumer.
//! Declarations are idempotent, so re-declaring topology that already exists
//! with the same properties is harmless.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use lapin::{
    options::{
        BasicConsumeOptions, BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::BrokerConfig;
use crate::error::BrokerError;

/// Consumer tag announced to the broker.
pub const CONSUMER_TAG: &str = "mail-dispatcher";

/// Bounded exponential backoff: wait `min(2^attempt, cap)` seconds after
/// the n-th consecutive failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            cap: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.connect_attempts.max(1),
            cap: config.backoff_cap,
        }
    }

    /// Wait before the next attempt, `attempt` counting failures from 1.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let secs = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        Duration::from_secs(secs).min(self.cap)
    }
}

/// Run `op` until it succeeds or the policy's attempts are used up.
///
/// No wait follows the final failure.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;

                if attempt >= policy.max_attempts {
                    warn!(
                        attempt = attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "rabbitmq_connect_exhausted"
                    );
                    return Err(BrokerError::Unavailable {
                        attempts: attempt,
                        last_error: e.to_string(),
                    });
                }

                let wait = policy.delay_for(attempt);
                warn!(
                    attempt = attempt,
                    max_attempts = policy.max_attempts,
                    retry_in_secs = wait.as_secs(),
                    error = %e,
                    "rabbitmq_connect_failed"
                );
                sleep(wait).await;
            }
        }
    }
}

/// Map a configured exchange type onto lapin's kinds.
pub fn exchange_kind(name: &str) -> ExchangeKind {
    match name.trim().to_ascii_lowercase().as_str() {
        "direct" => ExchangeKind::Direct,
        "fanout" => ExchangeKind::Fanout,
        "topic" => ExchangeKind::Topic,
        "headers" => ExchangeKind::Headers,
        _ => ExchangeKind::Custom(name.to_string()),
    }
}

/// An open broker connection and the channel consumed from.
pub struct Broker {
    connection: Connection,
    channel: Channel,
}

impl Broker {
    /// Connect under the retry policy, then declare topology.
    ///
    /// Fails with [`BrokerError::Unavailable`] once the retry budget is spent;
    /// the caller must not start consuming in that case.
    pub async fn connect(config: &BrokerConfig, prefetch: u16) -> Result<Self, BrokerError> {
        let policy = RetryPolicy::from_config(config);

        info!(
            url_length = config.url.len(),
            max_attempts = policy.max_attempts,
            "rabbitmq_connecting"
        );

        let (connection, channel) = retry(&policy, || open(&config.url)).await?;

        info!("rabbitmq_connected");

        let broker = Self {
            connection,
            channel,
        };
        broker.configure(config, prefetch).await?;

        Ok(broker)
    }

    async fn configure(&self, config: &BrokerConfig, prefetch: u16) -> Result<(), BrokerError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|source| BrokerError::Topology {
                resource: "qos",
                source,
            })?;

        info!(prefetch_count = prefetch, "rabbitmq_qos_set");

        self.channel
            .exchange_declare(
                &config.exchange_name,
                exchange_kind(&config.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Topology {
                resource: "exchange",
                source,
            })?;

        self.channel
            .queue_declare(
                &config.queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Topology {
                resource: "queue",
                source,
            })?;

        self.channel
            .queue_bind(
                &config.queue_name,
                &config.exchange_name,
                &config.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|source| BrokerError::Topology {
                resource: "binding",
                source,
            })?;

        info!(
            exchange = %config.exchange_name,
            exchange_type = %config.exchange_type,
            queue = %config.queue_name,
            routing_key = %config.routing_key,
            "rabbitmq_topology_declared"
        );

        Ok(())
    }

    /// Start consuming the configured queue.
    pub async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BrokerError::Consume)?;

        info!(queue = %queue, consumer_tag = CONSUMER_TAG, "rabbitmq_consumer_started");

        Ok(consumer)
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Hand back the connection and channel, e.g. for shutdown.
    pub fn into_parts(self) -> (Connection, Channel) {
        (self.connection, self.channel)
    }
}

/// One connection attempt: connect and open a channel.
async fn open(url: &str) -> Result<(Connection, Channel), lapin::Error> {
    let connection = Connection::connect(url, ConnectionProperties::default()).await?;
    let channel = connection.create_channel().await?;
    Ok((connection, channel))
}
