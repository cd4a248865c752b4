//! One-shot RabbitMQ publisher for enqueueing email tasks.
//!
//! Each call opens its own connection, publishes a single persistent message
//! to the configured exchange and closes again. There is no retry: a failed
//! publish is reported to the caller.

use anyhow::{Context, Result};
use lapin::{
    options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions},
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Connection, ConnectionProperties,
};
use tracing::{info, warn};

use super::types::EmailTask;
use crate::broker::exchange_kind;
use crate::config::BrokerConfig;

/// Publishes email tasks to the dispatcher's exchange.
#[derive(Debug, Clone)]
pub struct Publisher {
    config: BrokerConfig,
}

impl Publisher {
    /// Create a new publisher for the given broker settings.
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Message properties stamped on every task.
    fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_delivery_mode(2) // Persistent
            .with_content_type("application/json".into())
            .with_expiration(self.config.message_ttl_ms.to_string().into())
    }

    /// Publish one task and wait for the broker to confirm it.
    pub async fn publish_task(&self, task: &EmailTask) -> Result<()> {
        let body = serde_json::to_vec(task).context("Failed to serialize email task")?;

        info!(url_length = self.config.url.len(), "rabbitmq_publisher_connecting");

        let conn = Connection::connect(&self.config.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to RabbitMQ")?;

        let channel = conn
            .create_channel()
            .await
            .context("Failed to create channel")?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        channel
            .exchange_declare(
                &self.config.exchange_name,
                exchange_kind(&self.config.exchange_type),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .context("Failed to declare exchange")?;

        let confirmation = channel
            .basic_publish(
                &self.config.exchange_name,
                &self.config.routing_key,
                BasicPublishOptions::default(),
                &body,
                self.properties(),
            )
            .await
            .context("Failed to publish email task")?
            .await
            .context("Failed to confirm publish")?;

        if let Confirmation::Nack(_) = confirmation {
            anyhow::bail!("Broker rejected the published email task");
        }

        info!(
            exchange = %self.config.exchange_name,
            routing_key = %self.config.routing_key,
            to = %task.to,
            body_length = body.len(),
            "rabbitmq_task_published"
        );

        if let Err(e) = channel.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_channel_close_error");
        }

        if let Err(e) = conn.close(200, "Normal shutdown").await {
            warn!(error = %e, "rabbitmq_connection_close_error");
        }

        Ok(())
    }
}
