//! RabbitMQ consumer loop.
//!
//! Connects the SMTP session and the broker, consumes email tasks and spawns
//! one tracked task per delivery. Every task races its processing against
//! the shared cancellation token; a delivery whose processing finishes is
//! resolved exactly once, a cancelled one is left to broker redelivery.

use std::sync::Arc;

use anyhow::{Context, Result};
use futures::StreamExt;
use tracing::{error, info, warn};

use crate::broker::Broker;
use crate::config::Config;
use crate::processor::{handle, resolve, Dispatch};
use crate::shutdown::{wait_for_signal, ShutdownCoordinator, TaskSet};
use crate::transport::{SmtpConnector, TransportSession};

/// Run the dispatcher until SIGINT/SIGTERM or until the broker closes the
/// consumer.
///
/// 1. Opens the SMTP session (a failure here is retried on first send)
/// 2. Connects to RabbitMQ with backoff and declares topology
/// 3. Consumes deliveries, one task each
/// 4. Hands everything to the shutdown coordinator
pub async fn run(config: Config) -> Result<()> {
    let session = TransportSession::new(SmtpConnector::new(config.smtp.clone()), &config.smtp.sender)
        .context("Failed to create SMTP session")?;
    let session = Arc::new(session);

    if session.open().await {
        info!(host = %config.smtp.host, "smtp_session_ready");
    }

    let prefetch = u16::try_from(config.worker_concurrency).unwrap_or(u16::MAX);
    let broker = Broker::connect(&config.broker, prefetch)
        .await
        .context("Failed to connect to RabbitMQ")?;

    let mut consumer = broker
        .consume(&config.broker.queue_name)
        .await
        .context("Failed to start consumer")?;

    let channel = Arc::new(broker.channel().clone());
    let dispatcher: Arc<dyn Dispatch> = session.clone();

    info!(
        queue = %config.broker.queue_name,
        routing_key = %config.broker.routing_key,
        "worker_ready"
    );

    let mut tasks = TaskSet::new();

    let shutdown = wait_for_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            signal = &mut shutdown => {
                info!(signal = signal, "worker_stopping");
                break;
            }
            delivery = consumer.next() => {
                match delivery {
                    Some(Ok(delivery)) => {
                        let delivery_tag = delivery.delivery_tag;

                        info!(
                            queue = %config.broker.queue_name,
                            delivery_tag = delivery_tag,
                            redelivered = delivery.redelivered,
                            body_length = delivery.data.len(),
                            "email_task_received"
                        );

                        let channel = Arc::clone(&channel);
                        let dispatcher = Arc::clone(&dispatcher);
                        let token = tasks.token();

                        tasks.spawn(async move {
                            tokio::select! {
                                _ = token.cancelled() => {
                                    warn!(delivery_tag = delivery_tag, "email_task_cancelled");
                                }
                                verdict = handle(&delivery.data, dispatcher.as_ref()) => {
                                    resolve(&channel, delivery_tag, verdict).await;
                                }
                            }
                        });
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "rabbitmq_delivery_error");
                    }
                    None => {
                        warn!("rabbitmq_consumer_closed");
                        break;
                    }
                }
            }
        }

        tasks.reap();
    }

    let (connection, channel) = broker.into_parts();

    ShutdownCoordinator::new(tasks)
        .then(channel)
        .then(connection)
        .then(session)
        .run()
        .await;

    info!("worker_shutdown_complete");
    Ok(())
}
