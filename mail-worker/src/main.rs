//! MailRelay Dispatcher - RabbitMQ consumer relaying email tasks over SMTP.
//!
//! Reads email tasks from the configured queue, validates them and sends them
//! through a persistent SMTP session. Exits non-zero when the broker cannot be
//! reached within the retry budget.

use anyhow::Result;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailrelay::{consumer, Config};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    tracing::info!("dispatcher_starting");

    // Load configuration from environment
    let config = Config::from_env();
    tracing::info!(
        rabbitmq_url_set = !config.broker.url.is_empty(),
        exchange = %config.broker.exchange_name,
        queue = %config.broker.queue_name,
        smtp_host = %config.smtp.host,
        smtp_port = config.smtp.port,
        smtp_tls = ?config.smtp.tls,
        smtp_auth = !config.smtp.username.is_empty(),
        concurrency = config.worker_concurrency,
        "config_loaded"
    );

    if let Err(e) = consumer::run(config).await {
        tracing::error!(error = %format!("{e:#}"), "dispatcher_failed");
        return Err(e);
    }

    Ok(())
}
