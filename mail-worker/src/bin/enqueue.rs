//! MailRelay Enqueue - publish a single email task.
//!
//! Usage: `mail-enqueue <to> <title> <body>`
//!
//! Uses the same `RABBITMQ_*` environment as the dispatcher and publishes
//! once, without retry.

use anyhow::{bail, Result};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailrelay::{Config, EmailTask, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let [to, title, body] = args.as_slice() else {
        bail!("usage: mail-enqueue <to> <title> <body>");
    };

    let config = Config::from_env();
    let publisher = Publisher::new(config.broker);

    publisher
        .publish_task(&EmailTask::new(to.as_str(), title.as_str(), body.as_str()))
        .await?;

    info!(to = %to, "enqueue_complete");
    Ok(())
}
