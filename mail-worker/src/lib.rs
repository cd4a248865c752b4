//! MailRelay - reliable queue-driven email dispatcher.
//!
//! Consumes email tasks from RabbitMQ and relays each one over a persistent
//! SMTP session, acknowledging or rejecting the delivery depending on the
//! outcome.
//!
//! - `mail-dispatcher`: the consumer
//! - `mail-enqueue`: publishes a single task
//!
//! ## Architecture
//!
//! ```text
//! Producer → email_exchange → email_queue → consumer → processor → TransportSession → SMTP
//!                                              ↑                         |
//!                                              └──── ack / reject ───────┘
//! ```

pub mod broker;
pub mod config;
pub mod consumer;
pub mod error;
pub mod processor;
pub mod queue;
pub mod shutdown;
pub mod transport;

// Re-export commonly used types
pub use broker::{Broker, RetryPolicy};
pub use config::Config;
pub use error::{BrokerError, TaskError, TransportError};
pub use processor::{handle, Dispatch, Outcome, Verdict};
pub use queue::{EmailTask, Publisher};
pub use transport::TransportSession;
