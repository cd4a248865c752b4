//! Error types for the broker, the mail transport and per-message processing.

use thiserror::Error;

use crate::processor::Outcome;

/// Failures talking to RabbitMQ.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Retry budget exhausted while connecting. Fatal at startup.
    #[error("broker unavailable after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },

    #[error("failed to declare {resource}: {source}")]
    Topology {
        resource: &'static str,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to start consumer: {0}")]
    Consume(#[source] lapin::Error),
}

/// Failures talking to the mail gateway.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("SMTP connect failed: {0}")]
    Connect(String),

    #[error("SMTP authentication failed: {0}")]
    Auth(String),

    #[error("SMTP submission failed: {0}")]
    Submit(String),

    #[error("invalid message: {0}")]
    Message(String),

    #[error("session is closed")]
    Closed,
}

/// Why a delivery was not acknowledged.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid recipient address: {0:?}")]
    InvalidRecipient(Option<String>),

    #[error("incomplete email data in the task")]
    IncompleteTask,

    #[error("transport failed to send the email")]
    TransportFailure,

    #[error("unexpected processing fault: {0}")]
    UnexpectedProcessingFault(String),
}

impl TaskError {
    /// Permanent errors are dropped; everything else goes back to the queue.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TaskError::MalformedPayload(_) | TaskError::InvalidRecipient(_)
        )
    }

    /// Broker resolution for this error.
    pub fn outcome(&self) -> Outcome {
        if self.is_permanent() {
            Outcome::RejectedNoRequeue
        } else {
            Outcome::RejectedRequeue
        }
    }

    /// Short label used as the `reason` log field.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskError::MalformedPayload(_) => "malformed_payload",
            TaskError::InvalidRecipient(_) => "invalid_recipient",
            TaskError::IncompleteTask => "incomplete_task",
            TaskError::TransportFailure => "transport_failure",
            TaskError::UnexpectedProcessingFault(_) => "unexpected_fault",
        }
    }
}
