//! Per-delivery processing pipeline.
//!
//! Each delivery moves through decode → parse → type-check → validate →
//! dispatch and ends in exactly one broker resolution:
//!
//! | Failure                         | Outcome            |
//! |---------------------------------|--------------------|
//! | invalid UTF-8 / JSON / non-object | reject, drop     |
//! | recipient fails address grammar | reject, drop       |
//! | recipient refused by lettre     | reject, drop       |
//! | missing subject or body         | reject, requeue    |
//! | transport send failed           | reject, requeue    |
//! | panic while processing          | reject, requeue    |

use std::panic::AssertUnwindSafe;
use std::sync::LazyLock;

use async_trait::async_trait;
use futures::FutureExt;
use lapin::{
    options::{BasicAckOptions, BasicRejectOptions},
    Channel,
};
use lettre::message::Mailbox;
use regex::Regex;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::TaskError;
use crate::queue::EmailTask;

static RECIPIENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9_.+-]+@[A-Za-z0-9-]+\.[A-Za-z0-9.-]+$")
        .expect("recipient pattern is valid")
});

/// How a delivery is resolved with the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    RejectedNoRequeue,
    RejectedRequeue,
}

/// Outcome of one delivery plus the failure kind that led to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub outcome: Outcome,
    /// `None` when acked
    pub reason: Option<&'static str>,
}

impl Verdict {
    pub fn acked() -> Self {
        Self {
            outcome: Outcome::Acked,
            reason: None,
        }
    }

    pub fn from_error(e: &TaskError) -> Self {
        Self {
            outcome: e.outcome(),
            reason: Some(e.kind()),
        }
    }
}

/// Something that can hand an email to the mail gateway.
#[async_trait]
pub trait Dispatch: Send + Sync {
    /// True once the gateway accepted the message. Returns false on any
    /// failure; never panics or errors.
    async fn send(&self, subject: &str, body: &str, recipient: &str) -> bool;
}

/// Check a recipient against `local-part@domain.tld`.
pub fn is_valid_recipient(address: &str) -> bool {
    RECIPIENT_RE.is_match(address)
}

/// The grammar is looser than RFC 5322 (`a..b@c.com` matches it), so the
/// address must also be one lettre can put in a `To` header.
fn is_deliverable(address: &str) -> bool {
    is_valid_recipient(address) && address.parse::<Mailbox>().is_ok()
}

/// Decode a delivery body into a JSON value.
///
/// A payload that is itself a JSON string is parsed once more, for producers
/// that double-encode. No further passes are made.
pub fn decode_payload(payload: &[u8]) -> Result<Value, TaskError> {
    let text = std::str::from_utf8(payload)
        .map_err(|e| TaskError::MalformedPayload(format!("invalid UTF-8: {e}")))?;

    let value: Value = serde_json::from_str(text)
        .map_err(|e| TaskError::MalformedPayload(format!("invalid JSON: {e}")))?;

    match value {
        Value::String(inner) => serde_json::from_str(&inner)
            .map_err(|e| TaskError::MalformedPayload(format!("invalid nested JSON: {e}"))),
        other => Ok(other),
    }
}

/// Pull a validated [`EmailTask`] out of a decoded payload.
pub fn extract_task(value: &Value) -> Result<EmailTask, TaskError> {
    let fields = value
        .as_object()
        .ok_or_else(|| TaskError::MalformedPayload(format!("expected an object, got {value}")))?;

    let text = |key: &str| fields.get(key).and_then(Value::as_str).unwrap_or_default();

    let to = text("to");
    if !is_deliverable(to) {
        let shown = fields.get("to").map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        });
        return Err(TaskError::InvalidRecipient(shown));
    }

    let task = EmailTask::new(to, text("title"), text("body"));
    if !task.is_complete() {
        return Err(TaskError::IncompleteTask);
    }

    Ok(task)
}

/// Run the pipeline for one payload, dispatching through `dispatcher`.
pub async fn process<D>(payload: &[u8], dispatcher: &D) -> Result<EmailTask, TaskError>
where
    D: Dispatch + ?Sized,
{
    let value = decode_payload(payload)?;
    let task = extract_task(&value)?;

    if dispatcher.send(&task.title, &task.body, &task.to).await {
        Ok(task)
    } else {
        Err(TaskError::TransportFailure)
    }
}

/// Process one payload and decide its outcome.
///
/// Panics raised while processing are contained here and requeue the
/// delivery.
pub async fn handle<D>(payload: &[u8], dispatcher: &D) -> Verdict
where
    D: Dispatch + ?Sized,
{
    let result = AssertUnwindSafe(process(payload, dispatcher))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            Err(TaskError::UnexpectedProcessingFault(reason))
        });

    match result {
        Ok(task) => {
            info!(to = %task.to, title = %task.title, "email_task_processed");
            Verdict::acked()
        }
        Err(e) => {
            if e.is_permanent() {
                warn!(reason = e.kind(), error = %e, "email_task_discarded");
            } else {
                error!(reason = e.kind(), error = %e, "email_task_failed");
            }
            Verdict::from_error(&e)
        }
    }
}

/// Resolve a delivery with the broker: one ack or one reject.
pub async fn resolve(channel: &Channel, delivery_tag: u64, verdict: Verdict) {
    let outcome = verdict.outcome;
    let result = match outcome {
        Outcome::Acked => {
            channel
                .basic_ack(delivery_tag, BasicAckOptions::default())
                .await
        }
        Outcome::RejectedNoRequeue | Outcome::RejectedRequeue => {
            channel
                .basic_reject(
                    delivery_tag,
                    BasicRejectOptions {
                        requeue: outcome == Outcome::RejectedRequeue,
                    },
                )
                .await
        }
    };

    match result {
        Ok(()) if outcome == Outcome::Acked => {
            info!(delivery_tag = delivery_tag, "email_task_acked");
        }
        Ok(()) => {
            info!(
                delivery_tag = delivery_tag,
                requeue = outcome == Outcome::RejectedRequeue,
                reason = verdict.reason.unwrap_or("unknown"),
                "email_task_rejected"
            );
        }
        Err(e) => {
            error!(
                delivery_tag = delivery_tag,
                outcome = ?outcome,
                reason = ?verdict.reason,
                error = %e,
                "rabbitmq_resolve_failed"
            );
        }
    }
}
