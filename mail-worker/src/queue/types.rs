//! Wire format of an email task carried on the queue.

use serde::{Deserialize, Serialize};

/// One email to relay.
///
/// Field names match the JSON produced by existing publishers:
/// `{"to": "...", "title": "...", "body": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailTask {
    /// Recipient email address
    pub to: String,
    /// Subject line
    pub title: String,
    /// Plain text body
    pub body: String,
}

impl EmailTask {
    /// Create a new email task.
    pub fn new(to: impl Into<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            title: title.into(),
            body: body.into(),
        }
    }

    /// All three fields carry content.
    pub fn is_complete(&self) -> bool {
        !self.to.is_empty() && !self.title.is_empty() && !self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_task_wire_names() {
        let task = EmailTask::new("a@b.com", "Hi", "Hello");
        let json = serde_json::to_value(&task).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"to": "a@b.com", "title": "Hi", "body": "Hello"})
        );
    }

    #[test]
    fn test_is_complete() {
        assert!(EmailTask::new("a@b.com", "Hi", "Hello").is_complete());
        assert!(!EmailTask::new("a@b.com", "", "Hello").is_complete());
        assert!(!EmailTask::new("a@b.com", "Hi", "").is_complete());
        assert!(!EmailTask::new("", "Hi", "Hello").is_complete());
    }
}
