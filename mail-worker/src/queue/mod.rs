//! Queue module for the email task wire format and the producer side.
//!
//! ```text
//! mail-enqueue → email_exchange --email_routing--> email_queue → mail-dispatcher → SMTP
//! ```

pub mod publisher;
pub mod types;

pub use publisher::Publisher;
pub use types::EmailTask;
