//! Queue adapters for the message router.
//!
//! `QueueConsumer` abstracts the external FIFO queue: long-poll delivery,
//! finalisation (ack/nack), visibility control, and depth reporting.
//! Adapters exist for AWS SQS (`sqs` feature), AMQP brokers (`amqp`
//! feature), and an embedded SQLite queue for development (`sqlite`
//! feature).

use async_trait::async_trait;
use std::time::Duration;

use relay_common::{Message, MessagePointer, QueueStats};

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqs")]
pub mod sqs;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use error::QueueError;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Decode a raw queue body into a [`Message`].
///
/// Shared by every adapter so the wire format is parsed in one place.
pub fn parse_message(body: &str) -> Result<Message> {
    let message: Message = serde_json::from_str(body)?;
    if message.id.is_empty() {
        return Err(QueueError::Malformed("message id is empty".to_string()));
    }
    if message.mediation_target.is_empty() {
        return Err(QueueError::Malformed(format!(
            "message [{}] has no mediation target",
            message.id
        )));
    }
    Ok(message)
}

/// Trait for consuming messages from a queue.
#[async_trait]
pub trait QueueConsumer: Send + Sync {
    /// Unique identifier for this consumer (queue name).
    fn identifier(&self) -> &str;

    /// Long-poll for messages. May return an empty list.
    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<MessagePointer>>;

    /// Acknowledge a message (remove from the queue).
    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Negative-acknowledge: make the message visible again after the
    /// optional delay. Brokers without native nack shorten the
    /// visibility timeout instead.
    async fn nack(&self, receipt: &str, delay_seconds: Option<u32>) -> Result<()>;

    /// Extend the visibility timeout for a message still being processed.
    async fn extend_visibility(&self, receipt: &str, seconds: u32) -> Result<()>;

    /// Queue depth and consumer counters. None when the broker cannot
    /// report depth.
    async fn stats(&self) -> Result<Option<QueueStats>> {
        Ok(None)
    }

    fn is_healthy(&self) -> bool;

    async fn stop(&self);
}

/// Trait for publishing messages onto a queue (embedded/dev adapters).
#[async_trait]
pub trait QueuePublisher: Send + Sync {
    fn identifier(&self) -> &str;

    async fn publish(&self, message: Message) -> Result<String>;

    async fn publish_batch(&self, messages: Vec<Message>) -> Result<Vec<String>>;
}
