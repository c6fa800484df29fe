//! AWS SQS queue adapter.
//!
//! Long-polls a (FIFO) SQS queue, acks by deleting the message, and
//! nacks by shrinking the visibility timeout so the broker redelivers.

use async_trait::async_trait;
use aws_sdk_sqs::{types::QueueAttributeName, Client};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{parse_message, QueueConsumer, QueueError, Result};
use relay_common::{MessagePointer, QueueStats};

/// SQS allows at most 20 seconds of long-poll wait.
const MAX_WAIT_SECONDS: u64 = 20;
/// SQS returns at most 10 messages per receive call.
const MAX_BATCH: u32 = 10;

pub struct SqsQueueConsumer {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    running: AtomicBool,
    total_polled: AtomicU64,
    total_acked: AtomicU64,
    total_nacked: AtomicU64,
}

impl SqsQueueConsumer {
    pub fn new(
        client: Client,
        queue_url: String,
        queue_name: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            running: AtomicBool::new(true),
            total_polled: AtomicU64::new(0),
            total_acked: AtomicU64::new(0),
            total_nacked: AtomicU64::new(0),
        }
    }

    /// Create from a queue URL, deriving the queue name from its last
    /// path segment.
    pub fn from_queue_url(
        client: Client,
        queue_url: String,
        visibility_timeout_seconds: i32,
    ) -> Self {
        let queue_name = queue_url
            .split('/')
            .last()
            .unwrap_or("unknown")
            .to_string();
        Self::new(client, queue_url, queue_name, visibility_timeout_seconds)
    }
}

#[async_trait]
impl QueueConsumer for SqsQueueConsumer {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn poll(&self, max_messages: u32, wait: Duration) -> Result<Vec<MessagePointer>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let wait_seconds = wait.as_secs().min(MAX_WAIT_SECONDS) as i32;

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(MAX_BATCH) as i32)
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(wait_seconds)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut pointers = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in sqs_messages {
            let receipt = match sqs_msg.receipt_handle() {
                Some(r) => r.to_string(),
                None => {
                    error!(queue = %self.queue_name, "SQS delivery without receipt handle");
                    continue;
                }
            };

            let body = sqs_msg.body().unwrap_or_default();
            match parse_message(body) {
                Ok(message) => {
                    pointers.push(MessagePointer::new(
                        message,
                        receipt,
                        self.queue_name.clone(),
                    ));
                }
                Err(e) => {
                    // Nack so the broker's max-receive-count eventually
                    // moves the malformed message to its DLQ.
                    error!(
                        queue = %self.queue_name,
                        error = %e,
                        "Failed to parse SQS message body, nacking toward the DLQ"
                    );
                    let _ = self.nack(&receipt, None).await;
                }
            }
        }

        if !pointers.is_empty() {
            self.total_polled
                .fetch_add(pointers.len() as u64, Ordering::Relaxed);
            debug!(queue = %self.queue_name, count = pointers.len(), "Polled messages from SQS");
        }

        Ok(pointers)
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_acked.fetch_add(1, Ordering::Relaxed);
        debug!(queue = %self.queue_name, "Message acknowledged in SQS");
        Ok(())
    }

    async fn nack(&self, receipt: &str, delay_seconds: Option<u32>) -> Result<()> {
        // SQS has no native nack: shrink the visibility timeout so the
        // broker redelivers after the requested delay (0 = immediately).
        let visibility_timeout = delay_seconds.unwrap_or(0) as i32;

        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(visibility_timeout)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        self.total_nacked.fetch_add(1, Ordering::Relaxed);
        debug!(
            queue = %self.queue_name,
            visibility_timeout = visibility_timeout,
            "Message NACKed in SQS"
        );
        Ok(())
    }

    async fn extend_visibility(&self, receipt: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        debug!(queue = %self.queue_name, seconds = seconds, "Visibility extended in SQS");
        Ok(())
    }

    async fn stats(&self) -> Result<Option<QueueStats>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Broker(e.to_string()))?;

        let attributes = result.attributes();

        let pending = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let in_flight_at_broker = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(QueueStats {
            queue_identifier: self.queue_name.clone(),
            pending,
            in_flight_at_broker,
            total_polled: self.total_polled.load(Ordering::Relaxed),
            total_acked: self.total_acked.load(Ordering::Relaxed),
            total_nacked: self.total_nacked.load(Ordering::Relaxed),
        }))
    }

    fn is_healthy(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS queue consumer stopped");
    }
}
