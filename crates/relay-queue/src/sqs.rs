//! AWS SQS broker queue
//!
//! Long-poll fetch with visibility-timeout redelivery. `nack` is a no-op:
//! an unacknowledged message becomes visible again when its timeout lapses.

use async_trait::async_trait;
use aws_sdk_sqs::types::{MessageSystemAttributeName, QueueAttributeName};
use aws_sdk_sqs::Client;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

use crate::{BrokerQueue, QueueError, QueueMetrics, RawDelivery, Result};

/// SQS queue handle.
pub struct SqsBrokerQueue {
    client: Client,
    queue_url: String,
    queue_name: String,
    visibility_timeout_seconds: i32,
    wait_time_seconds: i32,
    running: AtomicBool,
}

impl SqsBrokerQueue {
    pub fn new(
        client: Client,
        queue_url: String,
        queue_name: String,
        visibility_timeout_seconds: u32,
        wait_time_seconds: u32,
    ) -> Self {
        Self {
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds: visibility_timeout_seconds as i32,
            // AWS caps long polling at 20 seconds
            wait_time_seconds: (wait_time_seconds as i32).clamp(0, 20),
            running: AtomicBool::new(true),
        }
    }

    /// Create from a queue URL, deriving the name from the last path segment.
    pub fn from_queue_url(
        client: Client,
        queue_url: String,
        visibility_timeout_seconds: u32,
        wait_time_seconds: u32,
    ) -> Self {
        let queue_name = queue_url
            .rsplit('/')
            .next()
            .unwrap_or("unknown")
            .to_string();

        Self::new(
            client,
            queue_url,
            queue_name,
            visibility_timeout_seconds,
            wait_time_seconds,
        )
    }

    fn is_invalid_handle_error(message: &str) -> bool {
        message.contains("ReceiptHandle") || message.contains("InvalidParameterValue")
    }
}

#[async_trait]
impl BrokerQueue for SqsBrokerQueue {
    fn identifier(&self) -> &str {
        &self.queue_name
    }

    async fn fetch(&self, max_messages: u32) -> Result<Vec<RawDelivery>> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(QueueError::Stopped);
        }

        let result = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(max_messages.min(10) as i32) // SQS max is 10
            .visibility_timeout(self.visibility_timeout_seconds)
            .wait_time_seconds(self.wait_time_seconds)
            .message_system_attribute_names(MessageSystemAttributeName::All)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let sqs_messages = result.messages.unwrap_or_default();
        let mut deliveries = Vec::with_capacity(sqs_messages.len());

        for sqs_msg in sqs_messages {
            let Some(receipt_handle) = sqs_msg.receipt_handle().map(str::to_string) else {
                continue;
            };

            let message_group_id = sqs_msg
                .attributes()
                .and_then(|attrs| attrs.get(&MessageSystemAttributeName::MessageGroupId))
                .cloned();

            deliveries.push(RawDelivery {
                body: sqs_msg.body().unwrap_or_default().as_bytes().to_vec(),
                receipt_handle,
                broker_message_id: sqs_msg.message_id().map(str::to_string),
                message_group_id,
            });
        }

        if !deliveries.is_empty() {
            debug!(
                queue = %self.queue_name,
                count = deliveries.len(),
                "Fetched messages from SQS"
            );
        }

        Ok(deliveries)
    }

    async fn ack(&self, receipt_handle: &str) -> Result<()> {
        let result = self
            .client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await;

        match result {
            Ok(_) => {
                debug!(queue = %self.queue_name, "Message deleted from SQS");
                Ok(())
            }
            Err(e) => {
                let message = e.to_string();
                // An expired receipt handle means the broker already re-offered
                // the message; the duplicate pass will complete it.
                if Self::is_invalid_handle_error(&message) {
                    debug!(queue = %self.queue_name, error = %message, "Delete with stale receipt handle ignored");
                    Ok(())
                } else {
                    Err(QueueError::Sqs(message))
                }
            }
        }
    }

    async fn nack(&self, _receipt_handle: &str) -> Result<()> {
        // Redelivery is driven by the visibility timeout.
        Ok(())
    }

    fn supports_visibility_control(&self) -> bool {
        true
    }

    async fn change_visibility(&self, receipt_handle: &str, seconds: u32) -> Result<()> {
        self.client
            .change_message_visibility()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt_handle)
            .visibility_timeout(seconds as i32)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        debug!(
            queue = %self.queue_name,
            seconds = seconds,
            "Changed message visibility in SQS"
        );
        Ok(())
    }

    async fn metrics(&self) -> Result<Option<QueueMetrics>> {
        let result = self
            .client
            .get_queue_attributes()
            .queue_url(&self.queue_url)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessages)
            .attribute_names(QueueAttributeName::ApproximateNumberOfMessagesNotVisible)
            .send()
            .await
            .map_err(|e| QueueError::Sqs(e.to_string()))?;

        let attributes = result.attributes();

        let pending_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let in_flight_messages = attributes
            .and_then(|attrs| attrs.get(&QueueAttributeName::ApproximateNumberOfMessagesNotVisible))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        Ok(Some(QueueMetrics {
            queue_identifier: self.queue_name.clone(),
            pending_messages,
            in_flight_messages,
        }))
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!(queue = %self.queue_name, "SQS broker queue stopped");
    }
}
