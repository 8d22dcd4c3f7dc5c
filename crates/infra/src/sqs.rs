//! SQS-backed dispatch queue.
//!
//! One JSON message per run; long-polling via `wait_time_seconds`, at-least-
//! once delivery via the visibility timeout, deletion on ack. Malformed
//! bodies are surfaced as errors so they land in the queue's dead-letter
//! policy rather than being silently dropped.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::Client;

use crate::queue::{DispatchMessage, DispatchQueue, QueueError, QueuedMessage};

/// Configuration for the SQS dispatch queue.
#[derive(Debug, Clone)]
pub struct SqsDispatchQueueConfig {
    pub queue_url: String,
    pub region: Option<String>,
    /// Custom endpoint URL (localstack and friends).
    pub endpoint: Option<String>,
}

/// SQS-backed dispatch queue.
#[derive(Debug, Clone)]
pub struct SqsDispatchQueue {
    client: Client,
    queue_url: String,
}

impl SqsDispatchQueue {
    pub async fn new(config: SqsDispatchQueueConfig) -> Result<Self, QueueError> {
        if config.queue_url.trim().is_empty() {
            return Err(QueueError::Queue("queue url must be set".to_string()));
        }

        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared_config = loader.load().await;

        Ok(Self {
            client: Client::new(&shared_config),
            queue_url: config.queue_url,
        })
    }
}

#[async_trait]
impl DispatchQueue for SqsDispatchQueue {
    async fn enqueue(&self, message: DispatchMessage) -> Result<String, QueueError> {
        let body = serde_json::to_string(&message)
            .map_err(|e| QueueError::Queue(format!("serialize dispatch message: {e}")))?;

        let sent = self
            .client
            .send_message()
            .queue_url(&self.queue_url)
            .message_body(body)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("send_message: {e}")))?;

        Ok(sent.message_id().unwrap_or_default().to_string())
    }

    async fn receive(
        &self,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let received = self
            .client
            .receive_message()
            .queue_url(&self.queue_url)
            .max_number_of_messages(1)
            .wait_time_seconds(wait.as_secs().min(20) as i32)
            .visibility_timeout(visibility_timeout.as_secs() as i32)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("receive_message: {e}")))?;

        let Some(message) = received.messages().first() else {
            return Ok(None);
        };

        let receipt = message
            .receipt_handle()
            .ok_or_else(|| QueueError::Queue("message without receipt handle".to_string()))?
            .to_string();
        let body = message
            .body()
            .ok_or_else(|| QueueError::Queue("message without body".to_string()))?;
        let parsed: DispatchMessage = serde_json::from_str(body)
            .map_err(|e| QueueError::Queue(format!("malformed dispatch message: {e}")))?;

        Ok(Some(QueuedMessage {
            receipt,
            message: parsed,
        }))
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        self.client
            .delete_message()
            .queue_url(&self.queue_url)
            .receipt_handle(receipt)
            .send()
            .await
            .map_err(|e| QueueError::Queue(format!("delete_message: {e}")))?;
        Ok(())
    }
}
