//! Dispatch queue interface.
//!
//! The submission path enqueues one message per run; workers long-poll for
//! messages and acknowledge them after finalize. A message that is received
//! but never acked becomes visible again after its visibility timeout, which
//! is how a crashed worker's message gets redelivered. Messages carry no
//! money values - workers read authoritative amounts from the run store.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use packflow_core::{PackKind, RunId, TenantId};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue error: {0}")]
    Queue(String),
}

/// Wire message telling a worker to pick up a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchMessage {
    pub run_id: RunId,
    pub tenant_id: TenantId,
    pub pack_kind: PackKind,
    pub lease_ttl_seconds: u64,
}

/// A received message plus the receipt needed to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub receipt: String,
    pub message: DispatchMessage,
}

/// Narrow queue surface used by the core.
#[async_trait]
pub trait DispatchQueue: Send + Sync {
    /// Enqueue a dispatch message; returns the message id.
    async fn enqueue(&self, message: DispatchMessage) -> Result<String, QueueError>;

    /// Long-poll for one message, waiting up to `wait`.
    ///
    /// A delivered message is invisible to other consumers for
    /// `visibility_timeout`, then redelivered unless acked.
    async fn receive(
        &self,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError>;

    /// Acknowledge (delete) a received message.
    async fn ack(&self, receipt: &str) -> Result<(), QueueError>;
}

#[async_trait]
impl<Q> DispatchQueue for std::sync::Arc<Q>
where
    Q: DispatchQueue + ?Sized,
{
    async fn enqueue(&self, message: DispatchMessage) -> Result<String, QueueError> {
        (**self).enqueue(message).await
    }

    async fn receive(
        &self,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        (**self).receive(wait, visibility_timeout).await
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        (**self).ack(receipt).await
    }
}

#[derive(Debug)]
struct QueueEntry {
    message: DispatchMessage,
    visible_at: Instant,
    receipt: Option<String>,
}

/// In-memory dispatch queue with visibility timeouts, for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDispatchQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
}

impl InMemoryDispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages currently in the queue, visible or not.
    pub fn depth(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    fn try_receive(&self, visibility_timeout: Duration) -> Result<Option<QueuedMessage>, QueueError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| QueueError::Queue("lock poisoned".to_string()))?;

        let now = Instant::now();
        for entry in entries.iter_mut() {
            if entry.visible_at <= now {
                let receipt = Uuid::new_v4().to_string();
                entry.visible_at = now + visibility_timeout;
                entry.receipt = Some(receipt.clone());
                return Ok(Some(QueuedMessage {
                    receipt,
                    message: entry.message.clone(),
                }));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl DispatchQueue for InMemoryDispatchQueue {
    async fn enqueue(&self, message: DispatchMessage) -> Result<String, QueueError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| QueueError::Queue("lock poisoned".to_string()))?;
        let id = Uuid::new_v4().to_string();
        entries.push_back(QueueEntry {
            message,
            visible_at: Instant::now(),
            receipt: None,
        });
        Ok(id)
    }

    async fn receive(
        &self,
        wait: Duration,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(received) = self.try_receive(visibility_timeout)? {
                return Ok(Some(received));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn ack(&self, receipt: &str) -> Result<(), QueueError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| QueueError::Queue("lock poisoned".to_string()))?;
        entries.retain(|e| e.receipt.as_deref() != Some(receipt));
        Ok(())
    }
}
