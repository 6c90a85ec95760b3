//! Notification queues
//!
//! The object-queue consumer needs three operations from a queue:
//! long-poll `receive`, `delete` after successful processing, and
//! `extend_visibility` to keep a slow message hidden from other consumers.
//!
//! Backends:
//! - [`MemoryQueue`]: in-process queue with visibility semantics
//! - `SqsQueue`: Amazon SQS (feature `sqs`)

pub mod consumer;
pub mod memory;
#[cfg(feature = "sqs")]
pub mod sqs;

pub use consumer::{QueueConsumer, QueueConsumerConfig};
pub use memory::MemoryQueue;
#[cfg(feature = "sqs")]
pub use sqs::SqsQueue;

use crate::error::ConnectorResult;
use async_trait::async_trait;
use std::time::Duration;

/// A received queue message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: String,
    /// Handle for delete / visibility calls; changes on every receive
    pub receipt_handle: String,
    pub body: String,
    /// How many times this message has been received, this time included
    pub receive_count: u32,
}

/// Queue operations required by [`QueueConsumer`]
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Receive up to `max` messages, waiting up to `wait` for the first one.
    ///
    /// Received messages stay hidden for `visibility` seconds, or for the
    /// queue's own default when `None`.
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
        visibility: Option<u32>,
    ) -> ConnectorResult<Vec<QueueMessage>>;

    /// Acknowledge a message
    async fn delete(&self, queue: &str, receipt_handle: &str) -> ConnectorResult<()>;

    /// Hide a message for `seconds` more; 0 makes it visible again immediately
    async fn extend_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> ConnectorResult<()>;
}
