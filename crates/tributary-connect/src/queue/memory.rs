//! In-process queue with visibility-timeout semantics
//!
//! Behaves like SQS for the purposes of the consumer: received messages are
//! hidden for the visibility timeout and reappear unless deleted; each
//! receive issues a new receipt handle and invalidates the previous one.

use super::{QueueBackend, QueueMessage};
use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Debug)]
struct Entry {
    id: String,
    body: String,
    visible_at: Instant,
    receive_count: u32,
    receipt_handle: Option<String>,
}

/// In-memory queue
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    visibility_timeout: Duration,
    entries: Mutex<Vec<Entry>>,
    next_id: AtomicU64,
    next_handle: AtomicU64,
    deleted: AtomicU64,
    arrivals: Notify,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            visibility_timeout,
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_handle: AtomicU64::new(1),
            deleted: AtomicU64::new(0),
            arrivals: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a message, returning its id
    pub fn send(&self, body: impl Into<String>) -> String {
        let id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.lock().push(Entry {
            id: id.clone(),
            body: body.into(),
            visible_at: Instant::now(),
            receive_count: 0,
            receipt_handle: None,
        });
        self.arrivals.notify_waiters();
        id
    }

    /// Messages not yet deleted (visible or in flight)
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Messages currently hidden by a visibility timeout
    pub fn in_flight(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .iter()
            .filter(|e| e.visible_at > now)
            .count()
    }

    /// Total successful deletes
    pub fn deleted_count(&self) -> u64 {
        self.deleted.load(Ordering::Relaxed)
    }

    /// Receive count of a message still in the queue
    pub fn receive_count(&self, id: &str) -> Option<u32> {
        self.entries
            .lock()
            .iter()
            .find(|e| e.id == id)
            .map(|e| e.receive_count)
    }

    fn check_queue(&self, queue: &str) -> ConnectorResult<()> {
        if queue == self.name {
            Ok(())
        } else {
            Err(ConnectorError::Queue(format!("unknown queue '{}'", queue)))
        }
    }

    fn take_visible(&self, max: usize, hidden_for: Duration) -> Vec<QueueMessage> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let mut messages = Vec::new();

        for entry in entries.iter_mut().filter(|e| e.visible_at <= now).take(max) {
            let handle = format!(
                "{}#{}",
                entry.id,
                self.next_handle.fetch_add(1, Ordering::Relaxed)
            );
            entry.visible_at = now + hidden_for;
            entry.receive_count += 1;
            entry.receipt_handle = Some(handle.clone());
            messages.push(QueueMessage {
                id: entry.id.clone(),
                receipt_handle: handle,
                body: entry.body.clone(),
                receive_count: entry.receive_count,
            });
        }
        messages
    }

    /// Earliest instant at which a hidden message becomes visible again
    fn next_visible_at(&self) -> Option<Instant> {
        self.entries.lock().iter().map(|e| e.visible_at).min()
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn receive(
        &self,
        queue: &str,
        max: usize,
        wait: Duration,
        visibility: Option<u32>,
    ) -> ConnectorResult<Vec<QueueMessage>> {
        self.check_queue(queue)?;
        let deadline = Instant::now() + wait;
        let hidden_for = visibility.map_or(self.visibility_timeout, |seconds| {
            Duration::from_secs(u64::from(seconds))
        });

        loop {
            let notified = self.arrivals.notified();
            let messages = self.take_visible(max.max(1), hidden_for);
            if !messages.is_empty() {
                return Ok(messages);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let wake_at = self
                .next_visible_at()
                .filter(|at| *at > now)
                .map_or(deadline, |at| at.min(deadline));

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete(&self, queue: &str, receipt_handle: &str) -> ConnectorResult<()> {
        self.check_queue(queue)?;
        let mut entries = self.entries.lock();
        let position = entries
            .iter()
            .position(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                ConnectorError::Queue(format!("receipt handle '{}' is not valid", receipt_handle))
            })?;
        entries.remove(position);
        self.deleted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn extend_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> ConnectorResult<()> {
        self.check_queue(queue)?;
        let mut entries = self.entries.lock();
        let entry = entries
            .iter_mut()
            .find(|e| e.receipt_handle.as_deref() == Some(receipt_handle))
            .ok_or_else(|| {
                ConnectorError::Queue(format!("receipt handle '{}' is not valid", receipt_handle))
            })?;
        entry.visible_at = Instant::now() + Duration::from_secs(seconds as u64);
        if seconds == 0 {
            drop(entries);
            self.arrivals.notify_waiters();
        }
        Ok(())
    }
}
