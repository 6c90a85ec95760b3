//! Batched intake forwarder
//!
//! Records are POSTed to the intake as
//! `{"intake_key": "...", "events": ["<record>", ...]}` in batches bounded
//! by record count and serialized size. A push is acknowledged only once
//! every batch it produced was accepted with a 2xx.
//!
//! Two implementations of [`Forwarder`]:
//!
//! - [`IntakeForwarder`]: splits each push into batches and sends them in
//!   order on the caller's task
//! - [`BatchingForwarder`]: hands pushes to a background task that merges
//!   pushes from many callers and also seals on linger time. The request
//!   channel is bounded, so callers block while the intake is slow.
//!
//! ```text
//! push(records) ─▶ admit (drop > max_record_bytes, non-UTF-8) ─▶ Batcher ─▶ POST ─▶ ack
//!                                                       │
//!                          seal on count / bytes / linger
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use crate::http::HttpClient;
use crate::metrics::ConnectorMetrics;
use crate::types::{Record, SensitiveString};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Result of a successful push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushAck {
    /// Records accepted by the intake
    pub accepted: usize,
    /// Records dropped for exceeding the hard size limit or not being UTF-8
    pub dropped: usize,
    /// Batches sent
    pub batches: usize,
}

/// Accepts records for delivery to the intake
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Returns once every record was accepted by the intake, or fails with
    /// [`ConnectorError::IntakeUnavailable`].
    async fn push(&self, records: Vec<Record>) -> ConnectorResult<PushAck>;
}

/// Intake endpoint and batching limits
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    pub intake_url: String,
    pub intake_key: SensitiveString,
    pub max_batch_count: usize,
    pub max_batch_bytes: usize,
    pub max_linger: Duration,
    /// Hard per-record limit of the intake
    pub max_record_bytes: usize,
    /// Pending pushes before callers of [`BatchingForwarder`] block
    pub channel_capacity: usize,
}

impl ForwarderConfig {
    pub fn new(intake_url: impl Into<String>, intake_key: SensitiveString) -> Self {
        Self {
            intake_url: intake_url.into(),
            intake_key,
            max_batch_count: 1000,
            max_batch_bytes: 1024 * 1024,
            max_linger: Duration::from_secs(5),
            max_record_bytes: 4 * 1024 * 1024,
            channel_capacity: 64,
        }
    }
}

/// Accumulates records into count- and byte-bounded batches
#[derive(Debug)]
pub struct Batcher {
    max_count: usize,
    max_bytes: usize,
    records: Vec<Record>,
    bytes: usize,
}

impl Batcher {
    pub fn new(max_count: usize, max_bytes: usize) -> Self {
        Self {
            max_count: max_count.max(1),
            max_bytes: max_bytes.max(1),
            records: Vec::new(),
            bytes: 0,
        }
    }

    /// Add a record, appending any sealed batches to `sealed`.
    ///
    /// A record larger than `max_bytes` is sealed alone, after whatever was
    /// pending.
    pub fn add(&mut self, record: Record, sealed: &mut Vec<Vec<Record>>) {
        let size = record.encoded_len();

        if size >= self.max_bytes {
            if let Some(batch) = self.flush() {
                sealed.push(batch);
            }
            sealed.push(vec![record]);
            return;
        }

        if self.bytes + size > self.max_bytes {
            if let Some(batch) = self.flush() {
                sealed.push(batch);
            }
        }

        self.bytes += size;
        self.records.push(record);

        if self.records.len() >= self.max_count || self.bytes >= self.max_bytes {
            if let Some(batch) = self.flush() {
                sealed.push(batch);
            }
        }
    }

    /// Take the pending batch
    pub fn flush(&mut self) -> Option<Vec<Record>> {
        if self.records.is_empty() {
            return None;
        }
        self.bytes = 0;
        Some(std::mem::take(&mut self.records))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pending_bytes(&self) -> usize {
        self.bytes
    }
}

#[derive(Serialize)]
struct IntakeBody<'a> {
    intake_key: &'a str,
    events: Vec<std::borrow::Cow<'a, str>>,
}

/// Sends batches straight to the intake
#[derive(Debug, Clone)]
pub struct IntakeForwarder {
    http: HttpClient,
    config: ForwarderConfig,
    metrics: Arc<ConnectorMetrics>,
}

impl IntakeForwarder {
    pub fn new(http: HttpClient, config: ForwarderConfig, metrics: Arc<ConnectorMetrics>) -> Self {
        Self {
            http,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ForwarderConfig {
        &self.config
    }

    /// Drop records the intake cannot take (over the hard limit once
    /// escaped, or not UTF-8), logging each one
    fn admit(&self, records: Vec<Record>) -> (Vec<Record>, usize) {
        let limit = self.config.max_record_bytes;
        let total = records.len();
        let admitted: Vec<Record> = records
            .into_iter()
            .filter(|record| {
                if !record.is_utf8() {
                    warn!(size = record.len(), "Dropping record that is not valid UTF-8");
                    return false;
                }
                let size = record.escaped_len();
                if size > limit {
                    error!(size, limit, "Dropping record larger than the intake limit");
                    return false;
                }
                true
            })
            .collect();
        let dropped = total - admitted.len();
        self.metrics.record_events_discarded(dropped);
        (admitted, dropped)
    }

    /// Bytes of an intake body holding no events
    fn envelope_len(&self) -> usize {
        let empty = IntakeBody {
            intake_key: self.config.intake_key.expose_secret(),
            events: Vec::new(),
        };
        serde_json::to_vec(&empty).map_or(0, |body| body.len())
    }

    fn plan(&self, records: Vec<Record>) -> Vec<Vec<Record>> {
        let budget = self
            .config
            .max_batch_bytes
            .saturating_sub(self.envelope_len());
        let mut batcher = Batcher::new(self.config.max_batch_count, budget);
        let mut batches = Vec::new();
        for record in records {
            batcher.add(record, &mut batches);
        }
        if let Some(batch) = batcher.flush() {
            batches.push(batch);
        }
        batches
    }

    /// POST one batch
    pub async fn send_batch(&self, batch: &[Record]) -> ConnectorResult<()> {
        let body = IntakeBody {
            intake_key: self.config.intake_key.expose_secret(),
            events: batch.iter().map(Record::as_str_lossy).collect(),
        };

        let start = std::time::Instant::now();
        self.http
            .post_json(&self.config.intake_url, &body)
            .await
            .map_err(|e| {
                ConnectorError::IntakeUnavailable(format!(
                    "batch of {} events rejected: {}",
                    batch.len(),
                    e
                ))
            })?;

        let elapsed = start.elapsed();
        self.metrics.record_batch_forwarded(batch.len(), elapsed);
        debug!(events = batch.len(), elapsed_ms = elapsed.as_millis() as u64, "Batch accepted by intake");
        Ok(())
    }

    async fn send_admitted(&self, records: Vec<Record>) -> ConnectorResult<PushAck> {
        let mut ack = PushAck::default();
        for batch in self.plan(records) {
            self.send_batch(&batch).await?;
            ack.accepted += batch.len();
            ack.batches += 1;
        }
        Ok(ack)
    }
}

#[async_trait]
impl Forwarder for IntakeForwarder {
    async fn push(&self, records: Vec<Record>) -> ConnectorResult<PushAck> {
        let (records, dropped) = self.admit(records);
        let mut ack = self.send_admitted(records).await?;
        ack.dropped = dropped;
        Ok(ack)
    }
}

struct PushRequest {
    records: Vec<Record>,
    ack: oneshot::Sender<ConnectorResult<PushAck>>,
}

struct Waiter {
    ack: oneshot::Sender<ConnectorResult<PushAck>>,
    accepted: usize,
    dropped: usize,
}

/// Handle to a background batching task
#[derive(Debug, Clone)]
pub struct BatchingForwarder {
    tx: mpsc::Sender<PushRequest>,
}

impl BatchingForwarder {
    /// Start the batching task. It exits once every handle is dropped,
    /// after sending what is pending.
    pub fn spawn(inner: IntakeForwarder) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(inner.config.channel_capacity.max(1));
        let handle = tokio::spawn(batching_loop(inner, rx));
        (Self { tx }, handle)
    }
}

#[async_trait]
impl Forwarder for BatchingForwarder {
    async fn push(&self, records: Vec<Record>) -> ConnectorResult<PushAck> {
        if records.is_empty() {
            return Ok(PushAck::default());
        }
        let (ack, rx) = oneshot::channel();
        self.tx
            .send(PushRequest { records, ack })
            .await
            .map_err(|_| ConnectorError::IntakeUnavailable("forwarder stopped".into()))?;
        rx.await
            .map_err(|_| ConnectorError::IntakeUnavailable("forwarder stopped".into()))?
    }
}

async fn batching_loop(inner: IntakeForwarder, mut rx: mpsc::Receiver<PushRequest>) {
    let linger = inner.config.max_linger;
    let max_count = inner.config.max_batch_count.max(1);
    let max_bytes = inner
        .config
        .max_batch_bytes
        .saturating_sub(inner.envelope_len())
        .max(1);

    let mut pending: Vec<Record> = Vec::new();
    let mut pending_bytes = 0usize;
    let mut waiters: Vec<Waiter> = Vec::new();
    let mut deadline: Option<Instant> = None;

    loop {
        let request = match deadline {
            Some(at) => tokio::select! {
                request = rx.recv() => request,
                _ = tokio::time::sleep_until(at) => {
                    flush(&inner, &mut pending, &mut pending_bytes, &mut waiters).await;
                    deadline = None;
                    continue;
                }
            },
            None => rx.recv().await,
        };

        let Some(PushRequest { records, ack }) = request else {
            flush(&inner, &mut pending, &mut pending_bytes, &mut waiters).await;
            debug!("Batching forwarder stopped");
            return;
        };

        let (records, dropped) = inner.admit(records);
        if records.is_empty() {
            let _ = ack.send(Ok(PushAck {
                dropped,
                ..Default::default()
            }));
            continue;
        }

        if pending.is_empty() {
            deadline = Some(Instant::now() + linger);
        }
        pending_bytes += records.iter().map(Record::encoded_len).sum::<usize>();
        waiters.push(Waiter {
            ack,
            accepted: records.len(),
            dropped,
        });
        pending.extend(records);

        if pending.len() >= max_count || pending_bytes >= max_bytes {
            flush(&inner, &mut pending, &mut pending_bytes, &mut waiters).await;
            deadline = None;
        }
    }
}

async fn flush(
    inner: &IntakeForwarder,
    pending: &mut Vec<Record>,
    pending_bytes: &mut usize,
    waiters: &mut Vec<Waiter>,
) {
    if pending.is_empty() {
        return;
    }
    let records = std::mem::take(pending);
    *pending_bytes = 0;

    let result = inner.send_admitted(records).await;
    if let Err(e) = &result {
        warn!(error = %e, waiters = waiters.len(), "Batched push failed");
    }
    let batches = result.as_ref().map(|ack| ack.batches).unwrap_or_default();

    for waiter in waiters.drain(..) {
        let outcome = match &result {
            Ok(_) => Ok(PushAck {
                accepted: waiter.accepted,
                dropped: waiter.dropped,
                batches,
            }),
            Err(e) => Err(ConnectorError::IntakeUnavailable(e.to_string())),
        };
        let _ = waiter.ack.send(outcome);
    }
}
