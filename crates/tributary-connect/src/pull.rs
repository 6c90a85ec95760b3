//! Pull connectors
//!
//! A [`PullConnector`] periodically queries a vendor API through a
//! [`PullSource`], forwards what it gets and persists how far it got.
//!
//! Each iteration:
//!
//! 1. load the cursor (or derive the initial one from `now - max_lookback`)
//!    and clamp it into the lookback window
//! 2. fetch pages from that cursor until the source has no next page or
//!    `max_pages_per_iteration` is reached
//! 3. per page: drop records at or before the cursor boundary, push the
//!    rest, then save the advanced cursor
//! 4. sleep `frequency`, or return if stopped
//!
//! The cursor is saved only after the forwarder acknowledged the page, so a
//! failed push replays the page on the next iteration. A stop request is
//! honoured between pages.

use crate::checkpoint::{next_second, CheckpointStore, Cursor, CursorKind};
use crate::error::{ConnectorError, ConnectorResult};
use crate::forwarder::Forwarder;
use crate::metrics::ConnectorMetrics;
use crate::types::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Request for one page of vendor data
#[derive(Debug, Clone, Copy)]
pub struct PageRequest<'a> {
    /// Cursor the iteration started from
    pub cursor: &'a Cursor,
    /// Continuation token from the previous page of this iteration
    pub page_token: Option<&'a str>,
    pub page_size: usize,
}

/// One page of vendor data
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Records in vendor order
    pub records: Vec<Record>,
    /// Continuation token; `None` on the last page
    pub next_page: Option<String>,
    /// Position reported by the vendor (markers, file ids)
    pub cursor: Option<Cursor>,
}

/// Vendor API adapter
#[async_trait]
pub trait PullSource: Send + Sync {
    fn name(&self) -> &str;

    /// Cursor variant this source persists
    fn cursor_kind(&self) -> CursorKind;

    /// Cursor to start from when none is stored. `floor` is `now - max_lookback`.
    fn initial_cursor(&self, floor: DateTime<Utc>) -> Cursor {
        Cursor::Timestamp(floor)
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> ConnectorResult<Page>;
}

/// How the next lower bound is derived from the last seen timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CursorBoundary {
    /// Cursor is the last seen timestamp; records at or before it are dropped
    #[default]
    Exclusive,
    /// Cursor is the last seen timestamp rounded up to the next second;
    /// records before it are dropped
    NextSecond,
}

impl CursorBoundary {
    fn cursor_for(self, last_seen: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Exclusive => last_seen,
            Self::NextSecond => next_second(last_seen),
        }
    }

    fn already_seen(self, ts: DateTime<Utc>, cursor: DateTime<Utc>) -> bool {
        match self {
            Self::Exclusive => ts <= cursor,
            Self::NextSecond => ts < cursor,
        }
    }
}

/// Pull connector settings
#[derive(Debug, Clone)]
pub struct PullConfig {
    pub frequency: Duration,
    pub max_lookback: chrono::Duration,
    pub max_pages_per_iteration: usize,
    pub page_size: usize,
    pub boundary: CursorBoundary,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(60),
            max_lookback: chrono::Duration::days(7),
            max_pages_per_iteration: 100,
            page_size: 100,
            boundary: CursorBoundary::Exclusive,
        }
    }
}

/// Outcome of one iteration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterationReport {
    pub iteration: u64,
    pub pages: usize,
    pub records: usize,
    /// Records dropped as already seen
    pub skipped: usize,
    /// Cursor after the iteration
    pub cursor: Cursor,
    pub advanced: bool,
}

/// Runs a [`PullSource`] on a schedule
pub struct PullConnector {
    config: PullConfig,
    source: Arc<dyn PullSource>,
    checkpoint: Arc<dyn CheckpointStore>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<ConnectorMetrics>,
    shutdown: CancellationToken,
    iterations: AtomicU64,
}

impl std::fmt::Debug for PullConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PullConnector")
            .field("source", &self.source.name())
            .field("config", &self.config)
            .finish()
    }
}

impl PullConnector {
    pub fn new(
        config: PullConfig,
        source: Arc<dyn PullSource>,
        checkpoint: Arc<dyn CheckpointStore>,
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            config,
            source,
            checkpoint,
            forwarder,
            metrics,
            shutdown: CancellationToken::new(),
            iterations: AtomicU64::new(0),
        }
    }

    pub fn metrics(&self) -> &Arc<ConnectorMetrics> {
        &self.metrics
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Iterate until stopped. Iteration errors are logged and retried on
    /// the next iteration; they never end the loop.
    pub async fn run(&self) -> ConnectorResult<()> {
        info!(
            connector = %self.metrics.connector(),
            source = self.source.name(),
            frequency_secs = self.config.frequency.as_secs(),
            "Pull connector started"
        );

        while !self.shutdown.is_cancelled() {
            if let Ok(report) = self.run_iteration().await {
                debug!(
                    connector = %self.metrics.connector(),
                    iteration = report.iteration,
                    pages = report.pages,
                    records = report.records,
                    cursor = %report.cursor,
                    "Iteration complete"
                );
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.config.frequency) => {}
            }
        }

        info!(connector = %self.metrics.connector(), "Pull connector stopped");
        Ok(())
    }

    /// Run a single iteration. Failures are logged with their
    /// classification before being returned.
    pub async fn run_iteration(&self) -> ConnectorResult<IterationReport> {
        let iteration = self.iterations.fetch_add(1, Ordering::Relaxed) + 1;
        let now = Utc::now();
        let (start, result) = match self.load_cursor(now).await {
            Ok(start) => {
                let result = self.paginate(iteration, &start).await;
                (Some(start), result)
            }
            Err(e) => (None, Err(e)),
        };

        match &result {
            Ok(report) => {
                self.metrics.record_iteration();
                if let Some(lag) = report.cursor.lag_seconds(Utc::now()) {
                    self.metrics.set_cursor_lag(lag);
                }
            }
            Err(e) => {
                let kind = e.kind();
                error!(
                    connector = %self.metrics.connector(),
                    iteration,
                    cursor = %start.as_ref().map_or_else(|| "<unloaded>".to_string(), Cursor::to_string),
                    component = "pull",
                    kind = %kind,
                    retryable = e.is_retryable(),
                    error = %e,
                    "Iteration failed, cursor not advanced"
                );
                self.metrics.record_error(kind);
            }
        }
        result
    }

    async fn load_cursor(&self, now: DateTime<Utc>) -> ConnectorResult<Cursor> {
        let floor = now - self.config.max_lookback;
        let stored = match self.checkpoint.load().await {
            Ok(stored) => stored,
            Err(ConnectorError::State(reason)) => {
                warn!(
                    connector = %self.metrics.connector(),
                    reason = %reason,
                    "Unreadable checkpoint, restarting from lookback floor"
                );
                None
            }
            Err(e) => return Err(e),
        };

        let cursor = match stored {
            Some(cursor) if cursor.kind() == self.source.cursor_kind() => cursor,
            Some(cursor) => {
                warn!(
                    connector = %self.metrics.connector(),
                    stored = %cursor,
                    expected = ?self.source.cursor_kind(),
                    "Checkpoint kind does not match source, restarting from lookback floor"
                );
                self.source.initial_cursor(floor)
            }
            None => self.source.initial_cursor(floor),
        };
        Ok(cursor.clamp(now, self.config.max_lookback))
    }

    async fn paginate(&self, iteration: u64, start: &Cursor) -> ConnectorResult<IterationReport> {
        let mut cursor = start.clone();
        let mut page_token: Option<String> = None;
        let mut report = IterationReport {
            iteration,
            pages: 0,
            records: 0,
            skipped: 0,
            cursor: start.clone(),
            advanced: false,
        };

        while report.pages < self.config.max_pages_per_iteration.max(1) {
            if report.pages > 0 && self.shutdown.is_cancelled() {
                debug!(connector = %self.metrics.connector(), "Stop requested between pages");
                break;
            }

            let page = self
                .source
                .fetch_page(PageRequest {
                    cursor: start,
                    page_token: page_token.as_deref(),
                    page_size: self.config.page_size,
                })
                .await?;
            report.pages += 1;

            let (records, skipped) = self.unseen(page.records, start);
            report.skipped += skipped;
            self.metrics.record_events_discarded(skipped);

            let mut next = cursor.clone();
            if let Some(last_seen) = records.iter().filter_map(|r| r.timestamp).max() {
                next = next.advance(Cursor::Timestamp(self.config.boundary.cursor_for(last_seen)));
            }
            if let Some(position) = page.cursor {
                next = next.advance(position);
            }

            if !records.is_empty() {
                report.records += records.len();
                self.forwarder.push(records).await?;
            }

            if next != cursor {
                self.checkpoint.save(&next).await?;
                cursor = next;
                report.advanced = true;
            }

            match page.next_page {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        report.cursor = cursor;
        Ok(report)
    }

    /// Drop records the previous iteration already forwarded
    fn unseen(&self, records: Vec<Record>, start: &Cursor) -> (Vec<Record>, usize) {
        let Some(boundary) = start.as_timestamp() else {
            return (records, 0);
        };
        let total = records.len();
        let kept: Vec<Record> = records
            .into_iter()
            .filter(|record| match record.timestamp {
                Some(ts) => !self.config.boundary.already_seen(ts, boundary),
                None => true,
            })
            .collect();
        let skipped = total - kept.len();
        (kept, skipped)
    }
}
