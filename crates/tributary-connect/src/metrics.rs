//! Connector metrics
//!
//! Every connector instance owns a [`ConnectorMetrics`]. Each recording
//! updates a local atomic (for snapshots, health output and tests) and the
//! `metrics` facade (for the Prometheus exporter), labelled with the
//! connector name.
//!
//! # Metric names
//!
//! - `tributary_messages_received_total` - queue messages received
//! - `tributary_messages_acked_total` - queue messages deleted after processing
//! - `tributary_events_forwarded_total` - records accepted by the intake
//! - `tributary_events_discarded_total` - records filtered or dropped
//! - `tributary_batches_forwarded_total` - intake batches accepted
//! - `tributary_forward_batch_duration_seconds` - histogram of intake push latency
//! - `tributary_cursor_lag_seconds` - gauge, `now - cursor` for timestamp cursors
//! - `tributary_iterations_total` - completed pull iterations
//! - `tributary_errors_total{kind}` - classified errors

use crate::error::ErrorKind;
use metrics::{counter, gauge, histogram};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

static PROMETHEUS_INSTALLED: OnceLock<()> = OnceLock::new();

/// Install the Prometheus exporter serving `/metrics` on `addr`.
///
/// Safe to call more than once; only the first call installs.
pub fn init_prometheus(addr: std::net::SocketAddr) -> anyhow::Result<()> {
    if PROMETHEUS_INSTALLED.get().is_some() {
        return Ok(());
    }
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    let _ = PROMETHEUS_INSTALLED.set(());
    tracing::info!("Prometheus metrics listening on http://{}/metrics", addr);
    Ok(())
}

/// Per-connector counters
#[derive(Debug)]
pub struct ConnectorMetrics {
    connector: String,
    messages_received: AtomicU64,
    messages_acked: AtomicU64,
    events_forwarded: AtomicU64,
    events_discarded: AtomicU64,
    batches_forwarded: AtomicU64,
    iterations: AtomicU64,
    errors: AtomicU64,
    /// f64 bits
    cursor_lag: AtomicU64,
}

/// Point-in-time copy of a connector's counters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub messages_acked: u64,
    pub events_forwarded: u64,
    pub events_discarded: u64,
    pub batches_forwarded: u64,
    pub iterations: u64,
    pub errors: u64,
    pub cursor_lag_seconds: f64,
}

impl ConnectorMetrics {
    pub fn new(connector: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            connector: connector.into(),
            messages_received: AtomicU64::new(0),
            messages_acked: AtomicU64::new(0),
            events_forwarded: AtomicU64::new(0),
            events_discarded: AtomicU64::new(0),
            batches_forwarded: AtomicU64::new(0),
            iterations: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cursor_lag: AtomicU64::new(0f64.to_bits()),
        })
    }

    pub fn connector(&self) -> &str {
        &self.connector
    }

    pub fn record_messages_received(&self, count: usize) {
        self.messages_received
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("tributary_messages_received_total", "connector" => self.connector.clone())
            .increment(count as u64);
    }

    pub fn record_message_acked(&self) {
        self.messages_acked.fetch_add(1, Ordering::Relaxed);
        counter!("tributary_messages_acked_total", "connector" => self.connector.clone())
            .increment(1);
    }

    /// One intake batch accepted
    pub fn record_batch_forwarded(&self, events: usize, duration: Duration) {
        self.events_forwarded
            .fetch_add(events as u64, Ordering::Relaxed);
        self.batches_forwarded.fetch_add(1, Ordering::Relaxed);
        counter!("tributary_events_forwarded_total", "connector" => self.connector.clone())
            .increment(events as u64);
        counter!("tributary_batches_forwarded_total", "connector" => self.connector.clone())
            .increment(1);
        histogram!("tributary_forward_batch_duration_seconds", "connector" => self.connector.clone())
            .record(duration.as_secs_f64());
    }

    pub fn record_events_discarded(&self, count: usize) {
        if count == 0 {
            return;
        }
        self.events_discarded
            .fetch_add(count as u64, Ordering::Relaxed);
        counter!("tributary_events_discarded_total", "connector" => self.connector.clone())
            .increment(count as u64);
    }

    pub fn record_iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
        counter!("tributary_iterations_total", "connector" => self.connector.clone()).increment(1);
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        counter!(
            "tributary_errors_total",
            "connector" => self.connector.clone(),
            "kind" => kind.as_str()
        )
        .increment(1);
    }

    pub fn set_cursor_lag(&self, seconds: f64) {
        self.cursor_lag.store(seconds.to_bits(), Ordering::Relaxed);
        gauge!("tributary_cursor_lag_seconds", "connector" => self.connector.clone()).set(seconds);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            messages_acked: self.messages_acked.load(Ordering::Relaxed),
            events_forwarded: self.events_forwarded.load(Ordering::Relaxed),
            events_discarded: self.events_discarded.load(Ordering::Relaxed),
            batches_forwarded: self.batches_forwarded.load(Ordering::Relaxed),
            iterations: self.iterations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            cursor_lag_seconds: f64::from_bits(self.cursor_lag.load(Ordering::Relaxed)),
        }
    }
}
