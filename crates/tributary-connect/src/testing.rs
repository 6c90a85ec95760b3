//! Test doubles for connector pipelines
//!
//! In-process stand-ins for the intake and for vendor APIs, used by unit
//! tests, the integration tests and local dry runs.

use crate::checkpoint::{Cursor, CursorKind};
use crate::error::{ConnectorError, ConnectorResult};
use crate::forwarder::{Forwarder, PushAck};
use crate::pull::{Page, PageRequest, PullSource};
use crate::types::Record;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Forwarder that keeps every accepted push in memory
#[derive(Debug, Default)]
pub struct RecordingForwarder {
    pushes: Mutex<Vec<Vec<Record>>>,
    failing: AtomicBool,
}

impl RecordingForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// While failing, every push returns `IntakeUnavailable`
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn pushes(&self) -> Vec<Vec<Record>> {
        self.pushes.lock().clone()
    }

    pub fn push_count(&self) -> usize {
        self.pushes.lock().len()
    }

    /// All accepted records in push order
    pub fn records(&self) -> Vec<Record> {
        self.pushes.lock().iter().flatten().cloned().collect()
    }

    pub fn records_as_strings(&self) -> Vec<String> {
        self.records()
            .iter()
            .map(|r| r.as_str_lossy().into_owned())
            .collect()
    }
}

#[async_trait]
impl Forwarder for RecordingForwarder {
    async fn push(&self, records: Vec<Record>) -> ConnectorResult<PushAck> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectorError::IntakeUnavailable(
                "recording forwarder set to fail".into(),
            ));
        }
        let ack = PushAck {
            accepted: records.len(),
            dropped: 0,
            batches: 1,
        };
        self.pushes.lock().push(records);
        Ok(ack)
    }
}

/// Timestamped vendor feed with inclusive `since` semantics.
///
/// Each page returns events whose timestamp is at or after the request's
/// timestamp cursor, `page_size` at a time, with the offset as page token.
#[derive(Debug)]
pub struct ScriptedPullSource {
    events: Mutex<Vec<(DateTime<Utc>, String)>>,
    requests: Mutex<Vec<(Cursor, Option<String>)>>,
    failing: AtomicBool,
}

impl ScriptedPullSource {
    pub fn new(events: Vec<(DateTime<Utc>, String)>) -> Self {
        Self {
            events: Mutex::new(events),
            requests: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Append an event to the feed
    pub fn publish(&self, timestamp: DateTime<Utc>, payload: impl Into<String>) {
        self.events.lock().push((timestamp, payload.into()));
    }

    /// While failing, every fetch returns a transient error
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// `(cursor, page_token)` of every fetch so far
    pub fn requests(&self) -> Vec<(Cursor, Option<String>)> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl PullSource for ScriptedPullSource {
    fn name(&self) -> &str {
        "scripted"
    }

    fn cursor_kind(&self) -> CursorKind {
        CursorKind::Timestamp
    }

    async fn fetch_page(&self, request: PageRequest<'_>) -> ConnectorResult<Page> {
        self.requests.lock().push((
            request.cursor.clone(),
            request.page_token.map(str::to_string),
        ));
        if self.failing.load(Ordering::SeqCst) {
            return Err(ConnectorError::transient("scripted source set to fail"));
        }

        let since = request
            .cursor
            .as_timestamp()
            .ok_or_else(|| ConnectorError::state("scripted source needs a timestamp cursor"))?;
        let offset: usize = match request.page_token {
            Some(token) => token
                .parse()
                .map_err(|_| ConnectorError::Client(format!("bad page token '{}'", token)))?,
            None => 0,
        };

        let events = self.events.lock();
        let matching: Vec<_> = events.iter().filter(|(ts, _)| *ts >= since).collect();
        let end = (offset + request.page_size.max(1)).min(matching.len());
        let records = matching
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|(ts, payload)| Record::from(payload.as_str()).with_timestamp(*ts))
            .collect();

        Ok(Page {
            records,
            next_page: (end < matching.len()).then(|| end.to_string()),
            cursor: None,
        })
    }
}
