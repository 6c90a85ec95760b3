//! # Checkpointing
//!
//! Durable per-connector cursor for pull connectors.
//!
//! ## Cursor variants
//!
//! - **Timestamp**: RFC 3339 instant, clamped to `[now - max_lookback, now]` on load
//! - **Marker**: opaque vendor string from the previous page
//! - **FileId**: `"<prefix>_<counter>"` log-index position
//!
//! ## Storage
//!
//! One JSON file per connector holding `{"cursor": ..., "updated_at": ...}`.
//! Writes go to a temp file, are fsynced, then renamed over the old file,
//! so a crash leaves either the old or the new cursor on disk.
//!
//! ```ignore
//! let store = FileCheckpointStore::new("/var/lib/tributary", "okta-logs").await?;
//! let cursor = store.load_or(Cursor::Timestamp(Utc::now())).await?;
//! store.save(&cursor).await?;
//! ```

use crate::error::{ConnectorError, ConnectorResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, DurationRound, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Composite `"<prefix>_<counter>"` position
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    pub prefix: String,
    pub counter: u64,
}

impl FileId {
    pub fn new(prefix: impl Into<String>, counter: u64) -> Self {
        Self {
            prefix: prefix.into(),
            counter,
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.prefix, self.counter)
    }
}

impl FromStr for FileId {
    type Err = ConnectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, counter) = s
            .rsplit_once('_')
            .ok_or_else(|| ConnectorError::state(format!("invalid file id '{}'", s)))?;
        let counter = counter
            .parse()
            .map_err(|_| ConnectorError::state(format!("invalid file id counter in '{}'", s)))?;
        Ok(Self::new(prefix, counter))
    }
}

impl Serialize for FileId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for FileId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(serde::de::Error::custom)
    }
}

/// Which cursor variant a source uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorKind {
    Timestamp,
    Marker,
    FileId,
}

/// Checkpoint value of a pull connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Cursor {
    Timestamp(DateTime<Utc>),
    Marker(String),
    FileId(FileId),
}

impl Cursor {
    pub fn kind(&self) -> CursorKind {
        match self {
            Self::Timestamp(_) => CursorKind::Timestamp,
            Self::Marker(_) => CursorKind::Marker,
            Self::FileId(_) => CursorKind::FileId,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Move forward to `candidate` without ever going back.
    ///
    /// Timestamps keep the later instant. File ids keep the higher counter
    /// within a prefix; a new prefix starts a new log index and replaces the
    /// old one. Markers are opaque and always replaced.
    pub fn advance(self, candidate: Cursor) -> Cursor {
        match (self, candidate) {
            (Self::Timestamp(current), Self::Timestamp(next)) => Self::Timestamp(current.max(next)),
            (Self::FileId(current), Self::FileId(next)) => {
                if current.prefix == next.prefix && next.counter < current.counter {
                    Self::FileId(current)
                } else {
                    Self::FileId(next)
                }
            }
            (_, candidate) => candidate,
        }
    }

    /// Clamp a timestamp cursor into `[now - max_lookback, now]`
    pub fn clamp(self, now: DateTime<Utc>, max_lookback: ChronoDuration) -> Cursor {
        match self {
            Self::Timestamp(ts) => Self::Timestamp(ts.clamp(now - max_lookback, now)),
            other => other,
        }
    }

    /// `now - cursor` in seconds, for timestamp cursors
    pub fn lag_seconds(&self, now: DateTime<Utc>) -> Option<f64> {
        self.as_timestamp()
            .map(|ts| (now - ts).num_milliseconds().max(0) as f64 / 1000.0)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
            Self::Marker(marker) => write!(f, "marker:{}", marker),
            Self::FileId(id) => write!(f, "{}", id),
        }
    }
}

/// Truncate to the second and add one: the next inclusive lower bound after `ts`
pub fn next_second(ts: DateTime<Utc>) -> DateTime<Utc> {
    let floored = ts
        .duration_trunc(ChronoDuration::seconds(1))
        .unwrap_or(ts);
    floored + ChronoDuration::seconds(1)
}

/// Persistent storage for one connector's cursor
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Stored cursor, `None` when nothing was saved yet.
    ///
    /// A corrupt value is an error; the caller decides how to recover.
    async fn load(&self) -> ConnectorResult<Option<Cursor>>;

    /// Atomically replace the stored cursor
    async fn save(&self, cursor: &Cursor) -> ConnectorResult<()>;

    /// Stored cursor, or `default` when absent
    async fn load_or(&self, default: Cursor) -> ConnectorResult<Cursor> {
        Ok(self.load().await?.unwrap_or(default))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointFile {
    cursor: Cursor,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

/// File-based checkpoint store, one file per connector
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    path: PathBuf,
    fsync: bool,
}

impl FileCheckpointStore {
    /// Store for `connector` under `dir`, creating the directory if needed
    pub async fn new(dir: impl AsRef<Path>, connector: &str) -> ConnectorResult<Self> {
        if connector.is_empty()
            || connector.contains('/')
            || connector.contains('\\')
            || connector.starts_with('.')
        {
            return Err(ConnectorError::config(format!(
                "invalid checkpoint name '{}'",
                connector
            )));
        }

        let dir = dir.as_ref();
        fs::create_dir_all(dir).await?;

        Ok(Self {
            path: dir.join(format!("{}.json", connector)),
            fsync: true,
        })
    }

    /// Disable fsync (tests)
    pub fn without_fsync(mut self) -> Self {
        self.fsync = false;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self) -> ConnectorResult<Option<Cursor>> {
        let contents = match fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let file: CheckpointFile = serde_json::from_str(&contents).map_err(|e| {
            ConnectorError::state(format!(
                "corrupt checkpoint {}: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(Some(file.cursor))
    }

    async fn save(&self, cursor: &Cursor) -> ConnectorResult<()> {
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(&CheckpointFile {
            cursor: cursor.clone(),
            updated_at: Some(Utc::now()),
        })?;

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.write_all(&json).await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), cursor = %cursor, "Saved checkpoint");
        Ok(())
    }
}

/// In-memory checkpoint store (tests, ephemeral runs)
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    cursor: Mutex<Option<Cursor>>,
    history: Mutex<Vec<Cursor>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cursor(cursor: Cursor) -> Self {
        Self {
            cursor: Mutex::new(Some(cursor)),
            history: Mutex::default(),
        }
    }

    /// Every cursor saved so far, oldest first
    pub fn history(&self) -> Vec<Cursor> {
        self.history.lock().clone()
    }

    pub fn current(&self) -> Option<Cursor> {
        self.cursor.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self) -> ConnectorResult<Option<Cursor>> {
        Ok(self.cursor.lock().clone())
    }

    async fn save(&self, cursor: &Cursor) -> ConnectorResult<()> {
        *self.cursor.lock() = Some(cursor.clone());
        self.history.lock().push(cursor.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_layout() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "okta").await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);

        let cursor = Cursor::Timestamp(ts(0));
        store.save(&cursor).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(cursor));

        // Persisted layout holds a top-level "cursor" key
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["cursor"]["type"], "timestamp");
        assert!(raw["updated_at"].is_string());

        // No temp file left behind
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = FileCheckpointStore::new(dir.path(), "imperva")
                .await
                .unwrap()
                .without_fsync();
            store
                .save(&Cursor::FileId(FileId::new("12345", 7)))
                .await
                .unwrap();
        }

        let store = FileCheckpointStore::new(dir.path(), "imperva").await.unwrap();
        assert_eq!(
            store.load().await.unwrap(),
            Some(Cursor::FileId(FileId::new("12345", 7)))
        );
    }

    #[tokio::test]
    async fn test_file_store_corrupt_is_error() {
        let dir = tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path(), "broken").await.unwrap();
        std::fs::write(store.path(), "{not json").unwrap();

        let err = store.load().await.unwrap_err();
        assert!(matches!(err, ConnectorError::State(_)));
    }

    #[tokio::test]
    async fn test_invalid_names_rejected() {
        let dir = tempdir().unwrap();
        for name in ["", "../escape", "a/b", ".hidden"] {
            assert!(FileCheckpointStore::new(dir.path(), name).await.is_err());
        }
    }

    #[tokio::test]
    async fn test_load_or_default() {
        let store = MemoryCheckpointStore::new();
        let cursor = store
            .load_or(Cursor::Marker("start".into()))
            .await
            .unwrap();
        assert_eq!(cursor, Cursor::Marker("start".into()));

        store.save(&Cursor::Marker("next".into())).await.unwrap();
        assert_eq!(
            store.load_or(Cursor::Marker("start".into())).await.unwrap(),
            Cursor::Marker("next".into())
        );
        assert_eq!(store.history().len(), 1);
    }

    #[test]
    fn test_file_id_format() {
        let id: FileId = "abc_def_42".parse().unwrap();
        assert_eq!(id.prefix, "abc_def");
        assert_eq!(id.counter, 42);
        assert_eq!(id.to_string(), "abc_def_42");

        assert!("nounderscore".parse::<FileId>().is_err());
        assert!("abc_notanumber".parse::<FileId>().is_err());

        let json = serde_json::to_string(&Cursor::FileId(id)).unwrap();
        assert_eq!(json, r#"{"type":"file_id","value":"abc_def_42"}"#);
    }

    #[test]
    fn test_advance_is_monotonic() {
        let cursor = Cursor::Timestamp(ts(10));
        assert_eq!(
            cursor.clone().advance(Cursor::Timestamp(ts(5))),
            Cursor::Timestamp(ts(10))
        );
        assert_eq!(
            cursor.advance(Cursor::Timestamp(ts(11))),
            Cursor::Timestamp(ts(11))
        );

        let file = Cursor::FileId(FileId::new("p", 9));
        assert_eq!(
            file.clone().advance(Cursor::FileId(FileId::new("p", 3))),
            file
        );
        assert_eq!(
            file.advance(Cursor::FileId(FileId::new("q", 1))),
            Cursor::FileId(FileId::new("q", 1))
        );

        assert_eq!(
            Cursor::Marker("a".into()).advance(Cursor::Marker("b".into())),
            Cursor::Marker("b".into())
        );
    }

    #[test]
    fn test_clamp_into_lookback_window() {
        let now = ts(0);
        let lookback = ChronoDuration::days(7);

        let old = Cursor::Timestamp(now - ChronoDuration::days(30));
        assert_eq!(old.clamp(now, lookback), Cursor::Timestamp(now - lookback));

        let future = Cursor::Timestamp(now + ChronoDuration::hours(1));
        assert_eq!(future.clamp(now, lookback), Cursor::Timestamp(now));

        let inside = Cursor::Timestamp(now - ChronoDuration::hours(1));
        assert_eq!(inside.clone().clamp(now, lookback), inside);

        let marker = Cursor::Marker("m".into());
        assert_eq!(marker.clone().clamp(now, lookback), marker);
    }

    #[test]
    fn test_next_second_and_lag() {
        let t = ts(2) + ChronoDuration::milliseconds(250);
        assert_eq!(next_second(t), ts(3));
        assert_eq!(next_second(ts(2)), ts(3));

        let cursor = Cursor::Timestamp(ts(0));
        assert_eq!(cursor.lag_seconds(ts(90)), Some(90.0));
        assert_eq!(Cursor::Marker("x".into()).lag_seconds(ts(90)), None);
    }
}
