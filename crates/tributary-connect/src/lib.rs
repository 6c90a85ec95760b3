//! tributary-connect - shared runtime for ingestion connectors
//!
//! Every connector authenticates to a vendor, pulls events (or the objects a
//! queue notification points to) and forwards records to an intake. This
//! crate holds the parts all of them share.
//!
//! # Architecture
//!
//! ```text
//! pull:   PullConnector ─▶ PullSource (HttpClient + AuthStrategy) ─▶ Forwarder ─▶ intake
//!              │                                                        │
//!              └──────────── CheckpointStore ◀── save after ack ────────┘
//!
//! queue:  QueueConsumer ─▶ QueueBackend ─▶ notification ─▶ ObjectFetcher
//!              ─▶ gunzip ─▶ Codec ─▶ Forwarder ─▶ intake ─▶ delete message
//! ```
//!
//! Both connector kinds run under [`lifecycle::ConnectorRuntime`], which
//! handles graceful stop with a hard shutdown deadline.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tributary_connect::prelude::*;
//!
//! let config = ConnectorConfig::from_file("okta.yaml")?;
//! let metrics = ConnectorMetrics::new(&config.name);
//! let intake = IntakeForwarder::new(config.intake_http_client()?, config.forwarder_config(), metrics.clone());
//! let (forwarder, _task) = BatchingForwarder::spawn(intake);
//!
//! let connector = PullConnector::new(
//!     config.pull_config(),
//!     Arc::new(MyVendorSource::new(config.vendor_http_client()?)),
//!     Arc::new(config.checkpoint_store().await?),
//!     Arc::new(forwarder),
//!     metrics,
//! );
//! run_until(Arc::new(connector), config.max_shutdown(), shutdown_signal()).await?;
//! ```
//!
//! # Binary
//!
//! ```bash
//! # Run a queue-mode connector
//! tributary-connect -c cloudtrail.yaml
//!
//! # Validate configuration
//! tributary-connect -c cloudtrail.yaml validate
//!
//! # Print the configuration JSON schema
//! tributary-connect schema
//! ```

pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod http;
pub mod lifecycle;
pub mod metrics;
pub mod notification;
pub mod pull;
pub mod queue;
pub mod rate_limiter;
pub mod storage;
pub mod testing;
pub mod types;

pub use checkpoint::{CheckpointStore, Cursor, CursorKind, FileCheckpointStore, FileId, MemoryCheckpointStore};
pub use codec::{Codec, CodecConfig, Decoded};
pub use config::ConnectorConfig;
pub use error::{ConnectorError, ConnectorResult, ErrorKind, HttpError};
pub use forwarder::{BatchingForwarder, Forwarder, ForwarderConfig, IntakeForwarder, PushAck};
pub use http::auth::AuthStrategy;
pub use http::{HttpClient, HttpClientConfig};
pub use lifecycle::{run_then_drain, run_until, shutdown_signal, Connector, ConnectorRuntime, ShutdownOutcome};
pub use metrics::ConnectorMetrics;
pub use pull::{CursorBoundary, Page, PageRequest, PullConfig, PullConnector, PullSource};
pub use queue::{QueueBackend, QueueConsumer, QueueConsumerConfig, QueueMessage};
pub use storage::{Blob, ObjectFetcher, ObjectStoreFetcher};
pub use types::{Record, SensitiveString};

// Re-export for implementors of the async traits
pub use async_trait::async_trait;

/// Everything needed to build a connector
pub mod prelude {
    pub use crate::{
        async_trait, run_until, shutdown_signal, AuthStrategy, BatchingForwarder, CheckpointStore,
        Codec, CodecConfig, Connector, ConnectorConfig, ConnectorError, ConnectorMetrics,
        ConnectorResult, ConnectorRuntime, Cursor, CursorBoundary, CursorKind, Forwarder,
        HttpClient, IntakeForwarder, ObjectFetcher, Page, PageRequest, PullConfig, PullConnector,
        PullSource, QueueBackend, QueueConsumer, Record, SensitiveString,
    };
    pub use std::sync::Arc;
}
