//! Object-queue consumer
//!
//! At-least-once pipeline from queue notifications to the intake:
//!
//! ```text
//! receive ─▶ bounded channel ─▶ N workers
//!                                 │
//!       resolve ─▶ fetch ─▶ gunzip ─▶ decode ─▶ push ─▶ delete
//! ```
//!
//! A message is deleted only after every record of every object it names
//! was accepted by the intake. Fetch and push failures abandon the message
//! so it is redelivered once its visibility timeout expires. Payloads that
//! can never succeed (not JSON, corrupt gzip, unparseable object) are
//! logged and acknowledged so they do not block the queue.
//!
//! While a message is processed its visibility is extended every half
//! timeout. On stop, received messages that no worker started are made
//! visible again immediately.

use super::{QueueBackend, QueueMessage};
use crate::codec::compression::decompress;
use crate::codec::Codec;
use crate::error::{ConnectorResult, ErrorKind};
use crate::forwarder::Forwarder;
use crate::metrics::ConnectorMetrics;
use crate::notification::{self, ObjectRef};
use crate::storage::ObjectFetcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Queue consumer settings
#[derive(Debug, Clone)]
pub struct QueueConsumerConfig {
    pub queue_name: String,
    /// Pause after an empty receive
    pub poll_interval: Duration,
    /// Long-poll wait per receive
    pub wait_time: Duration,
    /// Seconds a received message stays hidden; 0 keeps the queue default
    pub visibility_timeout: u32,
    /// Messages per receive
    pub batch_size: usize,
    /// Delete on success; when false, messages reappear after the timeout
    pub delete_consumed_messages: bool,
    /// Worker count
    pub max_concurrency: usize,
    /// Largest object accepted after decompression
    pub max_object_bytes: usize,
}

impl QueueConsumerConfig {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            poll_interval: Duration::from_secs(10),
            wait_time: Duration::from_secs(20),
            visibility_timeout: 300,
            batch_size: 10,
            delete_consumed_messages: true,
            max_concurrency: 4,
            max_object_bytes: 512 * 1024 * 1024,
        }
    }
}

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// Processed and deleted; `records` were forwarded
    Acked { records: usize },
    /// Processed but kept because deletes are disabled
    Retained { records: usize },
    /// Left for redelivery
    Abandoned(ErrorKind),
}

/// Consumes object notifications from one queue
#[derive(Clone)]
pub struct QueueConsumer {
    config: QueueConsumerConfig,
    queue: Arc<dyn QueueBackend>,
    fetcher: Arc<dyn ObjectFetcher>,
    codec: Arc<dyn Codec>,
    forwarder: Arc<dyn Forwarder>,
    metrics: Arc<ConnectorMetrics>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for QueueConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConsumer")
            .field("config", &self.config)
            .field("codec", &self.codec.name())
            .field("connector", &self.metrics.connector())
            .finish()
    }
}

impl QueueConsumer {
    pub fn new(
        config: QueueConsumerConfig,
        queue: Arc<dyn QueueBackend>,
        fetcher: Arc<dyn ObjectFetcher>,
        codec: Arc<dyn Codec>,
        forwarder: Arc<dyn Forwarder>,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            config,
            queue,
            fetcher,
            codec,
            forwarder,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &QueueConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ConnectorMetrics> {
        &self.metrics
    }

    /// Request a graceful stop
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Consume until stopped. Returns after in-flight messages finished.
    pub async fn run(&self) -> ConnectorResult<()> {
        let workers_count = self.config.max_concurrency.max(1);
        let (tx, rx) = mpsc::channel::<QueueMessage>(workers_count);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker in 0..workers_count {
            let consumer = self.clone();
            let rx = rx.clone();
            workers.spawn(async move { consumer.worker_loop(worker, rx).await });
        }

        info!(
            connector = %self.metrics.connector(),
            queue = %self.config.queue_name,
            workers = workers_count,
            "Queue consumer started"
        );

        self.receive_loop(tx).await;

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(connector = %self.metrics.connector(), error = %e, "Queue worker panicked");
            }
        }

        info!(
            connector = %self.metrics.connector(),
            queue = %self.config.queue_name,
            "Queue consumer stopped"
        );
        Ok(())
    }

    async fn receive_loop(&self, tx: mpsc::Sender<QueueMessage>) {
        let queue_name = &self.config.queue_name;
        // 0 keeps the queue's own default
        let visibility = Some(self.config.visibility_timeout).filter(|seconds| *seconds > 0);

        while !self.shutdown.is_cancelled() {
            let received = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                received = self.queue.receive(
                    queue_name,
                    self.config.batch_size,
                    self.config.wait_time,
                    visibility,
                ) => received,
            };

            let messages = match received {
                Ok(messages) => messages,
                Err(e) => {
                    warn!(
                        connector = %self.metrics.connector(),
                        queue = %queue_name,
                        error = %e,
                        "Queue receive failed"
                    );
                    self.metrics.record_error(e.kind());
                    self.pause().await;
                    continue;
                }
            };

            if messages.is_empty() {
                self.pause().await;
                continue;
            }

            self.metrics.record_messages_received(messages.len());
            debug!(queue = %queue_name, count = messages.len(), "Received messages");

            let mut pending = messages.into_iter();
            while let Some(message) = pending.next() {
                let permit = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => None,
                    permit = tx.reserve() => permit.ok(),
                };
                match permit {
                    Some(permit) => permit.send(message),
                    None => {
                        self.release(&message).await;
                        for message in pending.by_ref() {
                            self.release(&message).await;
                        }
                    }
                }
            }
        }
    }

    async fn pause(&self) {
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(self.config.poll_interval) => {}
        }
    }

    async fn worker_loop(&self, worker: usize, rx: Arc<Mutex<mpsc::Receiver<QueueMessage>>>) {
        loop {
            let message = rx.lock().await.recv().await;
            let Some(message) = message else { break };

            if self.shutdown.is_cancelled() {
                self.release(&message).await;
                continue;
            }

            let outcome = self.handle_message(&message).await;
            debug!(worker, message_id = %message.id, ?outcome, "Message handled");
        }
    }

    /// Make a message visible again right away
    async fn release(&self, message: &QueueMessage) {
        if let Err(e) = self
            .queue
            .extend_visibility(&self.config.queue_name, &message.receipt_handle, 0)
            .await
        {
            debug!(message_id = %message.id, error = %e, "Could not release message");
        }
    }

    /// Process one message to completion and acknowledge it when it succeeded
    pub async fn handle_message(&self, message: &QueueMessage) -> MessageOutcome {
        let result = self.process_with_heartbeat(message).await;

        let records = match result {
            Ok(records) => records,
            Err(e) => {
                let kind = e.kind();
                warn!(
                    connector = %self.metrics.connector(),
                    component = "queue_consumer",
                    queue = %self.config.queue_name,
                    message_id = %message.id,
                    receive_count = message.receive_count,
                    kind = %kind,
                    error = %e,
                    "Message abandoned for redelivery"
                );
                self.metrics.record_error(kind);
                return MessageOutcome::Abandoned(kind);
            }
        };

        if !self.config.delete_consumed_messages {
            return MessageOutcome::Retained { records };
        }

        match self
            .queue
            .delete(&self.config.queue_name, &message.receipt_handle)
            .await
        {
            Ok(()) => {
                self.metrics.record_message_acked();
                MessageOutcome::Acked { records }
            }
            Err(e) => {
                // Records were pushed; redelivery will duplicate them
                warn!(
                    connector = %self.metrics.connector(),
                    message_id = %message.id,
                    error = %e,
                    "Failed to delete processed message"
                );
                self.metrics.record_error(e.kind());
                MessageOutcome::Abandoned(e.kind())
            }
        }
    }

    async fn process_with_heartbeat(&self, message: &QueueMessage) -> ConnectorResult<usize> {
        let visibility = self.config.visibility_timeout;
        if visibility == 0 {
            return self.process_message(message).await;
        }

        let every = Duration::from_secs(u64::from((visibility / 2).max(1)));
        let mut heartbeat = tokio::time::interval_at(Instant::now() + every, every);
        let process = self.process_message(message);
        tokio::pin!(process);

        loop {
            tokio::select! {
                result = &mut process => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .queue
                        .extend_visibility(&self.config.queue_name, &message.receipt_handle, visibility)
                        .await
                    {
                        warn!(message_id = %message.id, error = %e, "Visibility heartbeat failed");
                    }
                }
            }
        }
    }

    /// Forward every record of every object the message names.
    ///
    /// Returns the number of records forwarded.
    async fn process_message(&self, message: &QueueMessage) -> ConnectorResult<usize> {
        let objects = match notification::resolve(&message.body) {
            Ok(objects) => objects,
            Err(e) => {
                error!(
                    connector = %self.metrics.connector(),
                    message_id = %message.id,
                    error = %e,
                    "Dropping unreadable notification"
                );
                self.metrics.record_error(e.kind());
                return Ok(0);
            }
        };

        if objects.is_empty() {
            debug!(message_id = %message.id, "Notification references no objects");
            return Ok(0);
        }

        let mut forwarded = 0;
        for object in &objects {
            forwarded += self.process_object(object).await?;
        }
        Ok(forwarded)
    }

    async fn process_object(&self, object: &ObjectRef) -> ConnectorResult<usize> {
        let fetched = match self.fetcher.fetch(&object.bucket, &object.key).await {
            Ok(fetched) => fetched,
            Err(e) if e.kind() == ErrorKind::PoisonPayload => {
                self.log_poison(object, &e);
                self.metrics.record_error(ErrorKind::PoisonPayload);
                return Ok(0);
            }
            Err(e) => return Err(e),
        };
        let Some(blob) = fetched else {
            warn!(
                connector = %self.metrics.connector(),
                bucket = %object.bucket,
                key = %object.key,
                "Object not found, skipping"
            );
            return Ok(0);
        };

        let data = match decompress(blob.data, &blob.hints, self.config.max_object_bytes) {
            Ok(data) => data,
            Err(e) => {
                self.log_poison(object, &e);
                self.metrics.record_error(ErrorKind::PoisonPayload);
                return Ok(0);
            }
        };

        let decoded = match self.codec.decode(&data) {
            Ok(decoded) => decoded,
            Err(e) => {
                self.log_poison(object, &e);
                self.metrics.record_error(ErrorKind::PoisonPayload);
                return Ok(0);
            }
        };

        self.metrics.record_events_discarded(decoded.discarded);
        if decoded.records.is_empty() {
            debug!(bucket = %object.bucket, key = %object.key, "Object produced no records");
            return Ok(0);
        }

        let count = decoded.records.len();
        self.forwarder.push(decoded.records).await?;
        debug!(bucket = %object.bucket, key = %object.key, records = count, "Object forwarded");
        Ok(count)
    }

    fn log_poison(&self, object: &ObjectRef, err: &crate::error::ConnectorError) {
        error!(
            connector = %self.metrics.connector(),
            codec = self.codec.name(),
            bucket = %object.bucket,
            key = %object.key,
            error = %err,
            "Dropping unparseable object"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use crate::queue::MemoryQueue;
    use crate::storage::ObjectStoreFetcher;
    use crate::testing::RecordingForwarder;
    use object_store::memory::InMemory;
    use object_store::path::Path;
    use object_store::ObjectStore;

    struct Fixture {
        queue: Arc<MemoryQueue>,
        store: Arc<InMemory>,
        forwarder: Arc<RecordingForwarder>,
        consumer: QueueConsumer,
    }

    fn fixture(codec: CodecConfig, tweak: impl FnOnce(&mut QueueConsumerConfig)) -> Fixture {
        let queue = Arc::new(MemoryQueue::new("events", Duration::from_secs(30)));
        let store = Arc::new(InMemory::new());
        let fetcher = ObjectStoreFetcher::fixed().with_store("logs", store.clone());
        let forwarder = Arc::new(RecordingForwarder::new());

        let mut config = QueueConsumerConfig::new("events");
        config.poll_interval = Duration::from_millis(10);
        config.wait_time = Duration::ZERO;
        tweak(&mut config);

        let consumer = QueueConsumer::new(
            config,
            queue.clone(),
            Arc::new(fetcher),
            codec.build().unwrap(),
            forwarder.clone(),
            ConnectorMetrics::new("test"),
        );
        Fixture {
            queue,
            store,
            forwarder,
            consumer,
        }
    }

    fn notification(key: &str) -> String {
        serde_json::json!({
            "Records": [{"s3": {"bucket": {"name": "logs"}, "object": {"key": key}}}]
        })
        .to_string()
    }

    async fn put(store: &InMemory, key: &str, data: &'static [u8]) {
        store
            .put(&Path::from(key), bytes::Bytes::from_static(data).into())
            .await
            .unwrap();
    }

    async fn receive_one(queue: &MemoryQueue) -> QueueMessage {
        queue
            .receive("events", 1, Duration::ZERO, None)
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_records_forwarded_then_acked() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        put(&f.store, "a/b.jsonl", b"{\"n\":1}\n\n{\"n\":2}\n").await;
        f.queue.send(notification("a/b.jsonl"));

        let message = receive_one(&f.queue).await;
        let outcome = f.consumer.handle_message(&message).await;

        assert_eq!(outcome, MessageOutcome::Acked { records: 2 });
        assert!(f.queue.is_empty());
        assert_eq!(f.forwarder.records_as_strings(), vec!["{\"n\":1}", "{\"n\":2}"]);
        let snapshot = f.consumer.metrics().snapshot();
        assert_eq!(snapshot.messages_acked, 1);
    }

    #[tokio::test]
    async fn test_missing_object_acked_without_push() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        f.queue.send(notification("gone.jsonl"));

        let message = receive_one(&f.queue).await;
        let outcome = f.consumer.handle_message(&message).await;

        assert_eq!(outcome, MessageOutcome::Acked { records: 0 });
        assert_eq!(f.forwarder.push_count(), 0);
        assert!(f.queue.is_empty());
    }

    #[tokio::test]
    async fn test_unparseable_notification_acked() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        f.queue.send("definitely not json");

        let message = receive_one(&f.queue).await;
        assert_eq!(
            f.consumer.handle_message(&message).await,
            MessageOutcome::Acked { records: 0 }
        );
        assert_eq!(f.consumer.metrics().snapshot().errors, 1);
    }

    #[tokio::test]
    async fn test_corrupt_gzip_is_poison() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        put(&f.store, "bad.gz", &[0x1F, 0x8B, 0x00, 0x01, 0x02]).await;
        f.queue.send(notification("bad.gz"));

        let message = receive_one(&f.queue).await;
        assert_eq!(
            f.consumer.handle_message(&message).await,
            MessageOutcome::Acked { records: 0 }
        );
        assert_eq!(f.forwarder.push_count(), 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_abandons() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        // No store configured for this bucket
        f.queue.send(
            serde_json::json!({"bucket": "other", "files": [{"path": "x.jsonl"}]}).to_string(),
        );

        let message = receive_one(&f.queue).await;
        let outcome = f.consumer.handle_message(&message).await;

        assert!(matches!(outcome, MessageOutcome::Abandoned(_)));
        assert_eq!(f.queue.len(), 1);
        assert_eq!(f.queue.deleted_count(), 0);
    }

    #[tokio::test]
    async fn test_push_failure_abandons() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |_| {});
        put(&f.store, "a.jsonl", b"{}\n").await;
        f.queue.send(notification("a.jsonl"));
        f.forwarder.set_failing(true);

        let message = receive_one(&f.queue).await;
        let outcome = f.consumer.handle_message(&message).await;

        assert_eq!(outcome, MessageOutcome::Abandoned(ErrorKind::IntakeUnavailable));
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_retained_when_deletes_disabled() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |c| {
            c.delete_consumed_messages = false;
        });
        put(&f.store, "a.jsonl", b"{}\n").await;
        f.queue.send(notification("a.jsonl"));

        let message = receive_one(&f.queue).await;
        assert_eq!(
            f.consumer.handle_message(&message).await,
            MessageOutcome::Retained { records: 1 }
        );
        assert_eq!(f.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_flowlog_discards_counted() {
        let f = fixture(
            CodecConfig::Flowlog(crate::codec::flowlog::FlowlogOptions::default()),
            |_| {},
        );
        put(
            &f.store,
            "flow.log",
            b"version srcaddr dstaddr\n2 10.0.0.1 10.0.0.2\n2 10.0.0.1 8.8.8.8\n",
        )
        .await;
        f.queue.send(notification("flow.log"));

        let message = receive_one(&f.queue).await;
        assert_eq!(
            f.consumer.handle_message(&message).await,
            MessageOutcome::Acked { records: 1 }
        );
        assert_eq!(f.consumer.metrics().snapshot().events_discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_receive_hides_for_configured_visibility() {
        // Queue default is 30s; the consumer asks for 120s
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |c| {
            c.visibility_timeout = 120;
            c.poll_interval = Duration::from_secs(1);
        });
        put(&f.store, "a.jsonl", b"{}\n").await;
        let id = f.queue.send(notification("a.jsonl"));
        f.forwarder.set_failing(true);

        let consumer = f.consumer.clone();
        let task = tokio::spawn(async move { consumer.run().await });
        tokio::time::sleep(Duration::from_secs(100)).await;
        f.consumer.stop();
        task.await.unwrap().unwrap();

        assert_eq!(f.queue.receive_count(&id), Some(1));
        assert_eq!(f.queue.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let f = fixture(CodecConfig::Jsonl { timestamp_field: None }, |c| {
            c.max_concurrency = 2;
        });
        put(&f.store, "a.jsonl", b"{\"a\":1}\n").await;
        for _ in 0..5 {
            f.queue.send(notification("a.jsonl"));
        }

        let consumer = f.consumer.clone();
        let task = tokio::spawn(async move { consumer.run().await });

        tokio::time::timeout(Duration::from_secs(5), async {
            while !f.queue.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        f.consumer.stop();
        task.await.unwrap().unwrap();
        assert_eq!(f.forwarder.records().len(), 5);
        assert_eq!(f.consumer.metrics().snapshot().messages_received, 5);
    }
}
