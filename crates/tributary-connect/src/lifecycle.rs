//! Connector lifecycle
//!
//! [`ConnectorRuntime`] owns the task a connector runs on. Stopping asks the
//! connector to finish at its next safe point (between messages, between
//! pages) and waits at most `max_shutdown`; past the deadline the task is
//! aborted and unacknowledged work is left for redelivery.

use crate::error::{ConnectorError, ConnectorResult};
use crate::pull::PullConnector;
use crate::queue::QueueConsumer;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// A long-running connector
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    /// Run until stopped
    async fn run(&self) -> ConnectorResult<()>;

    /// Request a graceful stop; `run` returns once in-flight work is done
    fn stop(&self);
}

#[async_trait]
impl Connector for QueueConsumer {
    fn name(&self) -> &str {
        self.metrics().connector()
    }

    async fn run(&self) -> ConnectorResult<()> {
        QueueConsumer::run(self).await
    }

    fn stop(&self) {
        QueueConsumer::stop(self)
    }
}

#[async_trait]
impl Connector for PullConnector {
    fn name(&self) -> &str {
        self.metrics().connector()
    }

    async fn run(&self) -> ConnectorResult<()> {
        PullConnector::run(self).await
    }

    fn stop(&self) {
        PullConnector::stop(self)
    }
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The connector returned within the deadline
    Graceful,
    /// The deadline passed and the task was aborted
    Aborted,
}

/// Runs one connector on its own task
pub struct ConnectorRuntime {
    connector: Arc<dyn Connector>,
    max_shutdown: Duration,
    task: Option<JoinHandle<ConnectorResult<()>>>,
}

impl std::fmt::Debug for ConnectorRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRuntime")
            .field("connector", &self.connector.name())
            .field("max_shutdown", &self.max_shutdown)
            .field("running", &self.is_running())
            .finish()
    }
}

impl ConnectorRuntime {
    pub fn new(connector: Arc<dyn Connector>, max_shutdown: Duration) -> Self {
        Self {
            connector,
            max_shutdown,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub fn start(&mut self) -> ConnectorResult<()> {
        if self.task.is_some() {
            return Err(ConnectorError::config(format!(
                "connector '{}' already started",
                self.connector.name()
            )));
        }
        let connector = self.connector.clone();
        info!(connector = %connector.name(), "Starting connector");
        self.task = Some(tokio::spawn(async move { connector.run().await }));
        Ok(())
    }

    /// Signal the connector to stop without waiting
    pub fn stop(&self) {
        info!(connector = %self.connector.name(), "Stop requested");
        self.connector.stop();
    }

    /// Wait for the connector task to end on its own
    pub async fn wait(&mut self) -> ConnectorResult<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let joined = task.await;
        self.task = None;
        flatten(joined)
    }

    /// Stop, then wait up to `max_shutdown` before aborting
    pub async fn shutdown(&mut self) -> ConnectorResult<ShutdownOutcome> {
        self.shutdown_by(Instant::now() + self.max_shutdown).await
    }

    /// Stop, then wait until `deadline` before aborting
    pub async fn shutdown_by(&mut self, deadline: Instant) -> ConnectorResult<ShutdownOutcome> {
        self.stop();
        let Some(task) = self.task.as_mut() else {
            return Ok(ShutdownOutcome::Graceful);
        };

        match tokio::time::timeout_at(deadline, &mut *task).await {
            Ok(joined) => {
                self.task = None;
                flatten(joined)?;
                info!(connector = %self.connector.name(), "Connector stopped");
                Ok(ShutdownOutcome::Graceful)
            }
            Err(_) => {
                warn!(
                    connector = %self.connector.name(),
                    deadline_secs = self.max_shutdown.as_secs(),
                    "Shutdown deadline reached, aborting connector"
                );
                task.abort();
                self.task = None;
                Ok(ShutdownOutcome::Aborted)
            }
        }
    }
}

fn flatten(joined: Result<ConnectorResult<()>, tokio::task::JoinError>) -> ConnectorResult<()> {
    joined.map_err(|e| ConnectorError::Other(anyhow::anyhow!("connector task failed: {}", e)))?
}

/// Completes on SIGINT or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Run `connector` until it ends or `signal` completes, then shut it down
/// within `max_shutdown`.
pub async fn run_until<F>(
    connector: Arc<dyn Connector>,
    max_shutdown: Duration,
    signal: F,
) -> ConnectorResult<ShutdownOutcome>
where
    F: Future<Output = ()>,
{
    run_then_drain(connector, max_shutdown, signal, async {}).await
}

/// Like [`run_until`], then runs `drain` (flushing buffered output) in
/// whatever remains of the same `max_shutdown` budget.
///
/// The connector is dropped before `drain` starts, so handles it held
/// (a forwarder, for instance) are released.
pub async fn run_then_drain<F, D>(
    connector: Arc<dyn Connector>,
    max_shutdown: Duration,
    signal: F,
    drain: D,
) -> ConnectorResult<ShutdownOutcome>
where
    F: Future<Output = ()>,
    D: Future<Output = ()>,
{
    let name = connector.name().to_string();
    let mut runtime = ConnectorRuntime::new(connector, max_shutdown);
    runtime.start()?;

    let (outcome, deadline) = tokio::select! {
        _ = signal => {
            let deadline = Instant::now() + max_shutdown;
            (runtime.shutdown_by(deadline).await?, deadline)
        }
        result = runtime.wait() => {
            result?;
            (ShutdownOutcome::Graceful, Instant::now() + max_shutdown)
        }
    };
    drop(runtime);

    match tokio::time::timeout_at(deadline, drain).await {
        Ok(()) => Ok(outcome),
        Err(_) => {
            warn!(connector = %name, "Shutdown deadline reached while draining");
            Ok(ShutdownOutcome::Aborted)
        }
    }
}
