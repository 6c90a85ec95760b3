//! tributary-connect - queue-mode connector runner
//!
//! ```bash
//! tributary-connect -c cloudtrail.yaml            # run until SIGINT/SIGTERM
//! tributary-connect -c cloudtrail.yaml validate   # check the configuration
//! tributary-connect schema --format yaml          # configuration schema
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tributary_connect::config::ConnectorConfig;
use tributary_connect::forwarder::{BatchingForwarder, IntakeForwarder};
use tributary_connect::lifecycle::{run_then_drain, shutdown_signal, ShutdownOutcome};
use tributary_connect::metrics::{self, ConnectorMetrics};
use tributary_connect::queue::{QueueBackend, QueueConsumer};
use tributary_connect::storage::ObjectFetcher;

#[derive(Parser)]
#[command(name = "tributary-connect")]
#[command(version, about = "Runs an object-queue ingestion connector")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "connector.yaml", env = "TRIBUTARY_CONFIG")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the connector (default)
    Run,
    /// Validate configuration file
    Validate,
    /// Show the configuration schema
    Schema {
        /// Output format (json, yaml)
        #[arg(long, default_value = "json")]
        format: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    if let Some(Commands::Schema { format }) = &cli.command {
        return show_schema(format);
    }

    let config = ConnectorConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Some(Commands::Validate) => validate_config(&config),
        Some(Commands::Run) | None => run(config).await,
        Some(Commands::Schema { .. }) => Ok(()),
    }
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(false))
            .init(),
    }
}

async fn run(config: ConnectorConfig) -> Result<()> {
    info!(connector = %config.name, "Starting tributary-connect");

    if !config.is_queue_mode() {
        anyhow::bail!(
            "connector '{}' has no queue_name; pull connectors run by embedding the library with a PullSource",
            config.name
        );
    }

    if config.metrics.enabled {
        metrics::init_prometheus(config.metrics.listen_addr()?)?;
    }

    let connector_metrics = ConnectorMetrics::new(&config.name);
    let intake = IntakeForwarder::new(
        config.intake_http_client()?,
        config.forwarder_config(),
        connector_metrics.clone(),
    );
    let (forwarder, forwarder_task) = BatchingForwarder::spawn(intake);

    let consumer = QueueConsumer::new(
        config.consumer_config()?,
        build_queue(&config).await?,
        build_fetcher(&config)?,
        config.codec.build()?,
        Arc::new(forwarder),
        connector_metrics.clone(),
    );

    // Once the consumer is gone the batching task sends what it holds and
    // exits; both share one shutdown deadline.
    let drain = async {
        if let Err(e) = forwarder_task.await {
            warn!(error = %e, "Forwarder task failed");
        }
    };
    let outcome = run_then_drain(
        Arc::new(consumer),
        config.max_shutdown(),
        shutdown_signal(),
        drain,
    )
    .await?;
    if outcome == ShutdownOutcome::Aborted {
        warn!("Shutdown deadline reached; unacknowledged messages will be redelivered");
    }

    let snapshot = connector_metrics.snapshot();
    info!(
        received = snapshot.messages_received,
        acked = snapshot.messages_acked,
        forwarded = snapshot.events_forwarded,
        discarded = snapshot.events_discarded,
        errors = snapshot.errors,
        "Goodbye!"
    );
    Ok(())
}

#[cfg(feature = "sqs")]
async fn build_queue(config: &ConnectorConfig) -> Result<Arc<dyn QueueBackend>> {
    use tributary_connect::queue::SqsQueue;

    let queue = SqsQueue::from_env(config.aws.region.clone(), config.aws.endpoint.clone()).await;
    Ok(Arc::new(queue))
}

#[cfg(not(feature = "sqs"))]
async fn build_queue(_config: &ConnectorConfig) -> Result<Arc<dyn QueueBackend>> {
    anyhow::bail!("queue mode requires the 'sqs' feature")
}

#[cfg(feature = "s3")]
fn build_fetcher(config: &ConnectorConfig) -> Result<Arc<dyn ObjectFetcher>> {
    use tributary_connect::storage::ObjectStoreFetcher;

    Ok(Arc::new(ObjectStoreFetcher::s3(
        config.aws.region.clone(),
        config.aws.endpoint.clone(),
    )))
}

#[cfg(not(feature = "s3"))]
fn build_fetcher(_config: &ConnectorConfig) -> Result<Arc<dyn ObjectFetcher>> {
    anyhow::bail!("object fetches require the 's3' feature")
}

fn validate_config(config: &ConnectorConfig) -> Result<()> {
    println!("✓ Configuration valid!\n");
    println!("Connector: {}", config.name);
    println!("  Intake: {}", config.intake_url);
    match &config.queue_name {
        Some(queue) => {
            println!("  Mode: queue ({})", queue);
            println!("  Workers: {}", config.max_concurrency);
            println!("  Batch size: {}", config.batch_size);
            println!("  Visibility timeout: {}s", config.visibility_timeout);
            println!(
                "  Delete consumed messages: {}",
                config.delete_consumed_messages
            );
        }
        None => {
            println!("  Mode: pull");
            println!("  Frequency: {}s", config.frequency);
            println!("  Max lookback: {} days", config.max_lookback_days);
        }
    }
    println!(
        "  Batching: {} records / {} bytes / {}s linger",
        config.max_batch_count, config.max_batch_bytes, config.max_linger
    );
    println!("  Codec: {}", config.codec.build()?.name());
    println!("  Auth: {}", config.auth.build(&config.http)?.name());
    println!(
        "  Metrics: {}",
        if config.metrics.enabled {
            config.metrics.listen.as_str()
        } else {
            "disabled"
        }
    );
    Ok(())
}

fn show_schema(format: &str) -> Result<()> {
    let schema = serde_json::to_value(schemars::schema_for!(ConnectorConfig))?;
    match format {
        "yaml" => println!("{}", serde_yaml::to_string(&schema)?),
        _ => println!("{}", serde_json::to_string_pretty(&schema)?),
    }
    Ok(())
}
