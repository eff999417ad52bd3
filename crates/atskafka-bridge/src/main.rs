// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use atskafka::{
    config::{self, Config},
    delivery::{DeliveryFeedbackLoop, FileStatsSink, LatestStats, PrometheusStatsSink},
    metrics::{install_recorder, PipelineMetrics},
    parser::{NumericFieldSet, UriSplit},
    producer::{load_broker_config, KafkaPublisher},
    reader::{FilterExpression, SocketReader, UnixDialer},
    server::MetricsServer,
    supervisor::{BackoffPolicy, ReconnectSupervisor},
    worker::WorkerPool,
};

/// Reads access log lines from a Unix socket and publishes them to Kafka as JSON
#[derive(Parser, Debug)]
#[command(name = "atskafka")]
#[command(version, about, long_about = None)]
struct Args {
    /// Unix socket to read log lines from
    #[arg(long, env = "ATSKAFKA_SOCKET", default_value = config::DEFAULT_SOCKET_PATH)]
    socket: PathBuf,

    /// Comma separated list of fields whose values are integers
    #[arg(long, env = "ATSKAFKA_NUMERIC_FIELDS", default_value = config::DEFAULT_NUMERIC_FIELDS)]
    numeric_fields: String,

    /// JSON file with librdkafka configuration properties
    #[arg(long, env = "ATSKAFKA_KAFKA_CONFIG", default_value = config::DEFAULT_KAFKA_CONFIG_PATH)]
    kafka_config: PathBuf,

    /// Kafka topic to publish to
    #[arg(long, env = "ATSKAFKA_KAFKA_TOPIC", default_value = config::DEFAULT_TOPIC)]
    kafka_topic: String,

    /// Listen address for the metrics endpoint, empty to disable
    #[arg(long, env = "ATSKAFKA_ADDR", default_value = config::DEFAULT_LISTEN_ADDR)]
    addr: String,

    /// Only lines matching this regex are sent by the socket, empty for all lines
    #[arg(long, env = "ATSKAFKA_VALID_LOGS_REGEX", default_value = config::DEFAULT_FILTER)]
    valid_logs_regex: String,

    /// Write librdkafka statistics to this file
    #[arg(long, env = "ATSKAFKA_STATS_FILE")]
    stats_file: Option<PathBuf>,

    /// Number of workers converting lines to JSON [default: available parallelism]
    #[arg(long, env = "ATSKAFKA_WORKERS")]
    workers: Option<usize>,

    /// Lines buffered between the socket reader and the workers
    #[arg(long, env = "ATSKAFKA_CHANNEL_CAPACITY", default_value_t = config::DEFAULT_CHANNEL_CAPACITY)]
    channel_capacity: usize,

    /// Consecutive failed connection attempts before giving up
    #[arg(long, env = "ATSKAFKA_MAX_CONNECT_ATTEMPTS", default_value_t = 16)]
    max_connect_attempts: u32,

    /// Socket connect timeout in milliseconds
    #[arg(long, env = "ATSKAFKA_CONNECT_TIMEOUT_MS", default_value_t = 1000)]
    connect_timeout_ms: u64,

    /// Base reconnect delay in milliseconds, doubled after every failure
    #[arg(long, env = "ATSKAFKA_BACKOFF_UNIT_MS", default_value_t = 1)]
    backoff_unit_ms: u64,

    /// Field receiving each line's sequence number, empty to disable
    #[arg(long, env = "ATSKAFKA_SEQUENCE_FIELD", default_value = config::DEFAULT_SEQUENCE_FIELD)]
    sequence_field: String,

    /// Field split into path and query on its first '?', empty to disable
    #[arg(long, env = "ATSKAFKA_URI_PATH_FIELD", default_value = "uri_path")]
    uri_path_field: String,

    /// Field receiving the query part of the split URI
    #[arg(long, env = "ATSKAFKA_URI_QUERY_FIELD", default_value = "uri_query")]
    uri_query_field: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "ATSKAFKA_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<Config> {
        let uri_split = config::optional_field(&self.uri_path_field).map(|path_field| UriSplit {
            path_field,
            query_field: self.uri_query_field.trim().to_string(),
        });

        let config = Config {
            socket_path: self.socket,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            filter: FilterExpression::new(&self.valid_logs_regex)?,
            backoff: BackoffPolicy {
                unit: Duration::from_millis(self.backoff_unit_ms),
                max_attempts: self.max_connect_attempts,
            },
            numeric_fields: NumericFieldSet::from_list(&self.numeric_fields),
            uri_split,
            sequence_field: config::optional_field(&self.sequence_field),
            kafka_config_path: self.kafka_config,
            topic: self.kafka_topic,
            workers: self.workers.unwrap_or_else(config::default_workers),
            channel_capacity: self.channel_capacity,
            stats_file: self.stats_file,
            listen_addr: config::parse_listen_addr(&self.addr)?,
            log_level: self.log_level.to_lowercase(),
        };

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
pub async fn main() {
    let args = Args::parse();
    let log_level = args.log_level.to_lowercase();

    let env_filter = format!("hyper=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e:#}");
            process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let broker_config = load_broker_config(&config.kafka_config_path)?;
    let (publisher, events) =
        KafkaPublisher::new(&broker_config).context("Kafka producer initialization failed")?;
    let publisher = Arc::new(publisher);

    // handles created before this point would record into the no-op recorder
    let prometheus = install_recorder().context("Unable to install metrics recorder")?;
    let metrics = Arc::new(PipelineMetrics::new());
    let cancel_token = CancellationToken::new();

    let latest_stats = LatestStats::default();
    let mut feedback = DeliveryFeedbackLoop::new(events, Arc::clone(&metrics))
        .with_sink(Arc::new(latest_stats.clone()))
        .with_sink(Arc::new(PrometheusStatsSink));
    if let Some(path) = &config.stats_file {
        feedback = feedback.with_sink(Arc::new(FileStatsSink::new(path)));
    }
    tokio::spawn(feedback.run());

    if let Some(addr) = config.listen_addr {
        match MetricsServer::bind(addr, prometheus, latest_stats, cancel_token.clone()).await {
            Ok(server) => {
                tokio::spawn(async move {
                    if let Err(e) = server.run().await {
                        error!("Metrics server stopped: {}", e);
                    }
                });
            }
            Err(e) => warn!("Unable to serve metrics on {}: {}", addr, e),
        }
    }

    let (line_tx, line_rx) = mpsc::channel(config.channel_capacity);
    let _workers = WorkerPool::new(
        config.workers,
        config.record_encoder(),
        publisher,
        Arc::clone(&metrics),
    )
    .spawn(line_rx);

    let supervisor = ReconnectSupervisor::new(
        SocketReader::new(
            UnixDialer::new(&config.socket_path, config.connect_timeout),
            config.filter.clone(),
            Arc::clone(&metrics),
        ),
        config.backoff,
        cancel_token.clone(),
        Arc::clone(&metrics),
    );

    info!(
        "Shipping lines from {} to Kafka topic {} with {} workers",
        config.socket_path.display(),
        config.topic,
        config.workers
    );

    tokio::select! {
        result = supervisor.run(line_tx) => {
            cancel_token.cancel();
            result?;
        }
        captured = shutdown_signal() => {
            info!("captured {}, exiting..", captured?);
            cancel_token.cancel();
        }
    }

    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Unable to listen for SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Unable to listen for SIGINT")?;

    let captured = tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };
    Ok(captured)
}
