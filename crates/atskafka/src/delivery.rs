// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Consumer of the broker client's event stream.
//!
//! Delivery failures are counted and logged, successful deliveries are only counted.
//! Statistics snapshots are handed verbatim to every configured [`StatsSink`].

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::gauge;
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, error};

use crate::metrics::PipelineMetrics;

/// Outcome of one message, reported asynchronously by the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub topic: String,
    pub partition: i32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerEvent {
    Delivery(DeliveryReport),
    /// Opaque JSON blob describing the broker client's internal state
    Statistics(String),
}

pub type EventSender = mpsc::UnboundedSender<ProducerEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<ProducerEvent>;

/// Destination for statistics snapshots.
#[async_trait]
pub trait StatsSink: Send + Sync {
    async fn forward(&self, snapshot: &str) -> io::Result<()>;
}

/// Replaces a file with every new snapshot.
///
/// The snapshot is written to a sibling temporary file which is then renamed over the
/// target, so readers never see a partial document.
#[derive(Debug, Clone)]
pub struct FileStatsSink {
    path: PathBuf,
}

impl FileStatsSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl StatsSink for FileStatsSink {
    async fn forward(&self, snapshot: &str) -> io::Result<()> {
        let mut staging = self.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, snapshot).await?;
        tokio::fs::rename(&staging, &self.path).await
    }
}

// Subset of the librdkafka statistics document exported as gauges. Missing fields
// read as zero.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ClientStatistics {
    msg_cnt: f64,
    msg_size: f64,
    tx: f64,
    rx: f64,
    txmsgs: f64,
    rxmsgs: f64,
    brokers: BTreeMap<String, BrokerStatistics>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct BrokerStatistics {
    outbuf_cnt: f64,
    rtt: Window,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Window {
    avg: f64,
}

/// Publishes selected librdkafka statistics as gauges on the installed metrics recorder.
#[derive(Debug, Clone, Default)]
pub struct PrometheusStatsSink;

impl PrometheusStatsSink {
    pub fn record(&self, snapshot: &str) -> Result<(), serde_json::Error> {
        let stats: ClientStatistics = serde_json::from_str(snapshot)?;

        gauge!("atskafka_rdkafka_msg_cnt").set(stats.msg_cnt);
        gauge!("atskafka_rdkafka_msg_size_bytes").set(stats.msg_size);
        gauge!("atskafka_rdkafka_tx_requests").set(stats.tx);
        gauge!("atskafka_rdkafka_rx_responses").set(stats.rx);
        gauge!("atskafka_rdkafka_txmsgs").set(stats.txmsgs);
        gauge!("atskafka_rdkafka_rxmsgs").set(stats.rxmsgs);

        for (name, broker) in stats.brokers {
            gauge!("atskafka_rdkafka_broker_rtt_avg_microseconds", "broker" => name.clone())
                .set(broker.rtt.avg);
            gauge!("atskafka_rdkafka_broker_outbuf_cnt", "broker" => name).set(broker.outbuf_cnt);
        }
        Ok(())
    }
}

#[async_trait]
impl StatsSink for PrometheusStatsSink {
    async fn forward(&self, snapshot: &str) -> io::Result<()> {
        self.record(snapshot)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Keeps the most recent snapshot in memory for the HTTP endpoint.
#[derive(Debug, Clone, Default)]
pub struct LatestStats {
    snapshot: Arc<RwLock<Option<String>>>,
}

impl LatestStats {
    pub async fn get(&self) -> Option<String> {
        self.snapshot.read().await.clone()
    }
}

#[async_trait]
impl StatsSink for LatestStats {
    async fn forward(&self, snapshot: &str) -> io::Result<()> {
        *self.snapshot.write().await = Some(snapshot.to_string());
        Ok(())
    }
}

pub struct DeliveryFeedbackLoop {
    events: EventReceiver,
    sinks: Vec<Arc<dyn StatsSink>>,
    metrics: Arc<PipelineMetrics>,
}

impl DeliveryFeedbackLoop {
    pub fn new(events: EventReceiver, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            events,
            sinks: Vec::new(),
            metrics,
        }
    }

    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Drains events until the producer drops its end of the stream.
    pub async fn run(mut self) {
        debug!("Delivery feedback loop started");

        while let Some(event) = self.events.recv().await {
            match event {
                ProducerEvent::Delivery(report) => self.handle_delivery(report),
                ProducerEvent::Statistics(snapshot) => {
                    for sink in &self.sinks {
                        if let Err(e) = sink.forward(&snapshot).await {
                            error!("Error updating stats: {}", e);
                        }
                    }
                }
            }
        }

        debug!("Delivery feedback loop stopped: event stream closed");
    }

    fn handle_delivery(&self, report: DeliveryReport) {
        match report.error {
            Some(error) => {
                self.metrics.record_delivery_error();
                error!(
                    "Delivery failed: {}[{}]: {}",
                    report.topic, report.partition, error
                );
            }
            None => self.metrics.record_delivery(),
        }
    }
}
