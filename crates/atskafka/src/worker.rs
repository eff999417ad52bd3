// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pool of workers turning raw lines into broker messages.
//!
//! All workers pull from the same channel, so lines are spread across them as they
//! become free. Publish order across workers is not preserved.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::errors::{ParseError, PublishError};
use crate::metrics::PipelineMetrics;
use crate::parser::{FieldValue, LineParser};
use crate::reader::{LineReceiver, RawLine};

/// A JSON document addressed to a topic. The partition is left to the broker client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: Arc<str>,
    pub payload: Vec<u8>,
}

/// The only capability workers need from the broker client.
///
/// Implementations may wait while the client's local queue is full; that wait is what
/// pushes back on the socket reader.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, message: BrokerMessage) -> Result<(), PublishError>;
}

/// How a line becomes a message. Shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct RecordEncoder {
    parser: LineParser,
    topic: Arc<str>,
    sequence_field: Option<String>,
}

impl RecordEncoder {
    pub fn new(parser: LineParser, topic: &str, sequence_field: Option<String>) -> Self {
        Self {
            parser,
            topic: Arc::from(topic),
            sequence_field,
        }
    }

    /// Parses the line and, when configured, adds its sequence number to the record.
    /// A sequence field already present in the line is left untouched.
    pub fn encode(&self, line: &RawLine) -> Result<BrokerMessage, ParseError> {
        let mut record = self.parser.parse(&line.text)?;

        if let Some(field) = &self.sequence_field {
            if record.get(field).is_none() {
                let sequence = i64::try_from(line.sequence).unwrap_or(i64::MAX);
                record.insert(field.as_str(), FieldValue::Integer(sequence));
            }
        }

        Ok(BrokerMessage {
            topic: Arc::clone(&self.topic),
            payload: record.to_json()?,
        })
    }
}

pub struct WorkerPool<P> {
    workers: usize,
    encoder: Arc<RecordEncoder>,
    publisher: Arc<P>,
    metrics: Arc<PipelineMetrics>,
}

impl<P: Publisher + 'static> WorkerPool<P> {
    pub fn new(
        workers: usize,
        encoder: RecordEncoder,
        publisher: Arc<P>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            encoder: Arc::new(encoder),
            publisher,
            metrics,
        }
    }

    /// Spawns the workers. They run until every sender of `lines` is dropped.
    pub fn spawn(self, lines: LineReceiver) -> JoinSet<()> {
        let lines = Arc::new(TokioMutex::new(lines));
        let mut joinset = JoinSet::new();

        for id in 0..self.workers {
            let worker = Worker {
                id,
                lines: Arc::clone(&lines),
                encoder: Arc::clone(&self.encoder),
                publisher: Arc::clone(&self.publisher),
                metrics: Arc::clone(&self.metrics),
            };
            joinset.spawn(worker.run());
        }

        debug!("Started {} workers", self.workers);
        joinset
    }
}

struct Worker<P> {
    id: usize,
    lines: Arc<TokioMutex<LineReceiver>>,
    encoder: Arc<RecordEncoder>,
    publisher: Arc<P>,
    metrics: Arc<PipelineMetrics>,
}

impl<P: Publisher> Worker<P> {
    async fn run(self) {
        loop {
            // Only one idle worker waits on the channel at a time; the rest wait on the lock.
            let line = self.lines.lock().await.recv().await;
            let Some(line) = line else {
                break;
            };
            self.handle(line).await;
        }
        debug!("Worker {} stopped: line channel closed", self.id);
    }

    async fn handle(&self, line: RawLine) {
        let message = match self.encoder.encode(&line) {
            Ok(message) => message,
            Err(e) => {
                self.metrics.record_parse_error();
                error!("Error converting '{}' to JSON: {}", line.text, e);
                return;
            }
        };

        match self.publisher.publish(message).await {
            Ok(()) => self.metrics.record_published(),
            Err(e) => {
                self.metrics.record_publish_error();
                error!("Failed to publish line {}: {}", line.sequence, e);
            }
        }
    }
}
