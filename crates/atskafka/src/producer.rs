// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Kafka side of the bridge.
//!
//! [`KafkaPublisher`] wraps an rdkafka `ThreadedProducer` whose context turns delivery
//! callbacks and statistics callbacks into [`ProducerEvent`]s.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{BaseRecord, DeliveryResult, ProducerContext, ThreadedProducer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientContext;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, trace};

use crate::delivery::{DeliveryReport, EventReceiver, EventSender, ProducerEvent};
use crate::errors::{BrokerError, PublishError};
use crate::worker::{BrokerMessage, Publisher};

// Wait before retrying a message while librdkafka's local queue is full
const QUEUE_FULL_BACKOFF: Duration = Duration::from_millis(10);

/// librdkafka properties, already rendered as strings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerConfig {
    properties: BTreeMap<String, String>,
}

impl BrokerConfig {
    /// Parses a JSON object mapping librdkafka property names to scalar values.
    ///
    /// Booleans become `"true"`/`"false"`, integral numbers are written without a
    /// fractional part. `source` only appears in error messages.
    pub fn from_json(source: &str, json: &str) -> Result<Self, BrokerError> {
        let invalid = |reason: String| BrokerError::InvalidConfig {
            path: source.to_string(),
            reason,
        };

        let value: Value = serde_json::from_str(json).map_err(|e| invalid(e.to_string()))?;
        let Value::Object(map) = value else {
            return Err(invalid("expected a JSON object".to_string()));
        };

        let mut properties = BTreeMap::new();
        for (key, value) in map {
            let rendered = match value {
                Value::String(s) => s,
                Value::Bool(b) => b.to_string(),
                Value::Number(n) => render_number(&n),
                other => {
                    return Err(invalid(format!(
                        "unsupported value for '{key}': {other}"
                    )))
                }
            };
            properties.insert(key, rendered);
        }

        Ok(Self { properties })
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub(crate) fn len(&self) -> usize {
        self.properties.len()
    }

    fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        for (key, value) in &self.properties {
            config.set(key, value);
        }
        config
    }
}

fn render_number(n: &serde_json::Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{f:.0}"),
        _ => n.to_string(),
    }
}

pub fn load_broker_config(path: &Path) -> Result<BrokerConfig, BrokerError> {
    let json = std::fs::read_to_string(path).map_err(|source| BrokerError::ReadConfig {
        path: path.display().to_string(),
        source,
    })?;
    let config = BrokerConfig::from_json(&path.display().to_string(), &json)?;
    debug!(
        "Loaded {} broker properties from {}",
        config.len(),
        path.display()
    );
    Ok(config)
}

/// Forwards librdkafka callbacks onto the event stream.
pub struct EventContext {
    events: EventSender,
}

impl ClientContext for EventContext {
    fn stats_raw(&self, statistics: &[u8]) {
        let snapshot = String::from_utf8_lossy(statistics).into_owned();
        if self.events.send(ProducerEvent::Statistics(snapshot)).is_err() {
            trace!("Dropping statistics snapshot: event stream closed");
        }
    }
}

impl ProducerContext for EventContext {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: Self::DeliveryOpaque) {
        let report = match result {
            Ok(message) => DeliveryReport {
                topic: message.topic().to_string(),
                partition: message.partition(),
                error: None,
            },
            Err((error, message)) => DeliveryReport {
                topic: message.topic().to_string(),
                partition: message.partition(),
                error: Some(error.to_string()),
            },
        };
        if self.events.send(ProducerEvent::Delivery(report)).is_err() {
            trace!("Dropping delivery report: event stream closed");
        }
    }
}

pub struct KafkaPublisher {
    producer: ThreadedProducer<EventContext>,
}

impl KafkaPublisher {
    /// Creates the producer. Delivery reports and statistics arrive on the returned
    /// receiver, which should be handed to a `DeliveryFeedbackLoop`.
    pub fn new(config: &BrokerConfig) -> Result<(Self, EventReceiver), BrokerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let producer = config
            .client_config()
            .create_with_context(EventContext { events: tx })
            .map_err(|e: KafkaError| BrokerError::Create(e.to_string()))?;
        Ok((Self { producer }, rx))
    }
}

#[async_trait]
impl Publisher for KafkaPublisher {
    /// Enqueues the message, waiting for room while the local queue is full.
    async fn publish(&self, message: BrokerMessage) -> Result<(), PublishError> {
        loop {
            let record =
                BaseRecord::<(), [u8]>::to(&message.topic).payload(message.payload.as_slice());
            match self.producer.send(record) {
                Ok(()) => return Ok(()),
                Err((KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull), _)) => {}
                Err((e, _)) => {
                    return Err(PublishError::Rejected {
                        topic: message.topic.to_string(),
                        reason: e.to_string(),
                    })
                }
            }
            sleep(QUEUE_FULL_BACKOFF).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_broker_config_from_json() {
        let config = BrokerConfig::from_json(
            "inline",
            r#"{
                "bootstrap.servers": "kafka-jumbo1001.eqiad.wmnet:9092",
                "client.id": "atskafka",
                "statistics.interval.ms": 60000,
                "linger.ms": 5.0,
                "batch.num.messages": 1e4,
                "enable.idempotence": true
            }"#,
        )
        .unwrap();

        assert_eq!(config.len(), 6);
        assert_eq!(
            config.get("bootstrap.servers"),
            Some("kafka-jumbo1001.eqiad.wmnet:9092")
        );
        assert_eq!(config.get("statistics.interval.ms"), Some("60000"));
        assert_eq!(config.get("linger.ms"), Some("5"));
        assert_eq!(config.get("batch.num.messages"), Some("10000"));
        assert_eq!(config.get("enable.idempotence"), Some("true"));
    }

    #[test]
    fn test_broker_config_rejects_bad_documents() {
        for json in [
            "[]",
            r#""bootstrap.servers""#,
            r#"{"bootstrap.servers": null}"#,
            r#"{"bootstrap.servers": ["a", "b"]}"#,
            r#"{"client.id": "atskafka""#,
        ] {
            assert!(
                matches!(
                    BrokerConfig::from_json("inline", json),
                    Err(BrokerError::InvalidConfig { .. })
                ),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_load_broker_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("atskafka.conf");
        std::fs::write(
            &path,
            r#"{"client.id": "atskafka", "statistics.interval.ms": 60000}"#,
        )
        .unwrap();

        let config = load_broker_config(&path).unwrap();
        assert_eq!(config.get("client.id"), Some("atskafka"));
        assert_eq!(config.get("statistics.interval.ms"), Some("60000"));

        let missing = load_broker_config(&dir.path().join("missing.conf"));
        assert!(matches!(missing, Err(BrokerError::ReadConfig { .. })));
    }

    #[test]
    fn test_unknown_property_fails_producer_creation() {
        let mut config = BrokerConfig::default();
        config.set("no.such.property", "1");
        assert!(matches!(
            KafkaPublisher::new(&config),
            Err(BrokerError::Create(_))
        ));
    }

    #[tokio::test]
    async fn test_undeliverable_message_is_reported() {
        let mut config = BrokerConfig::default();
        // nothing listens there
        config.set("bootstrap.servers", "127.0.0.1:1");
        config.set("message.timeout.ms", "100");
        let (publisher, mut events) = KafkaPublisher::new(&config).unwrap();
        let publisher = Arc::new(publisher);

        publisher
            .publish(BrokerMessage {
                topic: Arc::from("test_topic"),
                payload: br#"{"hostname":"cp1"}"#.to_vec(),
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(30), async {
            loop {
                match events.recv().await {
                    Some(ProducerEvent::Delivery(report)) => return report,
                    Some(ProducerEvent::Statistics(_)) => continue,
                    None => panic!("event stream closed"),
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(event.topic, "test_topic");
        assert!(event.error.is_some());
    }
}
