// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pipeline metrics, recorded through the `metrics` facade and exported in the
//! Prometheus text format by `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_gauge, gauge, Counter, Gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const DELIVERY_ERRORS: &str = "atskafka_delivery_errors_total";
pub const DELIVERIES: &str = "atskafka_deliveries_total";
pub const SEQUENCE_NUMBER: &str = "atskafka_seq_number";
pub const LINES_READ: &str = "atskafka_lines_read_total";
pub const PARSE_ERRORS: &str = "atskafka_parse_errors_total";
pub const MESSAGES_PUBLISHED: &str = "atskafka_messages_published_total";
pub const PUBLISH_ERRORS: &str = "atskafka_publish_errors_total";
pub const CONNECTS: &str = "atskafka_connects_total";

/// Installs the process-wide Prometheus recorder. Must run before any
/// [`PipelineMetrics`] is created.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    PrometheusBuilder::new().install_recorder()
}

/// Handles to the pipeline's counters, registered once with the current recorder.
#[derive(Clone)]
pub struct PipelineMetrics {
    lines_read: Counter,
    sequence_number: Gauge,
    parse_errors: Counter,
    messages_published: Counter,
    publish_errors: Counter,
    deliveries: Counter,
    delivery_errors: Counter,
    connects: Counter,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        describe_counter!(DELIVERY_ERRORS, "Total number of Kafka delivery errors");
        describe_counter!(DELIVERIES, "Total number of successful Kafka deliveries");
        describe_gauge!(SEQUENCE_NUMBER, "Latest sequence number");
        describe_counter!(LINES_READ, "Total number of lines read from the socket");
        describe_counter!(
            PARSE_ERRORS,
            "Total number of lines that could not be converted to JSON"
        );
        describe_counter!(
            MESSAGES_PUBLISHED,
            "Total number of messages handed to the Kafka producer"
        );
        describe_counter!(
            PUBLISH_ERRORS,
            "Total number of messages rejected by the Kafka producer"
        );
        describe_counter!(CONNECTS, "Total number of successful socket connections");

        Self {
            lines_read: counter!(LINES_READ),
            sequence_number: gauge!(SEQUENCE_NUMBER),
            parse_errors: counter!(PARSE_ERRORS),
            messages_published: counter!(MESSAGES_PUBLISHED),
            publish_errors: counter!(PUBLISH_ERRORS),
            deliveries: counter!(DELIVERIES),
            delivery_errors: counter!(DELIVERY_ERRORS),
            connects: counter!(CONNECTS),
        }
    }

    /// Records a line read from the socket along with its sequence number.
    pub fn record_line(&self, sequence: u64) {
        self.lines_read.increment(1);
        self.sequence_number.set(sequence as f64);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.increment(1);
    }

    pub fn record_published(&self) {
        self.messages_published.increment(1);
    }

    pub fn record_publish_error(&self) {
        self.publish_errors.increment(1);
    }

    pub fn record_delivery(&self) {
        self.deliveries.increment(1);
    }

    pub fn record_delivery_error(&self) {
        self.delivery_errors.increment(1);
    }

    pub fn record_connect(&self) {
        self.connects.increment(1);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle, PrometheusRecorder};

    use super::PipelineMetrics;

    /// A private recorder, so that tests running in parallel don't share counters.
    pub(crate) struct TestRecorder {
        recorder: PrometheusRecorder,
    }

    impl TestRecorder {
        pub(crate) fn new() -> Self {
            Self {
                recorder: PrometheusBuilder::new().build_recorder(),
            }
        }

        /// Pipeline metrics bound to this recorder, usable from any thread.
        pub(crate) fn pipeline_metrics(&self) -> Arc<PipelineMetrics> {
            Arc::new(metrics::with_local_recorder(
                &self.recorder,
                PipelineMetrics::new,
            ))
        }

        /// Runs `f` with this recorder receiving every macro call.
        pub(crate) fn scoped<T>(&self, f: impl FnOnce() -> T) -> T {
            metrics::with_local_recorder(&self.recorder, f)
        }

        pub(crate) fn handle(&self) -> PrometheusHandle {
            self.recorder.handle()
        }

        pub(crate) fn value(&self, name: &str) -> Option<f64> {
            sample(&self.handle().render(), name)
        }
    }

    /// Value of the sample exactly named `name` (labels included) in a rendered scrape.
    pub(crate) fn sample(rendered: &str, name: &str) -> Option<f64> {
        rendered.lines().find_map(|line| {
            line.strip_prefix(name)
                .and_then(|rest| rest.strip_prefix(' '))
                .and_then(|value| value.trim().parse().ok())
        })
    }
}
