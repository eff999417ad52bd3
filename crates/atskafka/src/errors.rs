// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for every stage of the pipeline.

use std::io;
use std::time::Duration;

/// Failure to turn a log line into a JSON document. The whole line is rejected.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Cannot split '{0}' into 'field:value'")]
    MissingSeparator(String),

    #[error("Value '{value}' of numeric field '{field}' is not an integer")]
    InvalidNumber { field: String, value: String },

    #[error("Failed to serialize record: {0}")]
    Serialize(String),
}

/// Failure on the upstream socket. Every variant ends the current connection.
#[derive(Debug, thiserror::Error)]
pub enum ReaderError {
    #[error("Timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Unable to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    #[error("Unable to send filter expression: {0}")]
    Handshake(#[source] io::Error),

    #[error("Error reading from socket: {0}")]
    Read(#[source] io::Error),

    #[error("Line exceeds {limit} bytes without a newline")]
    LineTooLong { limit: usize },

    #[error("Connection closed by peer")]
    Closed,

    #[error("Line channel closed")]
    SinkClosed,
}

/// Terminal outcome of the reconnect loop.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Giving up trying to connect to {endpoint} after {attempts} attempts")]
    Exhausted { endpoint: String, attempts: u32 },

    #[error("No workers left to receive lines")]
    PipelineClosed,
}

/// Synchronous rejection of a message by the broker client.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Broker client rejected message for topic {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

/// Failure to set up the broker producer. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Unable to read broker configuration {path}: {source}")]
    ReadConfig {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid broker configuration {path}: {reason}")]
    InvalidConfig { path: String, reason: String },

    #[error("Failed to create producer: {0}")]
    Create(String),
}

/// Invalid startup settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid filter expression '{pattern}': {reason}")]
    InvalidFilter { pattern: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
