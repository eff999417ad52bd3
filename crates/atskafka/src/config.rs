// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::parser::{LineParser, NumericFieldSet, UriSplit};
use crate::reader::{FilterExpression, DEFAULT_CONNECT_TIMEOUT};
use crate::supervisor::BackoffPolicy;
use crate::worker::RecordEncoder;

pub const DEFAULT_SOCKET_PATH: &str = "/var/run/log.socket";
pub const DEFAULT_NUMERIC_FIELDS: &str = "response_size,sequence,time_firstbyte";
pub const DEFAULT_KAFKA_CONFIG_PATH: &str = "/etc/atskafka.conf";
pub const DEFAULT_TOPIC: &str = "test_topic";
pub const DEFAULT_LISTEN_ADDR: &str = ":2113";
pub const DEFAULT_FILTER: &str = "http_status:[1-9]";
pub const DEFAULT_SEQUENCE_FIELD: &str = "sequence";
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Runtime configuration, built once at startup and never mutated.
#[derive(Debug, Clone)]
pub struct Config {
    /// Unix socket exposed by the log demultiplexer
    pub socket_path: PathBuf,
    pub connect_timeout: Duration,
    /// Sent to the demultiplexer right after connecting
    pub filter: FilterExpression,
    pub backoff: BackoffPolicy,
    /// Fields whose values are emitted as JSON integers
    pub numeric_fields: NumericFieldSet,
    pub uri_split: Option<UriSplit>,
    /// Field receiving the line's sequence number, if any
    pub sequence_field: Option<String>,
    /// JSON file with librdkafka properties
    pub kafka_config_path: PathBuf,
    pub topic: String,
    pub workers: usize,
    /// Lines buffered between the reader and the workers
    pub channel_capacity: usize,
    /// File overwritten with every librdkafka statistics snapshot
    pub stats_file: Option<PathBuf>,
    /// Address of the metrics endpoint; `None` disables it
    pub listen_addr: Option<SocketAddr>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            filter: FilterExpression::accept_all(),
            backoff: BackoffPolicy::default(),
            numeric_fields: NumericFieldSet::from_list(DEFAULT_NUMERIC_FIELDS),
            uri_split: Some(UriSplit::default()),
            sequence_field: Some(DEFAULT_SEQUENCE_FIELD.to_string()),
            kafka_config_path: PathBuf::from(DEFAULT_KAFKA_CONFIG_PATH),
            topic: DEFAULT_TOPIC.to_string(),
            workers: default_workers(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            stats_file: None,
            listen_addr: parse_listen_addr(DEFAULT_LISTEN_ADDR).ok().flatten(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid(
                "Number of workers must be greater than 0".to_string(),
            ));
        }

        if self.channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "Channel capacity must be greater than 0".to_string(),
            ));
        }

        if self.backoff.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "Maximum connect attempts must be greater than 0".to_string(),
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "Connect timeout must be greater than 0".to_string(),
            ));
        }

        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "Kafka topic cannot be empty".to_string(),
            ));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "Socket path cannot be empty".to_string(),
            ));
        }

        if let Some(split) = &self.uri_split {
            if split.path_field == split.query_field {
                return Err(ConfigError::Invalid(format!(
                    "URI path and query fields must differ, both are '{}'",
                    split.path_field
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn line_parser(&self) -> LineParser {
        LineParser::new(self.numeric_fields.clone(), self.uri_split.clone())
    }

    pub fn record_encoder(&self) -> RecordEncoder {
        RecordEncoder::new(
            self.line_parser(),
            &self.topic,
            self.sequence_field.clone(),
        )
    }
}

/// Parses a listen address, accepting the `:port` shorthand for all interfaces.
///
/// An empty string disables the listener.
pub fn parse_listen_addr(addr: &str) -> Result<Option<SocketAddr>, ConfigError> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Ok(None);
    }

    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    full.parse::<SocketAddr>()
        .map(Some)
        .map_err(|e| ConfigError::Invalid(format!("Invalid listen address '{addr}': {e}")))
}

/// Empty means "disabled" for optional field names.
pub fn optional_field(name: &str) -> Option<String> {
    let name = name.trim();
    (!name.is_empty()).then(|| name.to_string())
}

pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.topic, "test_topic");
        assert_eq!(config.backoff.max_attempts, 16);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
        assert!(config.numeric_fields.contains("response_size"));
        assert!(config.numeric_fields.contains("sequence"));
        assert!(config.numeric_fields.contains("time_firstbyte"));
        assert_eq!(
            config.listen_addr,
            Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 2113))
        );
    }

    #[test]
    fn test_validate_zero_workers() {
        let config = Config {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_zero_channel_capacity() {
        let config = Config {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_attempts() {
        let config = Config {
            backoff: BackoffPolicy {
                unit: Duration::from_millis(1),
                max_attempts: 0,
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_empty_topic() {
        let config = Config {
            topic: "  ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_uri_fields_collide() {
        let config = Config {
            uri_split: Some(UriSplit {
                path_field: "url".to_string(),
                query_field: "url".to_string(),
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let config = Config {
            log_level: "verbose".to_string(),
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Invalid log level"));
    }

    #[test]
    fn test_parse_listen_addr() {
        assert_eq!(
            parse_listen_addr(":2113").unwrap(),
            Some("0.0.0.0:2113".parse().unwrap())
        );
        assert_eq!(
            parse_listen_addr("127.0.0.1:9000").unwrap(),
            Some("127.0.0.1:9000".parse().unwrap())
        );
        assert_eq!(
            parse_listen_addr("[::1]:2113").unwrap(),
            Some("[::1]:2113".parse().unwrap())
        );
        assert_eq!(parse_listen_addr("").unwrap(), None);
        assert!(parse_listen_addr("2113").is_err());
        assert!(parse_listen_addr(":notaport").is_err());
    }

    #[test]
    fn test_optional_field() {
        assert_eq!(optional_field("sequence"), Some("sequence".to_string()));
        assert_eq!(optional_field(""), None);
        assert_eq!(optional_field("  "), None);
    }

    #[test]
    fn test_record_encoder_uses_topic_and_sequence_field() {
        let config = Config {
            topic: "webrequest_text".to_string(),
            ..Default::default()
        };
        let message = config
            .record_encoder()
            .encode(&crate::reader::RawLine {
                sequence: 5,
                text: "hostname:cp1\tresponse_size:512".to_string(),
            })
            .unwrap();
        assert_eq!(&*message.topic, "webrequest_text");

        let value: serde_json::Value = serde_json::from_slice(&message.payload).unwrap();
        assert_eq!(value["response_size"], 512);
        assert_eq!(value["sequence"], 5);
    }
}
