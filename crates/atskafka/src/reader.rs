// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client side of the log demultiplexer socket.
//!
//! A session is two steps: [`SocketReader::connect`] dials the socket and sends the
//! filter expression as the first and only outbound message, then
//! [`Connection::forward`] reads newline-delimited lines and pushes them, tagged with a
//! per-connection sequence number, onto the work channel until the connection ends.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, FramedRead};
use tracing::{debug, trace};

use crate::errors::{ConfigError, ReaderError};
use crate::metrics::PipelineMetrics;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(1000);

// Sent when no filter is configured. The demultiplexer treats it as "accept all".
const ACCEPT_ALL: &str = " ";

/// Longest line accepted from the upstream. A longer line ends the connection.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// A line received from the socket, tagged with its position on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawLine {
    pub sequence: u64,
    pub text: String,
}

pub type LineSender = mpsc::Sender<RawLine>;
pub type LineReceiver = mpsc::Receiver<RawLine>;

/// Regular expression sent to the demultiplexer to select which lines it forwards.
///
/// The pattern is compiled once at startup so that a typo surfaces as a configuration
/// error instead of a silently empty stream. It is sent verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterExpression {
    pattern: String,
}

impl FilterExpression {
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.trim().is_empty() {
            return Ok(Self::accept_all());
        }
        regex::Regex::new(pattern).map_err(|e| ConfigError::InvalidFilter {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
        })
    }

    pub fn accept_all() -> Self {
        Self {
            pattern: String::new(),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn handshake(&self) -> &[u8] {
        if self.pattern.is_empty() {
            ACCEPT_ALL.as_bytes()
        } else {
            self.pattern.as_bytes()
        }
    }
}

/// Opens the transport to the upstream demultiplexer.
#[async_trait]
pub trait Dialer: Send + Sync {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Human readable description of the upstream, used in logs and errors.
    fn endpoint(&self) -> String;

    async fn dial(&self) -> Result<Self::Stream, ReaderError>;
}

/// Dials a Unix domain socket with a bounded connect timeout.
#[derive(Debug, Clone)]
pub struct UnixDialer {
    path: PathBuf,
    timeout: Duration,
}

impl UnixDialer {
    pub fn new(path: impl AsRef<Path>, timeout: Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            timeout,
        }
    }
}

#[async_trait]
impl Dialer for UnixDialer {
    type Stream = UnixStream;

    fn endpoint(&self) -> String {
        self.path.display().to_string()
    }

    async fn dial(&self) -> Result<UnixStream, ReaderError> {
        match tokio::time::timeout(self.timeout, UnixStream::connect(&self.path)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ReaderError::Connect {
                endpoint: self.endpoint(),
                source,
            }),
            Err(_) => Err(ReaderError::ConnectTimeout {
                endpoint: self.endpoint(),
                timeout: self.timeout,
            }),
        }
    }
}

pub struct SocketReader<D> {
    dialer: D,
    filter: FilterExpression,
    metrics: Arc<PipelineMetrics>,
}

impl<D: Dialer> SocketReader<D> {
    pub fn new(dialer: D, filter: FilterExpression, metrics: Arc<PipelineMetrics>) -> Self {
        Self {
            dialer,
            filter,
            metrics,
        }
    }

    pub fn endpoint(&self) -> String {
        self.dialer.endpoint()
    }

    /// Dials the upstream and sends the filter expression.
    ///
    /// A returned [`Connection`] counts as a successful connection attempt.
    pub async fn connect(&self) -> Result<Connection<D::Stream>, ReaderError> {
        let mut stream = self.dialer.dial().await?;

        stream
            .write_all(self.filter.handshake())
            .await
            .map_err(ReaderError::Handshake)?;
        stream.flush().await.map_err(ReaderError::Handshake)?;
        debug!(
            "Sent filter expression '{}' to {}",
            self.filter.pattern(),
            self.dialer.endpoint()
        );

        Ok(Connection::new(stream, Arc::clone(&self.metrics)))
    }
}

/// An established, filtered connection to the upstream.
pub struct Connection<S> {
    lines: FramedRead<S, AnyDelimiterCodec>,
    metrics: Arc<PipelineMetrics>,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> Connection<S> {
    fn new(stream: S, metrics: Arc<PipelineMetrics>) -> Self {
        let codec =
            AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_LINE_LENGTH);
        Self {
            lines: FramedRead::new(stream, codec),
            metrics,
        }
    }

    /// Forwards lines to `sink` until the connection ends, returning the reason it ended.
    ///
    /// Sequence numbers start at 0 for every connection. A full channel suspends
    /// reading, which in turn leaves unread data in the socket.
    pub async fn forward(mut self, sink: &LineSender) -> ReaderError {
        let mut sequence: u64 = 0;

        loop {
            match self.lines.next().await {
                None => return ReaderError::Closed,
                Some(Ok(chunk)) => {
                    let text = decode_line(&chunk);
                    trace!("Received line {}: {}", sequence, text);
                    if sink.send(RawLine { sequence, text }).await.is_err() {
                        return ReaderError::SinkClosed;
                    }
                    self.metrics.record_line(sequence);
                    sequence += 1;
                }
                Some(Err(AnyDelimiterCodecError::MaxChunkLengthExceeded)) => {
                    return ReaderError::LineTooLong {
                        limit: MAX_LINE_LENGTH,
                    }
                }
                Some(Err(AnyDelimiterCodecError::Io(e))) => return ReaderError::Read(e),
            }
        }
    }
}

// The codec has already removed the `\n`; a `\r` from a `\r\n` terminator may remain.
// Invalid UTF-8 is replaced rather than dropping the connection.
fn decode_line(chunk: &[u8]) -> String {
    let line = chunk.strip_suffix(b"\r").unwrap_or(chunk);
    String::from_utf8_lossy(line).into_owned()
}
