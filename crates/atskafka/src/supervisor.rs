// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Reconnect loop around [`SocketReader`].
//!
//! Consecutive failures back off exponentially (`unit * 2^attempt`) and the loop gives
//! up after `max_attempts` of them. Any successful connection resets the counter.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::errors::{ReaderError, SupervisorError};
use crate::metrics::PipelineMetrics;
use crate::reader::{Dialer, LineSender, SocketReader};

pub const DEFAULT_MAX_CONNECT_ATTEMPTS: u32 = 16;
pub const DEFAULT_BACKOFF_UNIT: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry; doubles with every consecutive failure
    pub unit: Duration,
    /// Consecutive failed attempts tolerated before giving up
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            unit: DEFAULT_BACKOFF_UNIT,
            max_attempts: DEFAULT_MAX_CONNECT_ATTEMPTS,
        }
    }
}

impl BackoffPolicy {
    /// Delay after the failed attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.unit.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected { attempt: u32 },
    Connected,
    GivingUp,
}

/// Attempt counter driving the backoff. Private to the supervisor task.
#[derive(Debug)]
pub struct ConnectionAttempts {
    policy: BackoffPolicy,
    attempt: u32,
    state: ConnectionState,
}

impl ConnectionAttempts {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            state: ConnectionState::Disconnected { attempt: 0 },
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connected(&mut self) {
        self.attempt = 0;
        self.state = ConnectionState::Connected;
    }

    /// Records a failed attempt or a lost connection.
    ///
    /// Returns the delay to wait before the next attempt, or `None` once
    /// `max_attempts` consecutive failures have been recorded.
    pub fn failed(&mut self) -> Option<Duration> {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        if self.attempt >= self.policy.max_attempts {
            self.state = ConnectionState::GivingUp;
            None
        } else {
            self.state = ConnectionState::Disconnected {
                attempt: self.attempt,
            };
            Some(delay)
        }
    }
}

pub struct ReconnectSupervisor<D> {
    reader: SocketReader<D>,
    policy: BackoffPolicy,
    cancel_token: CancellationToken,
    metrics: Arc<PipelineMetrics>,
}

impl<D: Dialer> ReconnectSupervisor<D> {
    pub fn new(
        reader: SocketReader<D>,
        policy: BackoffPolicy,
        cancel_token: CancellationToken,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            reader,
            policy,
            cancel_token,
            metrics,
        }
    }

    /// Keeps a connection to the upstream open, feeding lines into `sink`.
    ///
    /// Returns `Ok(())` only when cancelled. Otherwise it runs until the retry budget is
    /// exhausted or nobody is left to receive lines.
    pub async fn run(self, sink: LineSender) -> Result<(), SupervisorError> {
        let endpoint = self.reader.endpoint();
        let mut attempts = ConnectionAttempts::new(self.policy);

        loop {
            let reason = tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(()),
                reason = self.session(&sink, &mut attempts) => reason,
            };

            if matches!(reason, ReaderError::SinkClosed) {
                return Err(SupervisorError::PipelineClosed);
            }

            let failed_attempt = attempts.attempt();
            match attempts.failed() {
                Some(delay) => {
                    warn!(
                        "Unable to read from socket: {}. Reconnecting in {:?} (attempt {}/{})",
                        reason,
                        delay,
                        failed_attempt + 1,
                        self.policy.max_attempts
                    );
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => return Ok(()),
                        _ = sleep(delay) => {}
                    }
                }
                None => {
                    warn!(
                        "Unable to read from socket: {} (attempt {}/{})",
                        reason,
                        failed_attempt + 1,
                        self.policy.max_attempts
                    );
                    return Err(SupervisorError::Exhausted {
                        endpoint,
                        attempts: self.policy.max_attempts,
                    });
                }
            }
        }
    }

    async fn session(&self, sink: &LineSender, attempts: &mut ConnectionAttempts) -> ReaderError {
        let connection = match self.reader.connect().await {
            Ok(connection) => connection,
            Err(e) => return e,
        };

        attempts.connected();
        self.metrics.record_connect();
        info!("Connected to {}", self.reader.endpoint());

        connection.forward(sink).await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::reader::{FilterExpression, RawLine};
    use async_trait::async_trait;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;
    use tokio::time::Instant;

    /// Fails `failures` times, then serves one line per connection and hangs up.
    struct ScriptedDialer {
        failures: u32,
        always_fail_after_first_success: bool,
        calls: AtomicU32,
        dialed_at: Mutex<Vec<Instant>>,
    }

    impl ScriptedDialer {
        fn new(failures: u32, always_fail_after_first_success: bool) -> Self {
            Self {
                failures,
                always_fail_after_first_success,
                calls: AtomicU32::new(0),
                dialed_at: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Dialer for Arc<ScriptedDialer> {
        type Stream = DuplexStream;

        fn endpoint(&self) -> String {
            "scripted".to_string()
        }

        async fn dial(&self) -> Result<DuplexStream, ReaderError> {
            self.dialed_at.lock().unwrap().push(Instant::now());
            let call = self.calls.fetch_add(1, Ordering::SeqCst);

            let fails = call < self.failures
                || (self.always_fail_after_first_success && call > self.failures);
            if fails {
                return Err(ReaderError::Connect {
                    endpoint: self.endpoint(),
                    source: io::Error::from(io::ErrorKind::ConnectionRefused),
                });
            }

            let (client, mut upstream) = tokio::io::duplex(1024);
            tokio::spawn(async move {
                let mut handshake = [0u8; 1];
                upstream.read_exact(&mut handshake).await.unwrap();
                upstream.write_all(b"hostname:cp3050\n").await.unwrap();
            });
            Ok(client)
        }
    }

    fn supervisor(
        dialer: Arc<ScriptedDialer>,
        policy: BackoffPolicy,
        cancel_token: CancellationToken,
    ) -> ReconnectSupervisor<Arc<ScriptedDialer>> {
        let metrics = Arc::new(PipelineMetrics::default());
        ReconnectSupervisor::new(
            SocketReader::new(dialer, FilterExpression::accept_all(), Arc::clone(&metrics)),
            policy,
            cancel_token,
            metrics,
        )
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(1));
        assert_eq!(policy.delay(1), Duration::from_millis(2));
        assert_eq!(policy.delay(2), Duration::from_millis(4));
        assert_eq!(policy.delay(15), Duration::from_millis(32768));
        // saturates instead of overflowing
        assert!(policy.delay(64) >= policy.delay(31));
    }

    #[test]
    fn test_attempts_reset_after_connection() {
        let mut attempts = ConnectionAttempts::new(BackoffPolicy::default());

        let mut observed = Vec::new();
        let mut delays = Vec::new();
        for _ in 0..3 {
            observed.push(attempts.attempt());
            delays.push(attempts.failed().unwrap());
        }
        assert_eq!(observed, vec![0, 1, 2]);
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1),
                Duration::from_millis(2),
                Duration::from_millis(4)
            ]
        );
        assert_eq!(
            attempts.state(),
            ConnectionState::Disconnected { attempt: 3 }
        );

        attempts.connected();
        assert_eq!(attempts.attempt(), 0);
        assert_eq!(attempts.state(), ConnectionState::Connected);

        // a dropped connection starts over from the shortest delay
        assert_eq!(attempts.failed(), Some(Duration::from_millis(1)));
    }

    #[test]
    fn test_attempts_give_up_after_max() {
        let mut attempts = ConnectionAttempts::new(BackoffPolicy {
            unit: Duration::from_millis(1),
            max_attempts: 16,
        });

        for _ in 0..15 {
            assert!(attempts.failed().is_some());
        }
        assert_eq!(attempts.failed(), None);
        assert_eq!(attempts.state(), ConnectionState::GivingUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_supervisor_backs_off_and_gives_up() {
        let dialer = Arc::new(ScriptedDialer::new(3, true));
        let policy = BackoffPolicy {
            unit: Duration::from_millis(10),
            max_attempts: 16,
        };
        let (tx, mut rx) = mpsc::channel(16);

        let result = supervisor(Arc::clone(&dialer), policy, CancellationToken::new())
            .run(tx)
            .await;

        assert!(matches!(
            result,
            Err(SupervisorError::Exhausted { attempts: 16, .. })
        ));
        assert_eq!(
            rx.recv().await,
            Some(RawLine {
                sequence: 0,
                text: "hostname:cp3050".to_string()
            })
        );

        // 3 failures, 1 success, then 15 failures on top of the lost connection
        let dialed_at = dialer.dialed_at.lock().unwrap().clone();
        assert_eq!(dialed_at.len(), 19);

        let gaps: Vec<Duration> = dialed_at.windows(2).map(|w| w[1] - w[0]).collect();
        let expected_ms = [10, 20, 40, 10, 20, 40];
        for (gap, expected) in gaps.iter().zip(expected_ms) {
            let expected = Duration::from_millis(expected);
            assert!(
                *gap >= expected && *gap < expected + Duration::from_millis(1),
                "gap {gap:?}, expected {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_supervisor_stops_when_cancelled() {
        let dialer = Arc::new(ScriptedDialer::new(u32::MAX, false));
        let policy = BackoffPolicy {
            unit: Duration::from_secs(3600),
            max_attempts: 16,
        };
        let cancel_token = CancellationToken::new();
        let (tx, _rx) = mpsc::channel(16);

        let task = tokio::spawn(supervisor(dialer, policy, cancel_token.clone()).run(tx));
        cancel_token.cancel();

        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_supervisor_stops_when_workers_are_gone() {
        let dialer = Arc::new(ScriptedDialer::new(0, false));
        let (tx, rx) = mpsc::channel(16);
        drop(rx);

        let result = supervisor(dialer, BackoffPolicy::default(), CancellationToken::new())
            .run(tx)
            .await;

        assert!(matches!(result, Err(SupervisorError::PipelineClosed)));
    }
}
