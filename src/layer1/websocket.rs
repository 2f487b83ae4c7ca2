// WebSocket Client - Binance diff depth stream
// Supervised connection with exponential backoff, stale detection and cancellation

use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{ConnectionStatus, RelayConfig};
use crate::layer2::parser::MessageParser;
use crate::layer2::pipeline::SyncEvent;

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("WebSocket error: {0}")]
    Connect(#[from] tungstenite::Error),
    #[error("Stream closed by server")]
    Closed,
    #[error("No frame received for {0:?}")]
    Stale(Duration),
    #[error("Gave up after {0} reconnect attempts")]
    AttemptsExhausted(u32),
}

// ============================================================================
// Reconnect Policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0 = retry forever
    pub max_attempts: u32,
    pub stale_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.upstream.reconnect_delay_ms),
            max_delay: Duration::from_millis(config.upstream.reconnect_max_delay_ms),
            max_attempts: config.upstream.max_reconnect_attempts,
            stale_timeout: Duration::from_secs(config.upstream.stale_timeout_secs),
        }
    }

    /// `min(base * 2^attempt, max)`, attempt counted from 0
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt.min(31)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn attempts_exhausted(&self, attempts: u32) -> bool {
        self.max_attempts > 0 && attempts > self.max_attempts
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&RelayConfig::default())
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
struct StreamCounters {
    messages_received: u64,
    diffs_forwarded: u64,
    malformed: u64,
    control_frames: u64,
    connections: u64,
    disconnects: u64,
    last_disconnect: Option<String>,
}

/// WebSocket statistics
#[derive(Debug, Clone)]
pub struct StreamStats {
    pub status: ConnectionStatus,
    pub messages_received: u64,
    pub diffs_forwarded: u64,
    pub malformed: u64,
    pub control_frames: u64,
    pub connections: u64,
    pub disconnects: u64,
    /// Reason the most recent connection ended
    pub last_disconnect: Option<String>,
}

impl fmt::Display for StreamStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StreamStats(status={}, messages={}, malformed={}, connections={}, disconnects={})",
            self.status, self.messages_received, self.malformed, self.connections, self.disconnects
        )
    }
}

/// How a single connection ended without an upstream fault
enum SessionEnd {
    Cancelled,
    ReceiverGone,
}

// ============================================================================
// Diff Stream Client
// ============================================================================

/// Long-lived subscription to `<symbol>@depth@100ms`
///
/// Every successful connection, the first included, is announced with
/// `SyncEvent::StreamReconnected` before any diff from it is forwarded.
pub struct DiffStreamClient {
    url: String,
    pub symbol: String,
    policy: ReconnectPolicy,
    status: Arc<RwLock<ConnectionStatus>>,
    counters: Arc<RwLock<StreamCounters>>,
}

impl DiffStreamClient {
    pub fn new(url: &str, symbol: &str, policy: ReconnectPolicy) -> Self {
        info!(symbol = symbol, url = url, "Diff stream client created");

        Self {
            url: url.to_string(),
            symbol: symbol.to_uppercase(),
            policy,
            status: Arc::new(RwLock::new(ConnectionStatus::Disconnected)),
            counters: Arc::new(RwLock::new(StreamCounters::default())),
        }
    }

    pub fn from_config(config: &RelayConfig) -> Self {
        Self::new(&config.stream_url(), &config.upstream.symbol, ReconnectPolicy::from_config(config))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    pub fn get_stats(&self) -> StreamStats {
        let counters = self.counters.read();
        StreamStats {
            status: self.status(),
            messages_received: counters.messages_received,
            diffs_forwarded: counters.diffs_forwarded,
            malformed: counters.malformed,
            control_frames: counters.control_frames,
            connections: counters.connections,
            disconnects: counters.disconnects,
            last_disconnect: counters.last_disconnect.clone(),
        }
    }

    fn set_status(&self, status: ConnectionStatus) {
        *self.status.write() = status;
    }

    /// Connect, forward, reconnect until cancelled or the receiver is dropped
    ///
    /// Returns an error only when the attempt ceiling is reached.
    pub async fn run(&self, events: mpsc::Sender<SyncEvent>, cancel: CancellationToken) -> Result<(), StreamError> {
        let mut attempt = 0u32;

        loop {
            self.set_status(if attempt == 0 { ConnectionStatus::Connecting } else { ConnectionStatus::Reconnecting });
            debug!(url = %self.url, attempt = attempt, "Connecting to diff stream");

            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            let failure = match connected {
                Ok((socket, _)) => {
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected);
                    self.counters.write().connections += 1;
                    info!(symbol = %self.symbol, "Diff stream connected");

                    if events.send(SyncEvent::StreamReconnected).await.is_err() {
                        break;
                    }

                    match self.forward_frames(socket, &events, &cancel).await {
                        Ok(SessionEnd::Cancelled) | Ok(SessionEnd::ReceiverGone) => break,
                        Err(e) => e,
                    }
                }
                Err(e) => StreamError::Connect(e),
            };

            {
                let mut counters = self.counters.write();
                counters.disconnects += 1;
                counters.last_disconnect = Some(failure.to_string());
            }
            attempt += 1;

            if self.policy.attempts_exhausted(attempt) {
                error!(max_attempts = self.policy.max_attempts, error = %failure, "Max reconnection attempts reached");
                self.set_status(ConnectionStatus::Failed);
                return Err(StreamError::AttemptsExhausted(self.policy.max_attempts));
            }

            let delay = self.policy.delay_for(attempt - 1);
            warn!(
                error = %failure,
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Diff stream disconnected, reconnecting"
            );
            self.set_status(ConnectionStatus::Reconnecting);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_status(ConnectionStatus::Disconnected);
        info!(symbol = %self.symbol, "Diff stream stopped");
        Ok(())
    }

    /// Pump one connection until it fails, goes stale, or we are told to stop
    async fn forward_frames(
        &self,
        mut socket: UpstreamSocket,
        events: &mpsc::Sender<SyncEvent>,
        cancel: &CancellationToken,
    ) -> Result<SessionEnd, StreamError> {
        let mut parser = MessageParser::new();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => None,
                next = tokio::time::timeout(self.policy.stale_timeout, socket.next()) => Some(next),
            };

            let Some(next) = next else {
                let _ = socket.close(None).await;
                return Ok(SessionEnd::Cancelled);
            };

            let message = match next {
                Err(_) => return Err(StreamError::Stale(self.policy.stale_timeout)),
                Ok(None) => return Err(StreamError::Closed),
                Ok(Some(Err(e))) => return Err(StreamError::Connect(e)),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    self.counters.write().messages_received += 1;
                    match parser.parse(&text) {
                        Ok(Some(event)) => {
                            self.counters.write().diffs_forwarded += 1;
                            if events.send(SyncEvent::Diff(event)).await.is_err() {
                                return Ok(SessionEnd::ReceiverGone);
                            }
                        }
                        Ok(None) => self.counters.write().control_frames += 1,
                        // Already logged by the parser; the stream goes on
                        Err(_) => self.counters.write().malformed += 1,
                    }
                }
                Message::Ping(data) => {
                    socket.send(Message::Pong(data)).await?;
                }
                Message::Binary(data) => {
                    warn!(bytes = data.len(), "Unexpected binary frame ignored");
                }
                Message::Close(frame) => {
                    info!(frame = ?frame, "Diff stream closed by server");
                    return Err(StreamError::Closed);
                }
                Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
