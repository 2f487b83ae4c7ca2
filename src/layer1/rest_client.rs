// REST Client for the Binance depth snapshot
// Single public endpoint, bounded by a request timeout

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::core::RelayConfig;
use crate::layer2::parser::{parse_snapshot_value, Snapshot};

// ============================================================================
// Error Types
// ============================================================================

/// Snapshot could not be obtained; the caller retries later
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Malformed snapshot: {0}")]
    Malformed(String),
    #[error("Snapshot request timed out")]
    Timeout,
}

// ============================================================================
// Snapshot Source
// ============================================================================

/// Anything that can produce a full depth snapshot on demand
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self) -> Result<Snapshot, SnapshotError>;
}

// ============================================================================
// Client Statistics
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct RestClientStats {
    pub requests_sent: u64,
    pub requests_succeeded: u64,
    pub requests_failed: u64,
    pub last_snapshot_id: Option<u64>,
}

impl RestClientStats {
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            0.0
        } else {
            self.requests_succeeded as f64 / self.requests_sent as f64
        }
    }
}

impl fmt::Display for RestClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RestClientStats(sent={}, ok={}, fail={}, rate={:.2}%)",
            self.requests_sent,
            self.requests_succeeded,
            self.requests_failed,
            self.success_rate() * 100.0
        )
    }
}

// ============================================================================
// Binance Snapshot Client
// ============================================================================

/// Fetches `GET {base}/api/v3/depth?symbol=..&limit=..`
///
/// No retries here: the synchronizer owns retry timing so that a superseded
/// request is simply dropped.
pub struct BinanceSnapshotClient {
    url: String,
    symbol: String,
    limit: u32,
    client: Client,
    stats: Arc<RwLock<RestClientStats>>,
}

impl BinanceSnapshotClient {
    pub fn new(url: &str, symbol: &str, limit: u32, timeout: Duration) -> Result<Self, SnapshotError> {
        let client = Client::builder().timeout(timeout).build()?;

        info!(url = url, symbol = symbol, limit = limit, timeout_ms = timeout.as_millis() as u64, "Snapshot client created");

        Ok(Self {
            url: url.to_string(),
            symbol: symbol.to_uppercase(),
            limit,
            client,
            stats: Arc::new(RwLock::new(RestClientStats::default())),
        })
    }

    pub fn from_config(config: &RelayConfig) -> Result<Self, SnapshotError> {
        Self::new(
            &config.snapshot_url(),
            &config.upstream.symbol,
            config.upstream.snapshot_limit,
            config.request_timeout(),
        )
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn get_stats(&self) -> RestClientStats {
        self.stats.read().clone()
    }

    async fn request_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        let limit = self.limit.to_string();
        let response = self
            .client
            .get(&self.url)
            .query(&[("symbol", self.symbol.as_str()), ("limit", limit.as_str())])
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SnapshotError::Status(status.as_u16()));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| if e.is_timeout() { SnapshotError::Timeout } else { SnapshotError::Malformed(e.to_string()) })?;

        parse_snapshot_value(body).map_err(|e| SnapshotError::Malformed(e.to_string()))
    }
}

fn map_transport_error(e: reqwest::Error) -> SnapshotError {
    if e.is_timeout() {
        SnapshotError::Timeout
    } else {
        SnapshotError::Http(e)
    }
}

#[async_trait]
impl SnapshotSource for BinanceSnapshotClient {
    async fn fetch_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.stats.write().requests_sent += 1;
        debug!(symbol = %self.symbol, limit = self.limit, "Fetching depth snapshot");

        match self.request_snapshot().await {
            Ok(snapshot) => {
                let mut stats = self.stats.write();
                stats.requests_succeeded += 1;
                stats.last_snapshot_id = Some(snapshot.last_update_id);
                drop(stats);

                info!(
                    symbol = %self.symbol,
                    last_update_id = snapshot.last_update_id,
                    bids = snapshot.bids.len(),
                    asks = snapshot.asks.len(),
                    "Depth snapshot received"
                );
                Ok(snapshot)
            }
            Err(e) => {
                self.stats.write().requests_failed += 1;
                error!(symbol = %self.symbol, error = %e, "Depth snapshot failed");
                Err(e)
            }
        }
    }
}
