// Configuration Management for the depth relay
// Defaults, then JSON file overlay, then environment overrides

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

// ============================================================================
// Configuration Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub symbol: String,
    pub rest_base_url: String,
    pub ws_base_url: String,
    pub snapshot_limit: u32,

    // Snapshot fetch must never hang a resync
    pub request_timeout_ms: u64,

    // Diff stream reconnection
    pub reconnect_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub max_reconnect_attempts: u32, // 0 = unlimited
    pub stale_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            rest_base_url: "https://api.binance.com".to_string(),
            ws_base_url: "wss://stream.binance.com:9443/ws".to_string(),
            snapshot_limit: 1000,
            request_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
            reconnect_max_delay_ms: 30_000,
            max_reconnect_attempts: 0,
            stale_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub snapshot_retry_delay_ms: u64,
    pub max_buffered_events: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            snapshot_retry_delay_ms: 1_000,
            max_buffered_events: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub ws_path: String,
    pub heartbeat_interval_secs: u64,
    pub depth_levels: usize,
    pub session_queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3001".to_string(),
            ws_path: "/orderbook".to_string(),
            heartbeat_interval_secs: 5,
            depth_levels: 5,
            session_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub json_logs: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            json_logs: false,
        }
    }
}

/// Full process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub upstream: UpstreamConfig,
    pub sync: SyncConfig,
    pub server: ServerConfig,
    pub monitoring: MonitoringConfig,
}

impl RelayConfig {
    /// Build configuration: defaults, optional JSON file, then environment
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = config_path {
            config.load_from_file(path)?;
        }

        config.load_from_env_with(|key| std::env::var(key).ok());

        info!(symbol = %config.upstream.symbol, bind = %config.server.bind_address, "Configuration initialized");
        Ok(config)
    }

    /// Overlay sections present in a JSON file
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn load_from_file(&mut self, config_path: &str) -> Result<(), ConfigError> {
        let path = Path::new(config_path);
        if !path.exists() {
            warn!(path = config_path, "Config file not found, using defaults");
            return Ok(());
        }

        let content = fs::read_to_string(path)?;
        let sections: HashMap<String, serde_json::Value> = serde_json::from_str(&content)?;

        if let Some(upstream) = sections.get("upstream") {
            self.upstream = serde_json::from_value(upstream.clone())?;
        }
        if let Some(sync) = sections.get("sync") {
            self.sync = serde_json::from_value(sync.clone())?;
        }
        if let Some(server) = sections.get("server") {
            self.server = serde_json::from_value(server.clone())?;
        }
        if let Some(monitoring) = sections.get("monitoring") {
            self.monitoring = serde_json::from_value(monitoring.clone())?;
        }

        info!(path = config_path, "Configuration loaded");
        Ok(())
    }

    /// Apply `RELAY_*` overrides; the lookup is injectable for tests
    pub fn load_from_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbol) = lookup("RELAY_SYMBOL") {
            self.upstream.symbol = symbol.to_uppercase();
        }
        if let Some(bind) = lookup("RELAY_BIND") {
            self.server.bind_address = bind;
        }
        if let Some(level) = lookup("RELAY_LOG_LEVEL") {
            self.monitoring.log_level = level;
        }
        if let Some(url) = lookup("RELAY_REST_URL") {
            self.upstream.rest_base_url = url;
        }
        if let Some(url) = lookup("RELAY_WS_URL") {
            self.upstream.ws_base_url = url;
        }
    }

    /// Validate configuration, reporting every problem at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.upstream.symbol.trim().is_empty() {
            errors.push("upstream.symbol must not be empty".to_string());
        }
        if self.upstream.request_timeout_ms == 0 {
            errors.push("upstream.request_timeout_ms must be > 0".to_string());
        }
        if self.upstream.reconnect_max_delay_ms < self.upstream.reconnect_delay_ms {
            errors.push("upstream.reconnect_max_delay_ms must be >= reconnect_delay_ms".to_string());
        }
        if self.server.heartbeat_interval_secs == 0 {
            errors.push("server.heartbeat_interval_secs must be > 0".to_string());
        }
        if self.server.depth_levels == 0 {
            errors.push("server.depth_levels must be > 0".to_string());
        }
        if self.server.session_queue_capacity == 0 {
            errors.push("server.session_queue_capacity must be > 0".to_string());
        }
        if !self.server.ws_path.starts_with('/') {
            errors.push("server.ws_path must start with '/'".to_string());
        }
        if self.server.bind_address.parse::<SocketAddr>().is_err() {
            errors.push(format!("server.bind_address '{}' is not a socket address", self.server.bind_address));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            for error in &errors {
                warn!(error = %error, "Config validation error");
            }
            Err(ConfigError::Validation(errors.join("; ")))
        }
    }

    /// Diff stream URL, e.g. `wss://.../ws/btcusdt@depth@100ms`
    pub fn stream_url(&self) -> String {
        format!(
            "{}/{}@depth@100ms",
            self.upstream.ws_base_url.trim_end_matches('/'),
            self.upstream.symbol.to_lowercase()
        )
    }

    /// REST depth snapshot URL (query string excluded)
    pub fn snapshot_url(&self) -> String {
        format!("{}/api/v3/depth", self.upstream.rest_base_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.request_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.server.heartbeat_interval_secs)
    }
}
