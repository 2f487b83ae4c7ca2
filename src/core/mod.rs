// Core Module - Foundational types, config, logging

pub mod types;
pub mod config;
pub mod logger;

// Re-export commonly used items for convenience
pub use types::{ConnectionStatus, Side, SyncState, now_millis};
pub use config::{
    RelayConfig, UpstreamConfig, SyncConfig, ServerConfig, MonitoringConfig, ConfigError,
};
pub use logger::setup_logging;
