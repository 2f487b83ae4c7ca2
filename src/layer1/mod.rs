// Layer 1 - Upstream connectors for the exchange
// REST depth snapshot + diff depth stream

pub mod websocket;
pub mod rest_client;

// Re-export commonly used items for convenience
pub use websocket::{DiffStreamClient, ReconnectPolicy, StreamError, StreamStats};
pub use rest_client::{BinanceSnapshotClient, RestClientStats, SnapshotError, SnapshotSource};
