// Layer 2 - Data Processing & Synchronization
// Parses upstream data and keeps the order book consistent with it

pub mod orderbook;
pub mod parser;
pub mod synchronizer;
pub mod pipeline;

// Re-export commonly used items
pub use orderbook::{OrderBook, OrderBookSummary};
pub use parser::{
    MessageParser, ParseError, ParserStats, PriceLevel, DiffEvent, Snapshot, StreamFrame,
    parse_diff_event, parse_snapshot, parse_stream_frame,
};
pub use synchronizer::{
    Synchronizer, SynchronizerStats, ApplyOutcome, SnapshotOutcome, DrainReport, Continuity,
    check_continuity,
};
pub use pipeline::{SyncDriver, SyncEvent, SyncStatus};
