// Core Type Definitions for the depth relay
// Small enums shared by every layer

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Enums
// ============================================================================

/// Book side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Bid => write!(f, "BID"),
            Side::Ask => write!(f, "ASK"),
        }
    }
}

/// Synchronizer state machine
///
/// `Unsynced` until the first snapshot lands, `Synced` while diffs are
/// applied in order, `Resyncing` while a fresh snapshot is in flight after
/// a gap or an upstream reconnect. There is no terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncState {
    Unsynced,
    Synced,
    Resyncing,
}

impl SyncState {
    /// Diffs are held in the pending buffer instead of applied
    pub fn is_buffering(&self) -> bool {
        !matches!(self, SyncState::Synced)
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Unsynced => write!(f, "UNSYNCED"),
            SyncState::Synced => write!(f, "SYNCED"),
            SyncState::Resyncing => write!(f, "RESYNCING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Current wall-clock time in epoch milliseconds
pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_state_buffering() {
        assert!(SyncState::Unsynced.is_buffering());
        assert!(SyncState::Resyncing.is_buffering());
        assert!(!SyncState::Synced.is_buffering());
    }

    #[test]
    fn test_sync_state_display_and_serde() {
        assert_eq!(SyncState::Resyncing.to_string(), "RESYNCING");
        let json = serde_json::to_string(&SyncState::Synced).unwrap();
        assert_eq!(json, "\"SYNCED\"");
    }

    #[test]
    fn test_side_display() {
        assert_eq!(Side::Bid.to_string(), "BID");
        assert_eq!(Side::Ask.to_string(), "ASK");
    }
}
