// Message Parser - Binance depth wire formats
// Stream frames -> DiffEvent, REST body -> Snapshot

use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

// ============================================================================
// Price/Quantity Level
// ============================================================================

/// A price level [price, quantity]
///
/// Decimals keep the exchange's scale, so "10.00" is republished as "10.00".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

impl PriceLevel {
    pub fn new(price: Decimal, quantity: Decimal) -> Self {
        Self { price, quantity }
    }

    /// Zero quantity means "remove this level"
    pub fn is_removal(&self) -> bool {
        self.quantity.is_zero()
    }
}

/// Parse a Binance [price_string, qty_string] pair
pub fn parse_level(raw: &[String; 2]) -> Result<PriceLevel, ParseError> {
    Ok(PriceLevel {
        price: parse_decimal_field(&raw[0], "price")?,
        quantity: parse_decimal_field(&raw[1], "quantity")?,
    })
}

fn parse_decimal_field(value: &str, field: &'static str) -> Result<Decimal, ParseError> {
    let parsed = Decimal::from_str(value).map_err(|_| ParseError::InvalidLevel {
        field,
        value: value.to_string(),
    })?;
    if parsed.is_sign_negative() && !parsed.is_zero() {
        return Err(ParseError::InvalidLevel { field, value: value.to_string() });
    }
    Ok(parsed)
}

fn parse_levels(raw: &[[String; 2]]) -> Result<Vec<PriceLevel>, ParseError> {
    raw.iter().map(parse_level).collect()
}

// ============================================================================
// Parsed Types
// ============================================================================

/// Incremental depth update covering update ids `[first_update_id, final_update_id]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffEvent {
    pub first_update_id: u64,
    pub final_update_id: u64,
    pub event_time: Option<u64>,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Full point-in-time book from the REST endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_update_id: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// What one inbound stream frame turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    Diff(DiffEvent),
    /// Subscription acks and other non-data replies, e.g. `{"result":null,"id":1}`
    Control,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),
    #[error("Invalid {field}: '{value}'")]
    InvalidLevel { field: &'static str, value: String },
    #[error("Invalid update range: U={first} > u={last}")]
    InvalidRange { first: u64, last: u64 },
}

// ============================================================================
// Serde Structures (Raw Binance JSON)
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawDepthUpdate {
    #[serde(rename = "E", default)]
    event_time: Option<u64>,
    #[serde(rename = "U")]
    first_update_id: u64,
    #[serde(rename = "u")]
    final_update_id: u64,
    #[serde(rename = "b")]
    bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    asks: Vec<[String; 2]>,
}

#[derive(Debug, Deserialize)]
struct RawDepthSnapshot {
    #[serde(rename = "lastUpdateId")]
    last_update_id: u64,
    bids: Vec<[String; 2]>,
    asks: Vec<[String; 2]>,
}

// ============================================================================
// Stateless parse functions
// ============================================================================

/// Parse one depth update object (already unwrapped from any envelope)
fn diff_from_value(value: serde_json::Value) -> Result<DiffEvent, ParseError> {
    let raw: RawDepthUpdate = serde_json::from_value(value)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if raw.first_update_id > raw.final_update_id {
        return Err(ParseError::InvalidRange {
            first: raw.first_update_id,
            last: raw.final_update_id,
        });
    }

    Ok(DiffEvent {
        first_update_id: raw.first_update_id,
        final_update_id: raw.final_update_id,
        event_time: raw.event_time,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

/// Classify and parse a raw stream frame
///
/// Accepts plain `/ws/<stream>` payloads and the `/stream?streams=` envelope
/// `{"stream": "...", "data": {...}}`.
pub fn parse_stream_frame(raw_json: &str) -> Result<StreamFrame, ParseError> {
    let mut value: serde_json::Value = serde_json::from_str(raw_json)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    if value.get("result").is_some() && value.get("id").is_some() {
        return Ok(StreamFrame::Control);
    }

    if let Some(data) = value.get_mut("data") {
        let inner = data.take();
        return diff_from_value(inner).map(StreamFrame::Diff);
    }

    diff_from_value(value).map(StreamFrame::Diff)
}

/// Parse a depth update, rejecting anything that is not one
pub fn parse_diff_event(raw_json: &str) -> Result<DiffEvent, ParseError> {
    match parse_stream_frame(raw_json)? {
        StreamFrame::Diff(event) => Ok(event),
        StreamFrame::Control => Err(ParseError::InvalidJson("control frame is not a depth update".to_string())),
    }
}

/// Parse a REST depth snapshot body
pub fn parse_snapshot_value(value: serde_json::Value) -> Result<Snapshot, ParseError> {
    let raw: RawDepthSnapshot = serde_json::from_value(value)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;

    Ok(Snapshot {
        last_update_id: raw.last_update_id,
        bids: parse_levels(&raw.bids)?,
        asks: parse_levels(&raw.asks)?,
    })
}

pub fn parse_snapshot(raw_json: &str) -> Result<Snapshot, ParseError> {
    let value: serde_json::Value = serde_json::from_str(raw_json)
        .map_err(|e| ParseError::InvalidJson(e.to_string()))?;
    parse_snapshot_value(value)
}

// ============================================================================
// MessageParser - stateful wrapper with stats
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ParserStats {
    pub messages_parsed: u64,
    pub parse_errors: u64,
    pub control_frames: u64,
}

impl ParserStats {
    pub fn error_rate(&self) -> f64 {
        let total = self.messages_parsed + self.parse_errors;
        if total > 0 {
            self.parse_errors as f64 / total as f64
        } else {
            0.0
        }
    }
}

/// Stream-side parser; malformed frames are counted and reported, never fatal
#[derive(Debug, Default)]
pub struct MessageParser {
    pub stats: ParserStats,
}

impl MessageParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a frame, returning `None` for control frames
    pub fn parse(&mut self, raw_json: &str) -> Result<Option<DiffEvent>, ParseError> {
        match parse_stream_frame(raw_json) {
            Ok(StreamFrame::Diff(event)) => {
                self.stats.messages_parsed += 1;
                Ok(Some(event))
            }
            Ok(StreamFrame::Control) => {
                self.stats.control_frames += 1;
                debug!(frame = raw_json, "Control frame ignored");
                Ok(None)
            }
            Err(e) => {
                self.stats.parse_errors += 1;
                warn!(error = %e, "Malformed diff event dropped");
                Err(e)
            }
        }
    }

    pub fn reset_stats(&mut self) {
        self.stats = ParserStats::default();
    }
}
