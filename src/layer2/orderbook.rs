// Order Book - price level store
// One BTreeMap per side, exclusively owned by the synchronizer

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

use crate::core::types::Side;
use crate::layer2::parser::{DiffEvent, PriceLevel};

type Price = Decimal;
type Quantity = Decimal;

/// Order book summary
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBookSummary {
    pub symbol: String,
    pub last_update_id: u64,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub snapshot_count: u64,
}

impl fmt::Display for OrderBookSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "OrderBook({} id={} bids={} asks={})",
            self.symbol, self.last_update_id, self.bid_levels, self.ask_levels
        )
    }
}

/// Mirrored price-level book for a single symbol
///
/// Quantities are absolute. A zero quantity is never stored: absence of a
/// price key is the zero level. Ordering is a property of the map, so
/// top-of-book reads need no sort.
#[derive(Debug, Clone)]
pub struct OrderBook {
    pub symbol: String,
    bids: BTreeMap<Price, Quantity>,
    asks: BTreeMap<Price, Quantity>,
    last_update_id: u64,
    snapshot_count: u64,
}

impl OrderBook {
    pub fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_uppercase(),
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_id: 0,
            snapshot_count: 0,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut BTreeMap<Price, Quantity> {
        match side {
            Side::Bid => &mut self.bids,
            Side::Ask => &mut self.asks,
        }
    }

    /// Set one level; zero quantity removes the price (no-op if absent)
    pub fn apply_level(&mut self, side: Side, price: Price, quantity: Quantity) {
        let levels = self.side_mut(side);
        if quantity.is_zero() {
            levels.remove(&price);
        } else {
            levels.insert(price, quantity);
        }
    }

    /// Replace both sides wholesale
    pub fn replace_from_snapshot(&mut self, last_update_id: u64, bids: &[PriceLevel], asks: &[PriceLevel]) {
        self.bids.clear();
        self.asks.clear();

        for level in bids {
            self.apply_level(Side::Bid, level.price, level.quantity);
        }
        for level in asks {
            self.apply_level(Side::Ask, level.price, level.quantity);
        }

        self.last_update_id = last_update_id;
        self.snapshot_count += 1;

        debug!(
            last_update_id = last_update_id,
            bid_levels = self.bids.len(),
            ask_levels = self.asks.len(),
            "Order book replaced from snapshot"
        );
    }

    /// Apply every level change of one event and advance the update id
    ///
    /// Sequence validation is the caller's job.
    pub fn apply_diff(&mut self, event: &DiffEvent) {
        for level in &event.bids {
            self.apply_level(Side::Bid, level.price, level.quantity);
        }
        for level in &event.asks {
            self.apply_level(Side::Ask, level.price, level.quantity);
        }
        self.last_update_id = event.final_update_id;
    }

    /// The `n` levels closest to the spread: bids descending, asks ascending
    pub fn top_n(&self, side: Side, n: usize) -> Vec<PriceLevel> {
        let to_level = |(price, qty): (&Price, &Quantity)| PriceLevel::new(*price, *qty);
        match side {
            Side::Bid => self.bids.iter().rev().take(n).map(to_level).collect(),
            Side::Ask => self.asks.iter().take(n).map(to_level).collect(),
        }
    }

    pub fn top_bids(&self, n: usize) -> Vec<PriceLevel> {
        self.top_n(Side::Bid, n)
    }

    pub fn top_asks(&self, n: usize) -> Vec<PriceLevel> {
        self.top_n(Side::Ask, n)
    }

    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.iter().next_back().map(|(p, q)| PriceLevel::new(*p, *q))
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.iter().next().map(|(p, q)| PriceLevel::new(*p, *q))
    }

    /// Quantity at a price, `None` when the level is absent
    pub fn quantity_at(&self, side: Side, price: &Price) -> Option<Quantity> {
        match side {
            Side::Bid => self.bids.get(price).copied(),
            Side::Ask => self.asks.get(price).copied(),
        }
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn bid_levels(&self) -> usize {
        self.bids.len()
    }

    pub fn ask_levels(&self) -> usize {
        self.asks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bids.is_empty() && self.asks.is_empty()
    }

    /// Drop all levels and reset the update id
    pub fn clear(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.last_update_id = 0;
    }

    pub fn get_summary(&self) -> OrderBookSummary {
        OrderBookSummary {
            symbol: self.symbol.clone(),
            last_update_id: self.last_update_id,
            bid_levels: self.bids.len(),
            ask_levels: self.asks.len(),
            best_bid: self.best_bid().map(|l| l.price),
            best_ask: self.best_ask().map(|l| l.price),
            snapshot_count: self.snapshot_count,
        }
    }
}
