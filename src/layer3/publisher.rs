// Publisher - top-of-book view fan-out
// Serializes once per change and hands the same bytes to every session

use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::core::types::now_millis;
use crate::layer2::orderbook::OrderBook;
use crate::layer2::parser::PriceLevel;
use crate::layer3::sessions::{SessionId, SessionManager};

// ============================================================================
// Wire Messages
// ============================================================================

/// Top-N snapshot of the book as sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishedView {
    pub symbol: String,
    /// Epoch milliseconds at publish time
    pub ts: u64,
    /// Best first (descending)
    pub bids: Vec<[Decimal; 2]>,
    /// Best first (ascending)
    pub asks: Vec<[Decimal; 2]>,
}

impl PublishedView {
    pub fn from_book(book: &OrderBook, depth: usize, ts: u64) -> Self {
        let pairs = |levels: Vec<PriceLevel>| levels.into_iter().map(|l| [l.price, l.quantity]).collect();
        Self {
            symbol: book.symbol.clone(),
            ts,
            bids: pairs(book.top_bids(depth)),
            asks: pairs(book.top_asks(depth)),
        }
    }
}

/// Server -> subscriber
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Orderbook(PublishedView),
    Ping,
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<Arc<str>, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// Subscriber -> server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Pong,
}

impl ClientMessage {
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

// ============================================================================
// Publisher
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct PublisherStats {
    pub views_published: u64,
    pub deliveries: u64,
    pub serialize_errors: u64,
}

impl fmt::Display for PublisherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PublisherStats(published={}, deliveries={}, errors={})",
            self.views_published, self.deliveries, self.serialize_errors
        )
    }
}

/// Holds the latest serialized view and broadcasts changes
///
/// The latest-view lock is held across the broadcast so a subscriber that
/// registers concurrently sees either the old view followed by the new one,
/// or only the new one.
pub struct Publisher {
    depth: usize,
    latest: RwLock<Option<Arc<str>>>,
    sessions: Arc<SessionManager>,
    stats: RwLock<PublisherStats>,
}

impl Publisher {
    pub fn new(depth: usize, sessions: Arc<SessionManager>) -> Self {
        Self {
            depth,
            latest: RwLock::new(None),
            sessions,
            stats: RwLock::new(PublisherStats::default()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Latest serialized view, `None` until the first snapshot lands
    pub fn latest(&self) -> Option<Arc<str>> {
        self.latest.read().clone()
    }

    /// Build the view from the book and deliver it to every session
    ///
    /// Returns the number of sessions the view was queued for.
    pub fn publish(&self, book: &OrderBook) -> usize {
        let view = PublishedView::from_book(book, self.depth, now_millis());
        self.publish_view(view)
    }

    pub fn publish_view(&self, view: PublishedView) -> usize {
        let payload = match ServerMessage::Orderbook(view).to_json() {
            Ok(payload) => payload,
            Err(e) => {
                self.stats.write().serialize_errors += 1;
                error!(error = %e, "Failed to serialize view");
                return 0;
            }
        };

        let mut latest = self.latest.write();
        *latest = Some(payload.clone());
        let delivered = self.sessions.broadcast(payload);
        drop(latest);

        let mut stats = self.stats.write();
        stats.views_published += 1;
        stats.deliveries += delivered as u64;
        debug!(delivered = delivered, "View published");
        delivered
    }

    /// Register a session, queueing the current view for it when one exists
    pub fn subscribe(&self) -> (SessionId, mpsc::Receiver<Arc<str>>) {
        let latest = self.latest.read();
        let (id, rx) = self.sessions.register();
        if let Some(view) = latest.as_ref() {
            // A fresh queue has room for one message
            let _ = self.sessions.send(&id, view.clone());
        }
        (id, rx)
    }

    pub fn get_stats(&self) -> PublisherStats {
        self.stats.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn book() -> OrderBook {
        let mut ob = OrderBook::new("BTCUSDT");
        let bids: Vec<PriceLevel> = (0..7)
            .map(|i| PriceLevel::new(dec("100.00") - Decimal::from(i), dec("1.50")))
            .collect();
        let asks: Vec<PriceLevel> = (1..=7)
            .map(|i| PriceLevel::new(dec("100.00") + Decimal::from(i), dec("2")))
            .collect();
        ob.replace_from_snapshot(10, &bids, &asks);
        ob
    }

    #[test]
    fn test_view_wire_format() {
        let mut ob = OrderBook::new("BTCUSDT");
        ob.replace_from_snapshot(
            1,
            &[PriceLevel::new(dec("10.00"), dec("1.0"))],
            &[PriceLevel::new(dec("10.01"), dec("0.5"))],
        );

        let view = PublishedView::from_book(&ob, 5, 1_700_000_000_000);
        let json = ServerMessage::Orderbook(view).to_json().unwrap();
        assert_eq!(
            &*json,
            r#"{"type":"orderbook","symbol":"BTCUSDT","ts":1700000000000,"bids":[["10.00","1.0"]],"asks":[["10.01","0.5"]]}"#
        );
    }

    #[test]
    fn test_view_truncated_and_ordered() {
        let view = PublishedView::from_book(&book(), 5, 0);
        assert_eq!(view.bids.len(), 5);
        assert_eq!(view.asks.len(), 5);
        assert_eq!(view.bids[0][0], dec("100.00"));
        assert_eq!(view.bids[4][0], dec("96.00"));
        assert_eq!(view.asks[0][0], dec("101.00"));
        assert!(view.asks.windows(2).all(|w| w[0][0] < w[1][0]));
    }

    #[test]
    fn test_ping_and_pong_messages() {
        assert_eq!(&*ServerMessage::Ping.to_json().unwrap(), r#"{"type":"ping"}"#);
        assert_eq!(ClientMessage::parse(r#"{"type":"pong"}"#).unwrap(), ClientMessage::Pong);
        assert!(ClientMessage::parse(r#"{"type":"subscribe"}"#).is_err());
        assert!(ClientMessage::parse("pong").is_err());
    }

    #[tokio::test]
    async fn test_new_subscriber_waits_for_first_view() {
        let publisher = Publisher::new(5, Arc::new(SessionManager::new(8)));
        let (_id, mut rx) = publisher.subscribe();
        assert!(rx.try_recv().is_err());
        assert!(publisher.latest().is_none());

        assert_eq!(publisher.publish(&book()), 1);
        let message = rx.recv().await.unwrap();
        assert!(message.starts_with(r#"{"type":"orderbook""#));
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_current_view() {
        let publisher = Publisher::new(3, Arc::new(SessionManager::new(8)));
        publisher.publish(&book());

        let (_id, mut rx) = publisher.subscribe();
        let message = rx.recv().await.unwrap();
        assert_eq!(Some(message), publisher.latest());

        let stats = publisher.get_stats();
        assert_eq!(stats.views_published, 1);
        assert_eq!(stats.deliveries, 0);
    }
}
