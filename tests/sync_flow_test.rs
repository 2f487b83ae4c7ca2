// End-to-End Flow Tests for the depth relay
//
// These tests exercise the full data path without network connections:
//   raw JSON → Layer 2 (Parser → Synchronizer → OrderBook) → Layer 3 (Publisher → Sessions)
//
// Run with: cargo test --test sync_flow_test

use std::collections::BTreeMap;
use std::sync::Arc;

use proptest::prelude::*;
use rust_decimal::Decimal;

use depth_relay::core::{Side, SyncState};
use depth_relay::layer2::{
    parse_diff_event, parse_snapshot, ApplyOutcome, DiffEvent, MessageParser, OrderBook, PriceLevel,
    SnapshotOutcome, Synchronizer,
};
use depth_relay::layer3::{Publisher, SessionManager};

// ============================================================================
// Helpers
// ============================================================================

fn diff_json(first: u64, last: u64, bids: &[(&str, &str)], asks: &[(&str, &str)]) -> String {
    let levels = |side: &[(&str, &str)]| {
        side.iter()
            .map(|(p, q)| format!(r#"["{}","{}"]"#, p, q))
            .collect::<Vec<_>>()
            .join(",")
    };
    format!(
        r#"{{"e":"depthUpdate","E":1700000000000,"s":"BTCUSDT","U":{},"u":{},"b":[{}],"a":[{}]}}"#,
        first,
        last,
        levels(bids),
        levels(asks)
    )
}

const SNAPSHOT_100: &str =
    r#"{"lastUpdateId":100,"bids":[["10.00","1.0"],["9.99","2.0"]],"asks":[["10.01","1.0"],["10.02","3.0"]]}"#;

fn synced(snapshot_json: &str) -> Synchronizer {
    let mut sync = Synchronizer::new("BTCUSDT", 1_000);
    let epoch = sync.on_reconnect();
    let snapshot = parse_snapshot(snapshot_json).unwrap();
    assert!(matches!(sync.on_snapshot(epoch, &snapshot), SnapshotOutcome::Applied(_)));
    sync
}

// ============================================================================
// Flow tests
// ============================================================================

#[test]
fn test_removal_reaches_published_view() {
    let sessions = Arc::new(SessionManager::new(16));
    let publisher = Publisher::new(5, sessions.clone());
    let (_id, mut rx) = publisher.subscribe();

    let mut sync = synced(SNAPSHOT_100);
    publisher.publish(sync.book());

    let event = parse_diff_event(&diff_json(101, 101, &[("10.00", "0.00000000")], &[])).unwrap();
    assert_eq!(sync.on_diff(event), ApplyOutcome::Applied);
    publisher.publish(sync.book());

    let first = rx.try_recv().unwrap();
    assert!(first.contains(r#""bids":[["10.00","1.0"],["9.99","2.0"]]"#));

    let second = rx.try_recv().unwrap();
    assert!(second.contains(r#""bids":[["9.99","2.0"]]"#));
    assert!(second.contains(r#""asks":[["10.01","1.0"],["10.02","3.0"]]"#));
}

#[test]
fn test_out_of_order_frame_ignored() {
    let mut sync = synced(SNAPSHOT_100);
    let mut parser = MessageParser::new();

    let newer = parser.parse(&diff_json(101, 102, &[("9.98", "1")], &[])).unwrap().unwrap();
    let older = parser.parse(&diff_json(101, 101, &[("9.97", "1")], &[])).unwrap().unwrap();

    assert_eq!(sync.on_diff(newer), ApplyOutcome::Applied);
    assert_eq!(sync.on_diff(older), ApplyOutcome::Stale);
    assert_eq!(sync.sequence_id(), 102);
    assert_eq!(sync.book().bid_levels(), 3);
}

#[test]
fn test_gap_recovery_applies_only_newer_events() {
    let mut sync = synced(SNAPSHOT_100);

    let gap = parse_diff_event(&diff_json(105, 110, &[("9.95", "4")], &[])).unwrap();
    let epoch = match sync.on_diff(gap) {
        ApplyOutcome::Gap { expected, first, epoch } => {
            assert_eq!((expected, first), (101, 105));
            epoch
        }
        other => panic!("expected gap, got {:?}", other),
    };

    // Arrives while resyncing; subsumed by the snapshot
    let old = parse_diff_event(&diff_json(106, 107, &[("9.90", "1")], &[])).unwrap();
    assert_eq!(sync.on_diff(old), ApplyOutcome::Buffered);
    let next = parse_diff_event(&diff_json(111, 111, &[], &[("10.05", "1")])).unwrap();
    assert_eq!(sync.on_diff(next), ApplyOutcome::Buffered);

    let snapshot = parse_snapshot(r#"{"lastUpdateId":108,"bids":[["9.00","1"]],"asks":[["11.00","1"]]}"#).unwrap();
    match sync.on_snapshot(epoch, &snapshot) {
        SnapshotOutcome::Applied(report) => {
            assert_eq!(report.applied, 2);
            assert_eq!(report.discarded, 1);
            assert_eq!(report.resync_epoch, None);
        }
        other => panic!("expected applied, got {:?}", other),
    }

    assert_eq!(sync.state(), SyncState::Synced);
    assert_eq!(sync.sequence_id(), 111);
    assert!(sync.book().quantity_at(Side::Bid, &"9.95".parse().unwrap()).is_some());
    assert!(sync.book().quantity_at(Side::Bid, &"9.90".parse().unwrap()).is_none());
    assert!(sync.book().quantity_at(Side::Ask, &"10.05".parse().unwrap()).is_some());
}

#[test]
fn test_malformed_frame_does_not_disturb_state() {
    let mut sync = synced(SNAPSHOT_100);
    let mut parser = MessageParser::new();

    assert!(parser.parse(r#"{"U":101,"u":101,"b":[["x","1"]],"a":[]}"#).is_err());
    assert!(parser.parse(r#"{"result":null,"id":1}"#).unwrap().is_none());

    let event = parser.parse(&diff_json(101, 101, &[], &[("10.01", "5")])).unwrap().unwrap();
    assert_eq!(sync.on_diff(event), ApplyOutcome::Applied);
    assert_eq!(sync.sequence_id(), 101);
    assert_eq!(parser.stats.parse_errors, 1);
    assert_eq!(parser.stats.control_frames, 1);
}

// ============================================================================
// Properties
// ============================================================================

type Levels = Vec<(i64, u8)>;

fn price(cents: i64) -> Decimal {
    Decimal::new(cents, 2)
}

fn to_levels(raw: &Levels) -> Vec<PriceLevel> {
    raw.iter()
        .map(|(p, q)| PriceLevel::new(price(*p), Decimal::from(*q)))
        .collect()
}

fn apply_direct(map: &mut BTreeMap<Decimal, Decimal>, raw: &Levels) {
    for (p, q) in raw {
        if *q == 0 {
            map.remove(&price(*p));
        } else {
            map.insert(price(*p), Decimal::from(*q));
        }
    }
}

fn levels_strategy() -> impl Strategy<Value = Levels> {
    prop::collection::vec((1i64..40, 0u8..4), 0..6)
}

fn diffs_strategy() -> impl Strategy<Value = Vec<(u64, Levels, Levels)>> {
    prop::collection::vec((1u64..4, levels_strategy(), levels_strategy()), 1..30)
}

proptest! {
    #[test]
    fn prop_gap_free_sequence_matches_direct_mutation(
        snap_bids in levels_strategy(),
        snap_asks in levels_strategy(),
        diffs in diffs_strategy(),
        buffered_prefix in 0usize..5,
    ) {
        let snapshot_id = 1_000u64;
        let mut bids = BTreeMap::new();
        let mut asks = BTreeMap::new();
        apply_direct(&mut bids, &snap_bids);
        apply_direct(&mut asks, &snap_asks);

        let mut sync = Synchronizer::new("BTCUSDT", 10_000);
        let epoch = sync.on_reconnect();

        // A few events that the snapshot already covers arrive first
        for i in 0..buffered_prefix as u64 {
            let stale = DiffEvent {
                first_update_id: snapshot_id - 10 + i,
                final_update_id: snapshot_id - 10 + i,
                event_time: None,
                bids: vec![PriceLevel::new(price(7), Decimal::from(99))],
                asks: vec![],
            };
            prop_assert_eq!(sync.on_diff(stale), ApplyOutcome::Buffered);
        }

        let snapshot = depth_relay::layer2::Snapshot {
            last_update_id: snapshot_id,
            bids: to_levels(&snap_bids),
            asks: to_levels(&snap_asks),
        };
        prop_assert!(matches!(sync.on_snapshot(epoch, &snapshot), SnapshotOutcome::Applied(_)));

        let mut cursor = snapshot_id;
        for (span, diff_bids, diff_asks) in &diffs {
            let event = DiffEvent {
                first_update_id: cursor + 1,
                final_update_id: cursor + span,
                event_time: None,
                bids: to_levels(diff_bids),
                asks: to_levels(diff_asks),
            };
            cursor += span;
            prop_assert_eq!(sync.on_diff(event), ApplyOutcome::Applied);
            apply_direct(&mut bids, diff_bids);
            apply_direct(&mut asks, diff_asks);
        }

        prop_assert_eq!(sync.sequence_id(), cursor);
        prop_assert_eq!(sync.state(), SyncState::Synced);

        let book = sync.book();
        prop_assert_eq!(book.bid_levels(), bids.len());
        prop_assert_eq!(book.ask_levels(), asks.len());
        for (p, q) in &bids {
            prop_assert_eq!(book.quantity_at(Side::Bid, p), Some(*q));
        }
        for (p, q) in &asks {
            prop_assert_eq!(book.quantity_at(Side::Ask, p), Some(*q));
        }
    }

    #[test]
    fn prop_top_n_is_sorted_and_best(
        raw_bids in levels_strategy(),
        raw_asks in levels_strategy(),
        n in 0usize..8,
    ) {
        let mut book = OrderBook::new("BTCUSDT");
        book.replace_from_snapshot(1, &to_levels(&raw_bids), &to_levels(&raw_asks));

        let top_bids = book.top_bids(n);
        let top_asks = book.top_asks(n);
        prop_assert!(top_bids.len() <= n);
        prop_assert!(top_asks.len() <= n);
        prop_assert_eq!(top_bids.len(), n.min(book.bid_levels()));
        prop_assert!(top_bids.windows(2).all(|w| w[0].price > w[1].price));
        prop_assert!(top_asks.windows(2).all(|w| w[0].price < w[1].price));
        prop_assert!(top_bids.iter().chain(top_asks.iter()).all(|l| !l.quantity.is_zero()));

        if let (Some(best), Some(first)) = (book.best_bid(), top_bids.first()) {
            prop_assert_eq!(&best, first);
        }
        if let (Some(best), Some(first)) = (book.best_ask(), top_asks.first()) {
            prop_assert_eq!(&best, first);
        }
    }
}
