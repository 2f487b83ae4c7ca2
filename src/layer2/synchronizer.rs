// Data Synchronizer - snapshot + diff stream consistency
// Pure state machine: no I/O, the pipeline driver performs the effects it asks for

use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tracing::{debug, info, warn};

use crate::core::types::SyncState;
use crate::layer2::orderbook::OrderBook;
use crate::layer2::parser::{DiffEvent, Snapshot};

/// How a diff relates to the current sequence cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuity {
    /// `u <= cursor`: already covered, drop silently
    Stale,
    /// `U <= cursor + 1 <= u`: safe to apply
    Contiguous,
    /// `U > cursor + 1`: updates were lost
    Gap { expected: u64 },
}

/// Classify a diff range `[U, u]` against the last applied id
pub fn check_continuity(sequence_id: u64, event: &DiffEvent) -> Continuity {
    let expected = sequence_id + 1;
    if event.final_update_id <= sequence_id {
        Continuity::Stale
    } else if event.first_update_id <= expected {
        Continuity::Contiguous
    } else {
        Continuity::Gap { expected }
    }
}

/// Result of feeding one diff to the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied to the book; the view should be republished
    Applied,
    /// Superseded by the current state, nothing changed
    Stale,
    /// Held in the pending buffer until a snapshot lands
    Buffered,
    /// Sequence gap: now resyncing, a snapshot must be fetched for `epoch`
    Gap { expected: u64, first: u64, epoch: u64 },
}

/// Result of offering a snapshot to the synchronizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The snapshot answered a request that has since been superseded
    Ignored,
    /// Book rebuilt and pending buffer drained
    Applied(DrainReport),
    /// Older than the applied cursor: nothing changed, `epoch` is still awaited
    Behind { epoch: u64, snapshot_id: u64, sequence_id: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub discarded: usize,
    /// Set when draining hit a gap and a new snapshot is needed
    pub resync_epoch: Option<u64>,
}

/// Synchronizer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SynchronizerStats {
    pub diffs_received: u64,
    pub diffs_applied: u64,
    pub stale_dropped: u64,
    pub buffered: u64,
    pub buffer_overflows: u64,
    pub gaps: u64,
    pub resyncs: u64,
    pub snapshots_applied: u64,
    pub snapshots_ignored: u64,
    pub snapshot_failures: u64,
    pub cursor_regressions: u64,
}

impl fmt::Display for SynchronizerStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SynchronizerStats(received={}, applied={}, stale={}, gaps={}, resyncs={}, snapshots={})",
            self.diffs_received,
            self.diffs_applied,
            self.stale_dropped,
            self.gaps,
            self.resyncs,
            self.snapshots_applied
        )
    }
}

/// Keeps the order book consistent with the upstream sequence
///
/// Owns the book and its cursor. While no snapshot is usable (`Unsynced` or
/// `Resyncing`) every diff goes to the pending buffer; the buffer is drained
/// in arrival order exactly once when the requested snapshot lands.
pub struct Synchronizer {
    state: SyncState,
    book: OrderBook,
    pending: VecDeque<DiffEvent>,
    max_buffered: usize,

    // Snapshot requests are numbered; only the newest one may land
    next_epoch: u64,
    awaiting_epoch: Option<u64>,

    has_snapshot: bool,
    stats: SynchronizerStats,
}

impl Synchronizer {
    pub fn new(symbol: &str, max_buffered: usize) -> Self {
        info!(symbol = symbol, max_buffered = max_buffered, "Synchronizer created");

        Self {
            state: SyncState::Unsynced,
            book: OrderBook::new(symbol),
            pending: VecDeque::with_capacity(max_buffered.min(1024)),
            max_buffered: max_buffered.max(1),
            next_epoch: 1,
            awaiting_epoch: None,
            has_snapshot: false,
            stats: SynchronizerStats::default(),
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn book(&self) -> &OrderBook {
        &self.book
    }

    /// Last applied update id
    pub fn sequence_id(&self) -> u64 {
        self.book.last_update_id()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Whether any snapshot has ever landed
    pub fn has_snapshot(&self) -> bool {
        self.has_snapshot
    }

    pub fn awaiting_epoch(&self) -> Option<u64> {
        self.awaiting_epoch
    }

    pub fn stats(&self) -> &SynchronizerStats {
        &self.stats
    }

    /// Open a new snapshot request, superseding any in flight
    pub fn request_snapshot(&mut self) -> u64 {
        let epoch = self.next_epoch;
        self.next_epoch += 1;
        self.awaiting_epoch = Some(epoch);
        debug!(epoch = epoch, state = %self.state, "Snapshot requested");
        epoch
    }

    fn enter_resyncing(&mut self) -> u64 {
        if self.state != SyncState::Resyncing {
            info!(from = %self.state, sequence_id = self.sequence_id(), "Entering RESYNCING");
        }
        self.state = SyncState::Resyncing;
        self.stats.resyncs += 1;
        self.request_snapshot()
    }

    fn buffer(&mut self, event: DiffEvent) {
        if self.pending.len() >= self.max_buffered {
            // The continuity check turns a lost event into a resync later
            self.pending.pop_front();
            self.stats.buffer_overflows += 1;
            warn!(capacity = self.max_buffered, "Pending buffer full, oldest event dropped");
        }
        self.pending.push_back(event);
        self.stats.buffered += 1;
    }

    /// Validate-and-apply against the current cursor
    ///
    /// On a gap the book is untouched and the event is handed back.
    fn validate_and_apply(&mut self, event: DiffEvent) -> Result<bool, (DiffEvent, u64)> {
        match check_continuity(self.sequence_id(), &event) {
            Continuity::Stale => {
                self.stats.stale_dropped += 1;
                debug!(
                    final_update_id = event.final_update_id,
                    sequence_id = self.sequence_id(),
                    "Stale diff dropped"
                );
                Ok(false)
            }
            Continuity::Contiguous => {
                self.book.apply_diff(&event);
                self.stats.diffs_applied += 1;
                Ok(true)
            }
            Continuity::Gap { expected } => Err((event, expected)),
        }
    }

    /// Feed one diff from the stream
    pub fn on_diff(&mut self, event: DiffEvent) -> ApplyOutcome {
        self.stats.diffs_received += 1;

        if self.state.is_buffering() {
            self.buffer(event);
            return ApplyOutcome::Buffered;
        }

        match self.validate_and_apply(event) {
            Ok(true) => ApplyOutcome::Applied,
            Ok(false) => ApplyOutcome::Stale,
            Err((event, expected)) => {
                let first = event.first_update_id;
                self.stats.gaps += 1;
                warn!(
                    expected = expected,
                    first_update_id = first,
                    final_update_id = event.final_update_id,
                    "Sequence gap detected"
                );
                // The gap event may still be applicable on top of the next snapshot
                self.buffer(event);
                let epoch = self.enter_resyncing();
                ApplyOutcome::Gap { expected, first, epoch }
            }
        }
    }

    /// The upstream stream was (re-)established: continuity is unknown
    ///
    /// Events buffered from the previous connection are discarded. Before the
    /// first snapshot the state stays `Unsynced`; the request is just renewed.
    pub fn on_reconnect(&mut self) -> u64 {
        let dropped = self.pending.len();
        self.pending.clear();
        if dropped > 0 {
            debug!(dropped = dropped, "Pending buffer cleared on reconnect");
        }

        // Unsynced and Resyncing buffer alike, so the first connection needs no transition
        if self.has_snapshot {
            self.enter_resyncing()
        } else {
            self.request_snapshot()
        }
    }

    /// A snapshot fetch for `epoch` failed; returns whether it is still wanted
    pub fn on_snapshot_failed(&mut self, epoch: u64) -> bool {
        self.stats.snapshot_failures += 1;
        self.awaiting_epoch == Some(epoch)
    }

    /// Offer a fetched snapshot
    pub fn on_snapshot(&mut self, epoch: u64, snapshot: &Snapshot) -> SnapshotOutcome {
        if self.awaiting_epoch != Some(epoch) {
            self.stats.snapshots_ignored += 1;
            debug!(epoch = epoch, awaiting = ?self.awaiting_epoch, "Superseded snapshot ignored");
            return SnapshotOutcome::Ignored;
        }

        // The cursor never moves backwards; keep buffering and ask again
        if self.has_snapshot && snapshot.last_update_id < self.sequence_id() {
            self.stats.cursor_regressions += 1;
            warn!(
                snapshot_id = snapshot.last_update_id,
                sequence_id = self.sequence_id(),
                pending = self.pending.len(),
                "Snapshot is older than the current cursor, refetching"
            );
            return SnapshotOutcome::Behind {
                epoch,
                snapshot_id: snapshot.last_update_id,
                sequence_id: self.sequence_id(),
            };
        }
        self.awaiting_epoch = None;

        self.book.replace_from_snapshot(snapshot.last_update_id, &snapshot.bids, &snapshot.asks);
        self.has_snapshot = true;
        self.stats.snapshots_applied += 1;
        self.state = SyncState::Synced;

        let report = self.drain_pending();

        info!(
            snapshot_id = snapshot.last_update_id,
            sequence_id = self.sequence_id(),
            applied = report.applied,
            discarded = report.discarded,
            state = %self.state,
            "Snapshot applied"
        );

        SnapshotOutcome::Applied(report)
    }

    /// Replay buffered events in arrival order through the SYNCED rules
    fn drain_pending(&mut self) -> DrainReport {
        let mut report = DrainReport::default();

        while let Some(event) = self.pending.pop_front() {
            match self.validate_and_apply(event) {
                Ok(true) => report.applied += 1,
                Ok(false) => report.discarded += 1,
                Err((event, expected)) => {
                    self.stats.gaps += 1;
                    warn!(
                        expected = expected,
                        first_update_id = event.first_update_id,
                        remaining = self.pending.len(),
                        "Gap while draining pending buffer"
                    );
                    self.pending.push_front(event);
                    report.resync_epoch = Some(self.enter_resyncing());
                    break;
                }
            }
        }

        report
    }
}
