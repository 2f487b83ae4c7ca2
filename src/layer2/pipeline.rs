// Sync Pipeline - drives the synchronizer from a single task
// Stream events + snapshot results -> Synchronizer -> Publisher

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{RelayConfig, SyncState};
use crate::layer1::rest_client::{SnapshotError, SnapshotSource};
use crate::layer2::parser::{DiffEvent, Snapshot};
use crate::layer2::synchronizer::{ApplyOutcome, SnapshotOutcome, Synchronizer, SynchronizerStats};
use crate::layer3::publisher::Publisher;

/// Everything the synchronizer reacts to, in one ordered channel
#[derive(Debug)]
pub enum SyncEvent {
    Diff(DiffEvent),
    /// A stream connection was (re-)established
    StreamReconnected,
    SnapshotLoaded { epoch: u64, result: Result<Snapshot, SnapshotError> },
}

/// Read-only status for health reporting
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncStatus {
    pub state: SyncState,
    pub sequence_id: u64,
    pub pending: usize,
    /// Snapshot request in flight, if any
    pub awaiting_epoch: Option<u64>,
    pub bid_levels: usize,
    pub ask_levels: usize,
    pub stats: SynchronizerStats,
}

impl SyncStatus {
    fn from_synchronizer(sync: &Synchronizer) -> Self {
        Self {
            state: sync.state(),
            sequence_id: sync.sequence_id(),
            pending: sync.pending_len(),
            awaiting_epoch: sync.awaiting_epoch(),
            bid_levels: sync.book().bid_levels(),
            ask_levels: sync.book().ask_levels(),
            stats: sync.stats().clone(),
        }
    }
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            state: SyncState::Unsynced,
            sequence_id: 0,
            pending: 0,
            awaiting_epoch: None,
            bid_levels: 0,
            ask_levels: 0,
            stats: SynchronizerStats::default(),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SyncStatus(state={}, sequence_id={}, pending={}, bids={}, asks={})",
            self.state, self.sequence_id, self.pending, self.bid_levels, self.ask_levels
        )
    }
}

/// Sole owner of the synchronizer (and so of the book)
///
/// Snapshot fetches run in spawned tasks that post their result back on the
/// same channel, so every state change happens on this task in arrival order.
pub struct SyncDriver<S: SnapshotSource> {
    synchronizer: Synchronizer,
    source: Arc<S>,
    publisher: Arc<Publisher>,
    events_tx: mpsc::Sender<SyncEvent>,
    events_rx: mpsc::Receiver<SyncEvent>,
    status_tx: watch::Sender<SyncStatus>,
    retry_delay: Duration,
    cancel: CancellationToken,
}

impl<S: SnapshotSource> SyncDriver<S> {
    pub fn new(
        symbol: &str,
        max_buffered: usize,
        retry_delay: Duration,
        channel_capacity: usize,
        source: Arc<S>,
        publisher: Arc<Publisher>,
        cancel: CancellationToken,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(channel_capacity.max(1));
        let (status_tx, _) = watch::channel(SyncStatus::default());

        Self {
            synchronizer: Synchronizer::new(symbol, max_buffered),
            source,
            publisher,
            events_tx,
            events_rx,
            status_tx,
            retry_delay,
            cancel,
        }
    }

    pub fn from_config(config: &RelayConfig, source: Arc<S>, publisher: Arc<Publisher>, cancel: CancellationToken) -> Self {
        Self::new(
            &config.upstream.symbol,
            config.sync.max_buffered_events,
            Duration::from_millis(config.sync.snapshot_retry_delay_ms),
            config.sync.max_buffered_events.max(1024),
            source,
            publisher,
            cancel,
        )
    }

    /// Sender for the diff stream client
    pub fn sender(&self) -> mpsc::Sender<SyncEvent> {
        self.events_tx.clone()
    }

    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_tx.subscribe()
    }

    pub fn synchronizer(&self) -> &Synchronizer {
        &self.synchronizer
    }

    /// Process events until cancelled
    pub async fn run(mut self) -> SyncStatus {
        info!(symbol = %self.synchronizer.book().symbol, "Sync driver started");

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events_rx.recv() => event,
            };

            match event {
                Some(event) => self.handle_event(event),
                None => break,
            }
        }

        let status = SyncStatus::from_synchronizer(&self.synchronizer);
        info!(status = %status, stats = %status.stats, "Sync driver stopped");
        status
    }

    /// Apply one event to the state machine and perform the effects it asks for
    pub fn handle_event(&mut self, event: SyncEvent) {
        match event {
            SyncEvent::Diff(diff) => match self.synchronizer.on_diff(diff) {
                ApplyOutcome::Applied => {
                    self.publisher.publish(self.synchronizer.book());
                }
                ApplyOutcome::Gap { epoch, .. } => self.spawn_fetch(epoch, Duration::ZERO),
                ApplyOutcome::Stale | ApplyOutcome::Buffered => {}
            },
            SyncEvent::StreamReconnected => {
                let epoch = self.synchronizer.on_reconnect();
                info!(epoch = epoch, state = %self.synchronizer.state(), "Upstream (re)connected, fetching snapshot");
                self.spawn_fetch(epoch, Duration::ZERO);
            }
            SyncEvent::SnapshotLoaded { epoch, result: Ok(snapshot) } => {
                match self.synchronizer.on_snapshot(epoch, &snapshot) {
                    SnapshotOutcome::Applied(report) => {
                        self.publisher.publish(self.synchronizer.book());
                        if let Some(next_epoch) = report.resync_epoch {
                            self.spawn_fetch(next_epoch, Duration::ZERO);
                        }
                    }
                    SnapshotOutcome::Behind { epoch, .. } => self.spawn_fetch(epoch, self.retry_delay),
                    SnapshotOutcome::Ignored => {}
                }
            }
            SyncEvent::SnapshotLoaded { epoch, result: Err(e) } => {
                if self.synchronizer.on_snapshot_failed(epoch) {
                    warn!(
                        epoch = epoch,
                        error = %e,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        "Snapshot unavailable, retrying"
                    );
                    self.spawn_fetch(epoch, self.retry_delay);
                } else {
                    debug!(epoch = epoch, error = %e, "Superseded snapshot failed");
                }
            }
        }

        self.status_tx.send_replace(SyncStatus::from_synchronizer(&self.synchronizer));
    }

    fn spawn_fetch(&self, epoch: u64, delay: Duration) {
        let source = self.source.clone();
        let events = self.events_tx.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = async {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    source.fetch_snapshot().await
                } => result,
            };

            // The driver may have stopped meanwhile
            let _ = events.send(SyncEvent::SnapshotLoaded { epoch, result }).await;
        });
    }
}
