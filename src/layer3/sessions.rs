// Subscriber Session Manager
// Registry of downstream websocket sessions, bounded outbound queues, heartbeat

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::layer3::publisher::ServerMessage;

pub type SessionId = Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session {0} is closed")]
    Closed(SessionId),
    #[error("Session {0} outbound queue is full")]
    QueueFull(SessionId),
    #[error("Unknown session {0}")]
    Unknown(SessionId),
}

struct SessionHandle {
    tx: mpsc::Sender<Arc<str>>,
    connected_at: DateTime<Utc>,
    last_pong: Option<DateTime<Utc>>,
    awaiting_pong: bool,
    missed_pongs: u32,
}

/// Read-only view of one session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub last_pong: Option<DateTime<Utc>>,
    pub missed_pongs: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionStats {
    pub active: usize,
    pub registered_total: u64,
    pub dropped_slow: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SessionStats(active={}, total={}, dropped={}, pings={}, pongs={})",
            self.active, self.registered_total, self.dropped_slow, self.pings_sent, self.pongs_received
        )
    }
}

/// Tracks every subscriber; a full or closed queue evicts that session only
pub struct SessionManager {
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    queue_capacity: usize,
    stats: RwLock<SessionStats>,
}

impl SessionManager {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            queue_capacity: queue_capacity.max(1),
            stats: RwLock::new(SessionStats::default()),
        }
    }

    /// New session with its outbound queue receiver
    pub fn register(&self) -> (SessionId, mpsc::Receiver<Arc<str>>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.queue_capacity);

        self.sessions.write().insert(
            id,
            SessionHandle {
                tx,
                connected_at: Utc::now(),
                last_pong: None,
                awaiting_pong: false,
                missed_pongs: 0,
            },
        );
        self.stats.write().registered_total += 1;

        info!(session_id = %id, active = self.session_count(), "Session registered");
        (id, rx)
    }

    pub fn unregister(&self, id: &SessionId) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            info!(session_id = %id, active = self.session_count(), "Session unregistered");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.read().contains_key(id)
    }

    fn try_deliver(handle: &SessionHandle, id: &SessionId, message: Arc<str>) -> Result<(), SessionError> {
        handle.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => SessionError::QueueFull(*id),
            TrySendError::Closed(_) => SessionError::Closed(*id),
        })
    }

    /// Queue a message for one session, evicting it if it cannot take it
    pub fn send(&self, id: &SessionId, message: Arc<str>) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let handle = sessions.get(id).ok_or(SessionError::Unknown(*id))?;

        let result = Self::try_deliver(handle, id, message);
        if let Err(e) = &result {
            sessions.remove(id);
            self.stats.write().dropped_slow += 1;
            warn!(session_id = %id, error = %e, "Session evicted");
        }
        result
    }

    /// Queue a message for every session; returns how many accepted it
    pub fn broadcast(&self, message: Arc<str>) -> usize {
        let mut sessions = self.sessions.write();
        let mut evicted = Vec::new();

        for (id, handle) in sessions.iter() {
            if let Err(e) = Self::try_deliver(handle, id, message.clone()) {
                warn!(session_id = %id, error = %e, "Session evicted");
                evicted.push(*id);
            }
        }

        for id in &evicted {
            sessions.remove(id);
        }
        if !evicted.is_empty() {
            self.stats.write().dropped_slow += evicted.len() as u64;
        }

        sessions.len()
    }

    /// Send a ping to every session and count missed pongs
    ///
    /// A missed pong is recorded only; it never disconnects the session.
    pub fn ping_all(&self) -> usize {
        let payload = match ServerMessage::Ping.to_json() {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Failed to serialize ping");
                return 0;
            }
        };

        {
            let mut sessions = self.sessions.write();
            for (id, handle) in sessions.iter_mut() {
                if handle.awaiting_pong {
                    handle.missed_pongs += 1;
                    debug!(session_id = %id, missed_pongs = handle.missed_pongs, "No pong since last ping");
                }
                handle.awaiting_pong = true;
            }
        }

        let delivered = self.broadcast(payload);
        self.stats.write().pings_sent += delivered as u64;
        delivered
    }

    pub fn record_pong(&self, id: &SessionId) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write();
        let handle = sessions.get_mut(id).ok_or(SessionError::Unknown(*id))?;
        handle.last_pong = Some(Utc::now());
        handle.awaiting_pong = false;
        drop(sessions);

        self.stats.write().pongs_received += 1;
        debug!(session_id = %id, "Pong received");
        Ok(())
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions
            .read()
            .iter()
            .map(|(id, handle)| SessionInfo {
                id: *id,
                connected_at: handle.connected_at,
                last_pong: handle.last_pong,
                missed_pongs: handle.missed_pongs,
            })
            .collect()
    }

    pub fn session_info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().get(id).map(|handle| SessionInfo {
            id: *id,
            connected_at: handle.connected_at,
            last_pong: handle.last_pong,
            missed_pongs: handle.missed_pongs,
        })
    }

    /// Drop every session; their writers see a closed queue and close the socket
    pub fn close_all(&self) -> usize {
        let mut sessions = self.sessions.write();
        let count = sessions.len();
        sessions.clear();
        if count > 0 {
            info!(count = count, "All sessions closed");
        }
        count
    }

    pub fn get_stats(&self) -> SessionStats {
        let mut stats = self.stats.read().clone();
        stats.active = self.session_count();
        stats
    }
}

/// Ping every session on a fixed interval until cancelled
pub async fn run_heartbeat(sessions: Arc<SessionManager>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let pinged = sessions.ping_all();
                debug!(sessions = pinged, "Liveness ping sent");
            }
        }
    }

    debug!("Heartbeat stopped");
}
