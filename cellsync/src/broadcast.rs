//! Fan-out of accepted updates to N-1 sessions.
//!
//! Uses a tokio broadcast channel: one send reaches every subscriber, and
//! each session drains its own receiver on its own task. A receiver that
//! falls more than `capacity` messages behind loses the oldest ones instead
//! of stalling the sender or the other sessions.
//!
//! Every message is encoded once and shared as `Arc<Envelope>`; a session
//! skips envelopes it originated, so no session ever sees its own update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Relay-assigned identity of one WebSocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One pre-encoded broadcast message tagged with the connection it came from.
#[derive(Debug)]
pub struct Envelope {
    /// None for relay-originated messages (delivered to everyone)
    pub origin: Option<ConnectionId>,
    pub bytes: Vec<u8>,
}

impl Envelope {
    /// Whether this envelope should be delivered to `conn`.
    pub fn is_for(&self, conn: ConnectionId) -> bool {
        self.origin != Some(conn)
    }
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_sessions: usize,
}

/// Counters updated on the hot path without taking the session lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            messages_sent: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
        }
    }
}

/// The relay's single broadcast group. Every key is multiplexed over it.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Envelope>>,

    /// Connected sessions and the identity they declared
    sessions: Arc<RwLock<HashMap<ConnectionId, PeerInfo>>>,

    /// Channel capacity (messages buffered per receiver)
    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// Create a new broadcast group with the given buffer capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Register a session and return its receiver.
    pub async fn add_session(
        &self,
        conn: ConnectionId,
        info: PeerInfo,
    ) -> broadcast::Receiver<Arc<Envelope>> {
        let mut sessions = self.sessions.write().await;
        sessions.insert(conn, info);
        self.sender.subscribe()
    }

    /// Update the identity a session declared after joining.
    pub async fn rename_session(&self, conn: ConnectionId, info: PeerInfo) {
        if let Some(entry) = self.sessions.write().await.get_mut(&conn) {
            *entry = info;
        }
    }

    pub async fn remove_session(&self, conn: &ConnectionId) -> Option<PeerInfo> {
        self.sessions.write().await.remove(conn)
    }

    /// Encode `msg` once and fan it out to every session except `origin`.
    ///
    /// Returns the number of receivers the envelope reached (including the
    /// origin's own receiver, which discards it).
    pub fn broadcast(
        &self,
        origin: Option<ConnectionId>,
        msg: &SyncMessage,
    ) -> Result<usize, ProtocolError> {
        let bytes = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(Envelope { origin, bytes })))
    }

    /// Broadcast a pre-built envelope (zero-copy fast path).
    pub fn broadcast_raw(&self, envelope: Arc<Envelope>) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record messages a lagging receiver lost.
    pub fn record_dropped(&self, n: u64) {
        self.atomic_stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn has_session(&self, conn: &ConnectionId) -> bool {
        self.sessions.read().await.contains_key(conn)
    }

    pub async fn sessions(&self) -> Vec<PeerInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Get broadcast statistics.
    pub async fn stats(&self) -> BroadcastStats {
        let sessions = self.sessions.read().await;
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_sessions: sessions.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
