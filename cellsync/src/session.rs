//! Client session: one WebSocket to the relay, reconnect with backoff, and a
//! full-state resync after every successful (re)connection.
//!
//! State machine:
//! ```text
//!                connect()
//! Disconnected ───────────► Connecting ──success──► Connected
//!      ▲                      │    ▲                 │    ▲
//!      │                      └────┘ failure         │    │ success
//!      │                      (backoff)       lost   ▼    │
//!      │                                        Reconnecting ─┐
//!      │ shutdown() from any state                   ▲        │ failure
//!      └─────────────────────────────────────────────┴────────┘ (backoff)
//! ```
//!
//! Sends made while not `Connected` are dropped, not queued: whatever is
//! written during a disconnect window is lost, and the resync on reconnect
//! brings the local cache back to the relay's state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::mux::SubscriptionMux;
use crate::protocol::{
    now_millis, CellState, MessageType, PeerInfo, ProtocolError, RelayStatus, SyncMessage,
};
use crate::publisher::{SendOutcome, UpdateSink};

/// Reconnect delays; the last one repeats indefinitely.
pub const DEFAULT_BACKOFF: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
    Duration::from_secs(30),
];

/// Connection phase of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Snapshot of a session's state. Only the session itself changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    pub phase: ConnectionPhase,
    /// Failed attempts since the last successful connection
    pub reconnect_attempt: u32,
    /// A resync was requested and its snapshot has not been applied yet
    pub pending_resync: bool,
    /// `shutdown()` was called; the session will not connect again
    pub terminated: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            reconnect_attempt: 0,
            pending_resync: false,
            terminated: false,
        }
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Relay WebSocket URL, e.g. `ws://127.0.0.1:9090`
    pub url: String,
    /// Display name sent in the hello handshake
    pub peer_name: String,
    /// Reconnect schedule
    pub backoff: Vec<Duration>,
    /// Upper bound on request/response round trips
    pub request_timeout: Duration,
    /// Outbound buffer (messages) between callers and the writer
    pub outbound_capacity: usize,
    /// Event channel capacity
    pub event_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9090".to_string(),
            peer_name: "cellsync".to_string(),
            backoff: DEFAULT_BACKOFF.to_vec(),
            request_timeout: Duration::from_secs(5),
            outbound_capacity: 1024,
            event_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based), holding at the last step.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let index = (attempt.max(1) - 1) as usize;
        self.backoff
            .get(index.min(self.backoff.len().saturating_sub(1)))
            .copied()
            .unwrap_or(DEFAULT_BACKOFF[0])
    }
}

/// Events emitted by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Connection established (resync requested)
    Connected,
    /// Transport lost; reconnecting
    Disconnected,
    /// Another session's write, already applied to the multiplexer
    RemoteUpdate {
        key: String,
        value: String,
        sender_id: Uuid,
        timestamp: u64,
    },
    /// Full-state snapshot applied to the multiplexer
    Resynced { keys: usize },
}

/// Session request errors.
#[derive(Debug, Clone)]
pub enum SessionError {
    NotConnected,
    ConnectionClosed,
    Timeout,
    /// The relay answered with an error
    Rejected(String),
    Protocol(ProtocolError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected => write!(f, "Session is not connected"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Request timed out"),
            Self::Rejected(reason) => write!(f, "Rejected by relay: {reason}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ProtocolError> for SessionError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectionEnd {
    Lost,
    Shutdown,
}

/// State shared between the session handle and its supervisor task.
struct Shared {
    config: SessionConfig,
    peer: PeerInfo,
    mux: Arc<SubscriptionMux>,
    state_tx: watch::Sender<SessionState>,
    outbound_tx: mpsc::Sender<Vec<u8>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<SyncMessage>>>,
    resync_requests: Mutex<HashSet<u64>>,
    next_request: AtomicU64,
    event_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    updates_sent: AtomicU64,
    updates_dropped: AtomicU64,
}

/// A client session.
pub struct Session {
    shared: Arc<Shared>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    event_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Create a disconnected session that feeds `mux`.
    pub fn new(config: SessionConfig, mux: Arc<SubscriptionMux>) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_capacity.max(1));
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        let (state_tx, _) = watch::channel(SessionState::default());
        let peer = PeerInfo::new(config.peer_name.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                peer,
                mux,
                state_tx,
                outbound_tx,
                pending: Mutex::new(HashMap::new()),
                resync_requests: Mutex::new(HashSet::new()),
                next_request: AtomicU64::new(1),
                event_tx,
                cancel: CancellationToken::new(),
                updates_sent: AtomicU64::new(0),
                updates_dropped: AtomicU64::new(0),
            }),
            outbound_rx: Mutex::new(Some(outbound_rx)),
            event_rx: Mutex::new(Some(event_rx)),
            task: Mutex::new(None),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.event_rx.lock().ok()?.take()
    }

    /// Start connecting. Spawns the supervisor task that owns the connection
    /// and the backoff timer. No-op after shutdown or if already started.
    pub fn connect(&self) {
        if self.shared.cancel.is_cancelled() {
            return;
        }
        let Some(outbound_rx) = self.outbound_rx.lock().ok().and_then(|mut rx| rx.take()) else {
            return;
        };

        self.shared.set_state(|s| {
            s.phase = ConnectionPhase::Connecting;
            s.reconnect_attempt = 0;
        });
        let handle = tokio::spawn(Shared::supervise(self.shared.clone(), outbound_rx));
        if let Ok(mut task) = self.task.lock() {
            *task = Some(handle);
        }
    }

    /// Terminal shutdown: cancels the connection and any pending backoff.
    /// Close errors are swallowed. Idempotent.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let task = self.task.lock().ok().and_then(|mut t| t.take());
        if let Some(task) = task {
            if let Err(e) = task.await {
                log::debug!("Session task ended abnormally: {e}");
            }
        }
        self.shared.fail_pending();
        self.shared.set_state(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.pending_resync = false;
            s.terminated = true;
        });
    }

    /// Send a local write to the relay. Synchronous and non-blocking; the
    /// update is dropped unless the session is `Connected`.
    pub fn send_update(&self, key: &str, value: &str) -> SendOutcome {
        self.shared.send_update(key, value)
    }

    /// Point lookup at the relay.
    pub async fn get_value(&self, key: &str) -> Result<Option<CellState>, SessionError> {
        let peer = self.shared.peer.peer_id;
        let reply = self
            .request(|id| SyncMessage::get_value(peer, id, key), false)
            .await?;
        Ok(reply.cell()?)
    }

    /// Full relay state. Does not touch the local cache.
    pub async fn get_all_state(&self) -> Result<Vec<CellState>, SessionError> {
        let peer = self.shared.peer.peer_id;
        let reply = self
            .request(|id| Ok(SyncMessage::get_all_state(peer, id)), false)
            .await?;
        Ok(reply.cells()?)
    }

    /// Relay introspection.
    pub async fn get_status(&self) -> Result<RelayStatus, SessionError> {
        let peer = self.shared.peer.peer_id;
        let reply = self
            .request(|id| Ok(SyncMessage::get_status(peer, id)), false)
            .await?;
        Ok(reply.relay_status()?)
    }

    /// Explicit resync: pull full state and overwrite the local cache.
    /// Returns the number of keys received.
    pub async fn resync(&self) -> Result<usize, SessionError> {
        let peer = self.shared.peer.peer_id;
        let reply = self
            .request(|id| Ok(SyncMessage::get_all_state(peer, id)), true)
            .await?;
        Ok(reply.cells()?.len())
    }

    async fn request<F>(&self, build: F, resync: bool) -> Result<SyncMessage, SessionError>
    where
        F: FnOnce(u64) -> Result<SyncMessage, ProtocolError>,
    {
        if self.state().phase != ConnectionPhase::Connected {
            return Err(SessionError::NotConnected);
        }

        let shared = &self.shared;
        let id = shared.next_request_id();
        let encoded = build(id)?.encode()?;

        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = shared.pending.lock() {
            pending.insert(id, tx);
        }
        if resync {
            shared.begin_resync(id);
        }

        if shared.outbound_tx.send(encoded).await.is_err() {
            shared.forget_request(id);
            return Err(SessionError::ConnectionClosed);
        }

        let reply = match tokio::time::timeout(shared.config.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(SessionError::ConnectionClosed),
            Err(_) => {
                shared.forget_request(id);
                return Err(SessionError::Timeout);
            }
        };

        if reply.msg_type == MessageType::Error {
            let reason = reply.error_reason().unwrap_or_else(|e| e.to_string());
            return Err(SessionError::Rejected(reason));
        }
        Ok(reply)
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Wait until the session state satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        let mut rx = self.shared.state_tx.subscribe();
        let state = match rx.wait_for(|s| predicate(s)).await {
            Ok(state) => *state,
            // Sender lives as long as `self`; unreachable in practice.
            Err(_) => self.state(),
        };
        state
    }

    /// Wait until the session reaches `phase`.
    pub async fn wait_for_phase(&self, phase: ConnectionPhase) -> SessionState {
        self.wait_for(|s| s.phase == phase).await
    }

    /// Our writer identity.
    pub fn peer_info(&self) -> &PeerInfo {
        &self.shared.peer
    }

    pub fn config(&self) -> &SessionConfig {
        &self.shared.config
    }

    pub fn mux(&self) -> &Arc<SubscriptionMux> {
        &self.shared.mux
    }

    /// Updates handed to the writer.
    pub fn updates_sent(&self) -> u64 {
        self.shared.updates_sent.load(Ordering::Relaxed)
    }

    /// Updates dropped because the session was not connected.
    pub fn updates_dropped(&self) -> u64 {
        self.shared.updates_dropped.load(Ordering::Relaxed)
    }
}

impl UpdateSink for Session {
    fn send_update(&self, key: &str, value: &str) -> SendOutcome {
        self.shared.send_update(key, value)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Never leave a retry loop running without its owner.
        self.shared.cancel.cancel();
    }
}

impl Shared {
    fn set_state(&self, f: impl FnOnce(&mut SessionState)) {
        self.state_tx.send_modify(f);
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }

    fn begin_resync(&self, id: u64) {
        if let Ok(mut ids) = self.resync_requests.lock() {
            ids.insert(id);
        }
        self.set_state(|s| s.pending_resync = true);
    }

    fn forget_request(&self, id: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&id);
        }
        let resync_left = match self.resync_requests.lock() {
            Ok(mut ids) => {
                ids.remove(&id);
                !ids.is_empty()
            }
            Err(_) => false,
        };
        if !resync_left {
            self.set_state(|s| s.pending_resync = false);
        }
    }

    /// Fail every in-flight request with `ConnectionClosed`.
    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.clear();
        }
        if let Ok(mut ids) = self.resync_requests.lock() {
            ids.clear();
        }
    }

    fn emit(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            log::debug!("Session event not delivered: {e}");
        }
    }

    fn send_update(&self, key: &str, value: &str) -> SendOutcome {
        let phase = self.state_tx.borrow().phase;
        if phase != ConnectionPhase::Connected {
            self.updates_dropped.fetch_add(1, Ordering::Relaxed);
            log::debug!("Dropping update for {key} while {phase:?}");
            return SendOutcome::Dropped;
        }

        let encoded = match SyncMessage::send_update(self.peer.peer_id, key, value, now_millis())
            .and_then(|msg| msg.encode())
        {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode update for {key}: {e}");
                self.updates_dropped.fetch_add(1, Ordering::Relaxed);
                return SendOutcome::Dropped;
            }
        };

        match self.outbound_tx.try_send(encoded) {
            Ok(()) => {
                self.updates_sent.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Queued
            }
            Err(e) => {
                log::warn!("Dropping update for {key}: {e}");
                self.updates_dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Dropped
            }
        }
    }

    /// Connect / reconnect loop. Runs until cancelled.
    async fn supervise(self: Arc<Self>, mut outbound_rx: mpsc::Receiver<Vec<u8>>) {
        let mut attempt: u32 = 0;
        let mut ever_connected = false;

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = tokio_tungstenite::connect_async(self.config.url.as_str()) => result,
            };

            match connected {
                Ok((ws, _)) => {
                    attempt = 0;
                    ever_connected = true;
                    log::info!("Connected to relay at {}", self.config.url);

                    match self.run_connection(ws, &mut outbound_rx).await {
                        ConnectionEnd::Shutdown => break,
                        ConnectionEnd::Lost => {
                            log::warn!("Connection to relay lost; reconnecting");
                            self.fail_pending();
                            self.set_state(|s| {
                                s.phase = ConnectionPhase::Reconnecting;
                                s.pending_resync = false;
                            });
                            self.emit(SessionEvent::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    log::warn!("Connect to {} failed: {e}", self.config.url);
                }
            }

            attempt = attempt.saturating_add(1);
            let delay = self.config.backoff_delay(attempt);
            self.set_state(|s| {
                s.reconnect_attempt = attempt;
                s.phase = if ever_connected {
                    ConnectionPhase::Reconnecting
                } else {
                    ConnectionPhase::Connecting
                };
            });
            log::debug!("Retrying in {delay:?} (attempt {attempt})");

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.pending_resync = false;
            s.terminated = true;
        });
        log::info!("Session {} stopped", self.peer.peer_id);
    }

    /// Drive one established connection until it is lost or shut down.
    async fn run_connection(
        &self,
        ws: WsStream,
        outbound_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> ConnectionEnd {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        // Anything still buffered raced the previous disconnect; drop it.
        let mut stale = 0usize;
        while outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            log::debug!("Discarded {stale} stale outbound messages");
        }

        let resync_id = self.next_request_id();
        let handshake = [
            SyncMessage::hello(&self.peer),
            Ok(SyncMessage::get_all_state(self.peer.peer_id, resync_id)),
        ];
        self.begin_resync(resync_id);
        for msg in handshake {
            let sent = match msg.and_then(|msg| msg.encode()) {
                Ok(bytes) => ws_sender.send(Message::Binary(bytes.into())).await,
                Err(e) => {
                    log::warn!("Failed to encode handshake: {e}");
                    continue;
                }
            };
            if sent.is_err() {
                return ConnectionEnd::Lost;
            }
        }

        self.set_state(|s| {
            s.phase = ConnectionPhase::Connected;
            s.reconnect_attempt = 0;
        });
        self.emit(SessionEvent::Connected);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Teardown is best effort.
                    let _ = tokio::time::timeout(
                        Duration::from_secs(1),
                        ws_sender.send(Message::Close(None)),
                    )
                    .await;
                    return ConnectionEnd::Shutdown;
                }

                outgoing = outbound_rx.recv() => {
                    let Some(bytes) = outgoing else {
                        return ConnectionEnd::Shutdown;
                    };
                    if let Err(e) = ws_sender.send(Message::Binary(bytes.into())).await {
                        log::warn!("Send to relay failed: {e}");
                        return ConnectionEnd::Lost;
                    }
                }

                incoming = ws_receiver.next() => {
                    match incoming {
                        Some(Ok(Message::Binary(data))) => self.handle_incoming(&data),
                        Some(Ok(Message::Close(_))) | None => return ConnectionEnd::Lost,
                        Some(Err(e)) => {
                            log::warn!("WebSocket error: {e}");
                            return ConnectionEnd::Lost;
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    fn handle_incoming(&self, bytes: &[u8]) {
        let msg = match SyncMessage::decode(bytes) {
            Ok(msg) => msg,
            Err(e) => {
                log::warn!("Failed to decode relay message: {e}");
                return;
            }
        };

        match msg.msg_type {
            MessageType::ReceiveUpdate => {
                // The relay never echoes; skip our own writes anyway.
                if msg.sender_id == self.peer.peer_id {
                    return;
                }
                match msg.update() {
                    Ok(update) => {
                        self.mux.apply_remote_update(&update.key, &update.value);
                        self.emit(SessionEvent::RemoteUpdate {
                            key: update.key,
                            value: update.value,
                            sender_id: msg.sender_id,
                            timestamp: update.timestamp,
                        });
                    }
                    Err(e) => log::warn!("Malformed update from relay: {e}"),
                }
            }

            MessageType::AllState => {
                let is_resync = self
                    .resync_requests
                    .lock()
                    .map(|mut ids| ids.remove(&msg.request_id))
                    .unwrap_or(false);
                if is_resync {
                    match msg.cells() {
                        Ok(cells) => {
                            self.mux.apply_resync(&cells);
                            self.set_state(|s| s.pending_resync = false);
                            log::debug!("Resynced {} keys", cells.len());
                            self.emit(SessionEvent::Resynced { keys: cells.len() });
                        }
                        Err(e) => log::warn!("Malformed resync snapshot: {e}"),
                    }
                }
                self.complete(msg);
            }

            MessageType::Value | MessageType::Status => self.complete(msg),

            MessageType::Error => {
                if msg.request_id == 0 {
                    let reason = msg.error_reason().unwrap_or_default();
                    log::warn!("Relay rejected an update: {reason}");
                } else {
                    self.complete(msg);
                }
            }

            MessageType::Pong => log::trace!("Pong from relay"),

            other => log::debug!("Unexpected message from relay: {other:?}"),
        }
    }

    /// Hand a response to the request waiting on it, if any.
    fn complete(&self, msg: SyncMessage) {
        let waiter = self
            .pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(&msg.request_id));
        if let Some(tx) = waiter {
            let _ = tx.send(msg);
        }
    }
}
