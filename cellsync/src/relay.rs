//! Authoritative WebSocket relay.
//!
//! Architecture:
//! ```text
//! Session A ──┐                     ┌── StateStore (DashMap, per-key atomic)
//!             ├── connection task ──┤        │
//! Session B ──┘   (one per socket)  │        └── durable mirror (RocksDB)
//!                                   │
//!                                   └── BroadcastGroup ──► every other session
//! ```
//!
//! An accepted `SendUpdate` is applied to the store and fanned out to every
//! other connected session. Full state is only sent when a session asks for
//! it. Nothing is cleaned up when a session disconnects: a key keeps its
//! value and last writer until it is explicitly removed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, ConnectionId};
use crate::protocol::{
    now_millis, CellState, MessageType, PeerInfo, ProtocolError, RelayStatus, SyncMessage,
    UpdatePayload,
};
use crate::storage::{DurableStore, RocksStore, StoreConfig, StoreError};
use crate::store::StateStore;

/// Upper bound on one write to a peer before it counts as stalled.
const PEER_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity (messages buffered per session)
    pub broadcast_capacity: usize,
    /// Durable mirror path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            storage_path: None,
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub updates_accepted: u64,
    /// Sessions closed because they fell behind the broadcast
    pub lagged_disconnects: u64,
}

/// Relay errors.
#[derive(Debug)]
pub enum RelayError {
    Io(std::io::Error),
    Store(StoreError),
    Protocol(ProtocolError),
    /// Update rejected before reaching the store
    InvalidKey,
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::Store(e) => write!(f, "Store error: {e}"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
            Self::InvalidKey => write!(f, "Key must not be empty"),
        }
    }
}

impl std::error::Error for RelayError {}

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<ProtocolError> for RelayError {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

struct RelayInner {
    config: RelayConfig,
    store: Arc<StateStore>,
    durable: Option<Arc<dyn DurableStore>>,
    broadcast: BroadcastGroup,
    stats: RwLock<RelayStats>,
}

/// The relay. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Relay {
    inner: Arc<RelayInner>,
}

impl Relay {
    /// Create a relay from configuration.
    ///
    /// With `storage_path` set this opens RocksDB and must run inside a tokio
    /// runtime (the mirror writer is a blocking task).
    pub fn new(config: RelayConfig) -> Result<Self, RelayError> {
        match config.storage_path.clone() {
            Some(path) => {
                let durable = RocksStore::open(StoreConfig {
                    path,
                    ..StoreConfig::default()
                })?;
                Ok(Self::with_durable(config, Arc::new(durable)))
            }
            None => Ok(Self::with_store(config, Arc::new(StateStore::new()))),
        }
    }

    /// Create a relay mirrored to an already-open durable store.
    pub fn with_durable(config: RelayConfig, durable: Arc<dyn DurableStore>) -> Self {
        let store = Arc::new(StateStore::with_durable(durable.clone()));
        Self::build(config, store, Some(durable))
    }

    /// Create a relay over an existing state store (shared with the caller).
    pub fn with_store(config: RelayConfig, store: Arc<StateStore>) -> Self {
        Self::build(config, store, None)
    }

    fn build(
        config: RelayConfig,
        store: Arc<StateStore>,
        durable: Option<Arc<dyn DurableStore>>,
    ) -> Self {
        let broadcast = BroadcastGroup::new(config.broadcast_capacity);
        Self {
            inner: Arc::new(RelayInner {
                config,
                store,
                durable,
                broadcast,
                stats: RwLock::new(RelayStats::default()),
            }),
        }
    }

    /// Load every persisted state into the store.
    ///
    /// Called once by [`Relay::bind`] before the listener accepts traffic.
    pub fn recover(&self) -> Result<usize, RelayError> {
        let Some(durable) = &self.inner.durable else {
            return Ok(0);
        };
        let recovered = self.inner.store.load_from(durable.as_ref())?;
        log::info!("Recovered {recovered} keys from persistent storage");
        Ok(recovered)
    }

    // ─── Logical RPC surface ─────────────────────────────────────────

    /// Apply an update and fan it out to every session except `origin`.
    ///
    /// `writer` is recorded as the key's last writer and used as the
    /// `sender_id` of the broadcast event.
    pub fn send_update(
        &self,
        origin: Option<ConnectionId>,
        writer: Option<Uuid>,
        key: &str,
        value: &str,
    ) -> Result<CellState, RelayError> {
        if key.is_empty() {
            return Err(RelayError::InvalidKey);
        }
        let broadcast = &self.inner.broadcast;
        let state = self.inner.store.set_value_with(key, value, writer, |state| {
            let update = UpdatePayload {
                key: state.key.clone(),
                value: state.value.clone(),
                timestamp: state.last_updated,
            };
            let sent = SyncMessage::receive_update(writer.unwrap_or_else(Uuid::nil), &update)
                .and_then(|event| broadcast.broadcast(origin, &event));
            if let Err(e) = sent {
                log::warn!("Failed to broadcast update for {}: {e}", state.key);
            }
        });
        log::debug!("Accepted update {key}={value} from {writer:?}");
        Ok(state)
    }

    pub fn get_value(&self, key: &str) -> Option<CellState> {
        self.inner.store.get_value(key)
    }

    pub fn get_all_state(&self) -> Vec<CellState> {
        self.inner.store.get_all()
    }

    pub fn status(&self) -> RelayStatus {
        RelayStatus {
            tracked_key_count: self.inner.store.len() as u64,
            timestamp: now_millis(),
        }
    }

    /// Explicitly delete a key (not part of normal sync traffic).
    pub fn remove(&self, key: &str) -> bool {
        self.inner.store.remove(key)
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.inner.store
    }

    pub fn broadcast_group(&self) -> &BroadcastGroup {
        &self.inner.broadcast
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    /// Get relay statistics.
    pub async fn stats(&self) -> RelayStats {
        self.inner.stats.read().await.clone()
    }

    // ─── Network ─────────────────────────────────────────────────────

    /// Recover persisted state, bind the listener and start accepting.
    pub async fn bind(&self) -> Result<RelayHandle, RelayError> {
        self.recover()?;

        let listener = TcpListener::bind(&self.inner.config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Relay listening on {local_addr}");

        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(Self::accept_loop(self.clone(), listener, cancel.clone()));

        Ok(RelayHandle {
            relay: self.clone(),
            local_addr,
            cancel,
            accept_task,
        })
    }

    /// Bind and serve until the accept loop ends.
    pub async fn run(&self) -> Result<(), RelayError> {
        let handle = self.bind().await?;
        handle.wait().await;
        Ok(())
    }

    async fn accept_loop(relay: Relay, listener: TcpListener, cancel: CancellationToken) {
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,

                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            let relay = relay.clone();
                            let cancel = cancel.child_token();
                            connections.spawn(async move {
                                relay.handle_connection(stream, addr, cancel).await;
                            });
                        }
                        Err(e) => {
                            log::warn!("Accept failed: {e}");
                        }
                    }
                }

                // Reap finished connection tasks
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        while connections.join_next().await.is_some() {}
        log::info!("Relay stopped accepting connections");
    }

    /// Handle a single WebSocket connection for its whole lifetime.
    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, cancel: CancellationToken) {
        let ws_stream = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                log::warn!("WebSocket handshake with {addr} failed: {e}");
                return;
            }
        };

        let conn = ConnectionId::new();
        let rx = self
            .inner
            .broadcast
            .add_session(conn, PeerInfo::with_id(conn.0, "anonymous"))
            .await;
        {
            let mut s = self.inner.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }
        log::info!("Session {conn} connected from {addr}");

        if let Err(e) = self.serve_connection(ws_stream, conn, rx, cancel).await {
            log::warn!("Connection error from {addr}: {e}");
        }

        // No key state is touched here: values and last writers outlive the session.
        self.inner.broadcast.remove_session(&conn).await;
        {
            let mut s = self.inner.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {conn} disconnected");
    }

    async fn serve_connection(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        conn: ConnectionId,
        mut rx: tokio::sync::broadcast::Receiver<Arc<crate::broadcast::Envelope>>,
        cancel: CancellationToken,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        // Writer identity until the session says hello
        let mut writer = conn.0;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    // Best effort: the peer may already be gone.
                    let _ = timeout(PEER_WRITE_TIMEOUT, ws_sender.send(Message::Close(None))).await;
                    break;
                }

                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            {
                                let mut s = self.inner.stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += data.len() as u64;
                            }
                            match SyncMessage::decode(&data) {
                                Ok(sync_msg) => {
                                    match self.handle_message(conn, &mut writer, sync_msg).await {
                                        Ok(Some(reply)) => {
                                            ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                        }
                                        Ok(None) => {}
                                        Err(e) => log::warn!("Failed to build reply for {conn}: {e}"),
                                    }
                                }
                                Err(e) => {
                                    log::warn!("Failed to decode message from {conn}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {conn}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                envelope = rx.recv() => {
                    match envelope {
                        Ok(envelope) => {
                            if envelope.is_for(conn) {
                                let frame = Message::Binary(envelope.bytes.clone().into());
                                if timeout(PEER_WRITE_TIMEOUT, ws_sender.send(frame)).await.is_err() {
                                    log::warn!("Session {conn} stopped reading; closing");
                                    self.inner.stats.write().await.lagged_disconnects += 1;
                                    break;
                                }
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // Updates were lost: the session's cache is stale. Closing makes
                            // it reconnect and resync instead of staying silently behind.
                            log::warn!("Session {conn} lagged by {n} messages; closing for resync");
                            self.inner.broadcast.record_dropped(n);
                            self.inner.stats.write().await.lagged_disconnects += 1;
                            let _ = timeout(PEER_WRITE_TIMEOUT, ws_sender.send(Message::Close(None))).await;
                            break;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Dispatch one inbound message. Returns the direct reply, if any.
    async fn handle_message(
        &self,
        conn: ConnectionId,
        writer: &mut Uuid,
        msg: SyncMessage,
    ) -> Result<Option<SyncMessage>, ProtocolError> {
        let request_id = msg.request_id;
        let reply = match msg.msg_type {
            MessageType::Hello => match msg.peer_info() {
                Ok(info) => {
                    *writer = info.peer_id;
                    log::info!("Session {conn} is {} ({})", info.name, info.peer_id);
                    self.inner.broadcast.rename_session(conn, info).await;
                    None
                }
                Err(e) => Some(SyncMessage::error(request_id, &e.to_string())?),
            },

            MessageType::SendUpdate => {
                let update = match msg.update() {
                    Ok(update) => update,
                    Err(e) => return Ok(Some(SyncMessage::error(request_id, &e.to_string())?)),
                };
                match self.send_update(Some(conn), Some(*writer), &update.key, &update.value) {
                    Ok(_) => {
                        self.inner.stats.write().await.updates_accepted += 1;
                        None
                    }
                    Err(e) => Some(SyncMessage::error(request_id, &e.to_string())?),
                }
            }

            MessageType::GetValue => match msg.requested_key() {
                Ok(key) => Some(SyncMessage::value(request_id, self.get_value(&key).as_ref())?),
                Err(e) => Some(SyncMessage::error(request_id, &e.to_string())?),
            },

            MessageType::GetAllState => {
                let all = self.get_all_state();
                log::debug!("Session {conn} resync: {} keys", all.len());
                Some(SyncMessage::all_state(request_id, &all)?)
            }

            MessageType::GetStatus => Some(SyncMessage::status(request_id, &self.status())?),

            MessageType::Ping => Some(SyncMessage::pong(Uuid::nil())),

            other => {
                log::debug!("Unhandled message type from {conn}: {other:?}");
                None
            }
        };
        Ok(reply)
    }
}

/// A bound, running relay.
pub struct RelayHandle {
    relay: Relay,
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL clients connect to.
    pub fn url(&self) -> String {
        format!("ws://{}", self.local_addr)
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub async fn stats(&self) -> RelayStats {
        self.relay.stats().await
    }

    /// Stop accepting, close every session, and flush the durable mirror.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.accept_task.await {
            log::warn!("Relay accept loop ended abnormally: {e}");
        }
        if self.relay.inner.durable.is_some() {
            self.relay.inner.store.shutdown().await;
        }
        log::info!("Relay on {} shut down", self.local_addr);
    }

    /// Wait until the accept loop exits (it only exits on shutdown).
    pub async fn wait(self) {
        let _ = self.accept_task.await;
    }

    /// Token that stops the relay when cancelled (for signal handlers).
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
