//! # cellsync: last-writer-wins keyed value sync over WebSocket
//!
//! Many processes share a flat namespace of string keys, each holding one
//! scalar string value. A relay keeps the authoritative copy; every accepted
//! write is fanned out to every other connected session.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────── client process ───────────────────────┐
//! │                                                               │
//! │  display ◄── refresh_into ── SubscriptionMux ◄── RemoteUpdate │
//! │     │                            │   ▲            / resync    │
//! │     │ local change     take_echo │   │                        │
//! │     ▼                            ▼   │                        │
//! │  DebouncedPublisher ─────────► Session (reconnect, backoff) ──┼──┐
//! └───────────────────────────────────────────────────────────────┘  │
//!                                                       WebSocket    │
//! ┌──────────────────────── relay ────────────────────────────────┐  │
//! │  connection task ◄─────────────────────────────────────────────┼──┘
//! │     │                                                          │
//! │     ├──► StateStore (DashMap) ──► durable mirror (RocksDB)     │
//! │     └──► BroadcastGroup ──► every other session                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: binary wire protocol (bincode-encoded `SyncMessage`)
//! - [`store`]: authoritative per-key LWW store
//! - [`storage`]: durable mirror backends
//! - [`broadcast`]: fan-out with per-session lag handling
//! - [`relay`]: WebSocket relay
//! - [`session`]: client session with reconnect and resync
//! - [`mux`]: topic handle ↔ key table and local cache
//! - [`publisher`]: debounced outbound writes
//! - [`context`]: one session, mux and publisher wired together

pub mod broadcast;
pub mod context;
pub mod mux;
pub mod protocol;
pub mod publisher;
pub mod relay;
pub mod session;
pub mod storage;
pub mod store;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, ConnectionId, Envelope};
pub use context::SyncContext;
pub use mux::{
    DisplaySink, Refresh, SubscribeResult, SubscriptionError, SubscriptionMux, TopicHandle,
};
pub use protocol::{
    CellState, MessageType, PeerInfo, ProtocolError, RelayStatus, SyncMessage, UpdatePayload,
};
pub use publisher::{
    DebounceConfig, DebouncedPublisher, PublishOutcome, SendOutcome, UpdateSink,
};
pub use relay::{Relay, RelayConfig, RelayError, RelayHandle, RelayStats};
pub use session::{
    ConnectionPhase, Session, SessionConfig, SessionError, SessionEvent, SessionState,
};
pub use storage::{DurableStore, MemoryStore, RocksStore, StoreConfig, StoreError};
pub use store::StateStore;
