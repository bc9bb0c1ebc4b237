//! Durable mirror for relay state.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐   CellState    ┌──────────────────┐    ┌──────────────┐
//! │ StateStore  │ ─────────────► │ persistence task │ ─► │ DurableStore │
//! │ (in-memory) │  (unbounded)   │ (spawn_blocking) │    │ Rocks/Memory │
//! └──────┬──────┘                └──────────────────┘    └──────┬───────┘
//!        │                                                      │
//!        └──────────────── load_all() on startup ◄──────────────┘
//! ```
//!
//! The in-memory store is the source of truth. Writes to the durable mirror
//! are best-effort: a failure is logged and counted, never retried.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

use uuid::Uuid;

use crate::protocol::CellState;

/// Narrow load/persist contract of a durable backend.
pub trait DurableStore: Send + Sync {
    /// Write (or overwrite) the state of one key.
    fn persist(&self, state: &CellState) -> Result<(), StoreError>;

    /// Delete one key. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool, StoreError>;

    /// Load every persisted state. Called once before serving traffic.
    fn load_all(&self) -> Result<Vec<CellState>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Backend refused the write
    WriteRejected(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::WriteRejected(e) => write!(f, "Write rejected: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

/// On-disk record; the key lives in the RocksDB key, not the value.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct StoredCell {
    pub value: String,
    pub last_writer: Option<Uuid>,
    pub last_updated: u64,
}

impl StoredCell {
    pub(crate) fn encode(state: &CellState) -> Result<Vec<u8>, StoreError> {
        let record = StoredCell {
            value: state.value.clone(),
            last_writer: state.last_writer,
            last_updated: state.last_updated,
        };
        bincode::serde::encode_to_vec(&record, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    pub(crate) fn decode(key: &str, bytes: &[u8]) -> Result<CellState, StoreError> {
        let (record, _): (StoredCell, usize) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(CellState {
            key: key.to_string(),
            value: record.value,
            last_writer: record.last_writer,
            last_updated: record.last_updated,
        })
    }
}
