//! Authoritative key → value store held by the relay.
//!
//! Backed by a sharded `DashMap`: each write locks one shard, so writers on
//! different keys never contend on a global lock. A write lands in memory
//! synchronously; the optional durable mirror is fed through an unbounded
//! channel and written by a single owned blocking task. Enqueueing takes no
//! lock beyond the key's shard.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::protocol::{now_millis, CellState};
use crate::storage::{DurableStore, StoreError};

enum PersistOp {
    Put(CellState),
    Remove(String),
    /// Ops queued before this one are written; the worker then exits.
    Stop,
}

/// In-memory authoritative state, optionally mirrored to durable storage.
pub struct StateStore {
    cells: DashMap<String, CellState>,
    persist_tx: Option<mpsc::UnboundedSender<PersistOp>>,
    /// Only `shutdown` touches this.
    worker: Mutex<Option<JoinHandle<()>>>,
    persist_failures: Arc<AtomicU64>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    /// Create an in-memory store with no durable mirror.
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
            persist_tx: None,
            worker: Mutex::new(None),
            persist_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Create a store mirrored to `durable`.
    ///
    /// Must be called inside a tokio runtime: the mirror writer runs as a
    /// blocking task.
    pub fn with_durable(durable: Arc<dyn DurableStore>) -> Self {
        let mut store = Self::new();
        let (tx, mut rx) = mpsc::unbounded_channel::<PersistOp>();
        let failures = store.persist_failures.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(op) = rx.blocking_recv() {
                let result = match &op {
                    PersistOp::Put(state) => durable.persist(state),
                    PersistOp::Remove(key) => durable.remove(key).map(|_| ()),
                    PersistOp::Stop => break,
                };
                if let Err(e) = result {
                    failures.fetch_add(1, Ordering::Relaxed);
                    match op {
                        PersistOp::Put(state) => {
                            log::error!("Failed to persist key {}: {e}", state.key)
                        }
                        PersistOp::Remove(key) => {
                            log::error!("Failed to remove persisted key {key}: {e}")
                        }
                        PersistOp::Stop => {}
                    }
                }
            }
            log::debug!("Persistence worker stopped");
        });

        store.persist_tx = Some(tx);
        store.worker = Mutex::new(Some(handle));
        store
    }

    /// Pre-populate from the durable store before live traffic is accepted.
    ///
    /// Loaded values are not written back to the mirror.
    pub fn load_from(&self, durable: &dyn DurableStore) -> Result<usize, StoreError> {
        let cells = durable.load_all()?;
        let count = cells.len();
        for cell in cells {
            self.cells.insert(cell.key.clone(), cell);
        }
        Ok(count)
    }

    /// Unconditional overwrite of `key`. Returns the stored state.
    pub fn set_value(&self, key: &str, value: &str, writer: Option<Uuid>) -> CellState {
        self.set_value_with(key, value, writer, |_| ())
    }

    /// Overwrite `key` and run `on_applied` while the key is still locked.
    ///
    /// Writers to the same key observe `on_applied` in the order their writes
    /// were applied; the relay broadcasts from here so fan-out order matches
    /// store order. `on_applied` must not block or touch this store.
    pub fn set_value_with<F>(
        &self,
        key: &str,
        value: &str,
        writer: Option<Uuid>,
        on_applied: F,
    ) -> CellState
    where
        F: FnOnce(&CellState),
    {
        let mut entry = self
            .cells
            .entry(key.to_string())
            .or_insert_with(|| CellState::new(key, "", None));
        entry.value = value.to_string();
        entry.last_writer = writer;
        entry.last_updated = now_millis();
        let state = entry.value().clone();
        self.mirror(PersistOp::Put(state.clone()));
        on_applied(&state);
        drop(entry);
        state
    }

    pub fn get_value(&self, key: &str) -> Option<CellState> {
        self.cells.get(key).map(|entry| entry.value().clone())
    }

    /// Point-in-time copy of every key, sorted by key.
    ///
    /// Each entry is read atomically; the snapshot as a whole is not
    /// isolated from concurrent writes to other keys.
    pub fn get_all(&self) -> Vec<CellState> {
        let mut all: Vec<CellState> = self.cells.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn remove(&self, key: &str) -> bool {
        match self.cells.entry(key.to_string()) {
            Entry::Occupied(entry) => {
                self.mirror(PersistOp::Remove(key.to_string()));
                entry.remove();
                true
            }
            Entry::Vacant(_) => false,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Number of durable writes that failed since startup.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures.load(Ordering::Relaxed)
    }

    /// Whether a durable mirror is attached.
    pub fn is_durable(&self) -> bool {
        self.persist_tx.is_some()
    }

    /// Stop the mirror writer after it drains queued writes.
    ///
    /// Writes made after this are kept in memory and counted as persist
    /// failures.
    pub async fn shutdown(&self) {
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        if let Some(tx) = &self.persist_tx {
            // A send error means the worker already exited.
            let _ = tx.send(PersistOp::Stop);
        }
        if let Err(e) = handle.await {
            log::warn!("Persistence worker ended abnormally: {e}");
        }
    }

    fn mirror(&self, op: PersistOp) {
        let Some(tx) = &self.persist_tx else {
            return;
        };
        if tx.send(op).is_err() {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            log::error!("Persistence worker is gone; durable mirror skipped");
        }
    }
}
