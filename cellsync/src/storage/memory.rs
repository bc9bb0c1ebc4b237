//! In-process durable store, for embedding and tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{DurableStore, StoreError};
use crate::protocol::CellState;

/// `DurableStore` backed by a map in memory.
///
/// `set_fail_writes(true)` makes every `persist` fail, which is how tests
/// exercise the persistence-failure path.
#[derive(Default)]
pub struct MemoryStore {
    cells: Mutex<BTreeMap<String, CellState>>,
    fail_writes: AtomicBool,
    writes: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populated store (simulates state left by a previous run).
    pub fn with_cells(cells: impl IntoIterator<Item = CellState>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.cells.lock() {
            for cell in cells {
                map.insert(cell.key.clone(), cell);
            }
        }
        store
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful persists.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<CellState> {
        self.cells.lock().ok()?.get(key).cloned()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, CellState>>, StoreError> {
        self.cells
            .lock()
            .map_err(|_| StoreError::DatabaseError("memory store poisoned".into()))
    }
}

impl DurableStore for MemoryStore {
    fn persist(&self, state: &CellState) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::WriteRejected(format!("injected failure for {}", state.key)));
        }
        self.lock()?.insert(state.key.clone(), state.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lock()?.remove(key).is_some())
    }

    fn load_all(&self) -> Result<Vec<CellState>, StoreError> {
        Ok(self.lock()?.values().cloned().collect())
    }
}
