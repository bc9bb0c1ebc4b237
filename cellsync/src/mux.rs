//! Subscription multiplexer: topic handles ↔ keys, plus the local value cache.
//!
//! ```text
//!  network context                         display context
//!  ───────────────                         ───────────────
//!  apply_remote_update ─┐               ┌─ subscribe / unsubscribe
//!  apply_resync ────────┼── MuxState ───┼─ drain_refresh / refresh_into
//!                       │  (one Mutex)  │
//!                       └───────────────┘
//! ```
//!
//! Remote values only mark handles dirty. The display surface pulls the dirty
//! set on its own refresh cadence, so it never sees a half-applied update and
//! the network task never calls into display code.
//!
//! Each value handed to the display leaves a per-key echo mark, counted once
//! per delivered handle. When the host's change detection reports that same
//! value back as a local change, [`SubscriptionMux::take_echo`] consumes one
//! count and the publisher drops it.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::protocol::CellState;

/// Process-local reference the display surface uses for one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicHandle(pub u64);

/// Result of a successful subscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscribeResult {
    /// A cached value exists and is returned immediately
    Fresh(String),
    /// No value yet; the handle will show up in a later refresh
    Pending,
}

/// Subscription failures. Local to the caller; other subscriptions and the
/// connection are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    EmptyKey,
    /// The handle is already bound to a different key
    HandleInUse { handle: TopicHandle, key: String },
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "Key must not be empty"),
            Self::HandleInUse { handle, key } => {
                write!(f, "Handle {} already subscribed to {key}", handle.0)
            }
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// One `(handle, key, value)` triple pulled by the display surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refresh {
    pub handle: TopicHandle,
    pub key: String,
    pub value: String,
}

/// Receiver of refreshed values on the display side.
pub trait DisplaySink {
    fn deliver(&mut self, handle: TopicHandle, key: &str, value: &str);
}

impl<F> DisplaySink for F
where
    F: FnMut(TopicHandle, &str, &str),
{
    fn deliver(&mut self, handle: TopicHandle, key: &str, value: &str) {
        self(handle, key, value)
    }
}

#[derive(Default)]
struct MuxState {
    handle_to_key: HashMap<TopicHandle, String>,
    key_to_handles: HashMap<String, BTreeSet<TopicHandle>>,
    cache: HashMap<String, String>,
    dirty: BTreeSet<TopicHandle>,
    echo_marks: HashMap<String, EchoMark>,
}

/// Value last delivered for a key and how many deliveries are unreported.
struct EchoMark {
    value: String,
    remaining: usize,
}

impl MuxState {
    /// Store `value` for `key`; mark bound handles dirty if it changed.
    fn store(&mut self, key: &str, value: &str) -> usize {
        if self.cache.get(key).map(String::as_str) == Some(value) {
            return 0;
        }
        self.cache.insert(key.to_string(), value.to_string());
        match self.key_to_handles.get(key) {
            Some(handles) => {
                self.dirty.extend(handles.iter().copied());
                handles.len()
            }
            None => 0,
        }
    }
}

/// Per-process subscription table and value cache.
#[derive(Default)]
pub struct SubscriptionMux {
    state: Mutex<MuxState>,
    next_handle: AtomicU64,
}

impl SubscriptionMux {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        // A panic in another holder leaves plain maps behind; keep serving them.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Hand out a fresh, unused topic handle.
    pub fn allocate_handle(&self) -> TopicHandle {
        TopicHandle(self.next_handle.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Bind `handle` to `key`.
    ///
    /// Re-subscribing a handle to the key it already holds is a no-op that
    /// reports the current value.
    pub fn subscribe(
        &self,
        handle: TopicHandle,
        key: &str,
    ) -> Result<SubscribeResult, SubscriptionError> {
        if key.trim().is_empty() {
            return Err(SubscriptionError::EmptyKey);
        }

        let mut state = self.lock();
        if let Some(bound) = state.handle_to_key.get(&handle) {
            if bound != key {
                return Err(SubscriptionError::HandleInUse {
                    handle,
                    key: bound.clone(),
                });
            }
        }

        state.handle_to_key.insert(handle, key.to_string());
        state
            .key_to_handles
            .entry(key.to_string())
            .or_default()
            .insert(handle);

        Ok(match state.cache.get(key) {
            Some(value) => SubscribeResult::Fresh(value.clone()),
            None => SubscribeResult::Pending,
        })
    }

    /// Remove both directions of the mapping. Returns whether it existed.
    pub fn unsubscribe(&self, handle: TopicHandle) -> bool {
        let mut state = self.lock();
        let Some(key) = state.handle_to_key.remove(&handle) else {
            return false;
        };
        if let Some(handles) = state.key_to_handles.get_mut(&key) {
            handles.remove(&handle);
            if handles.is_empty() {
                state.key_to_handles.remove(&key);
            }
        }
        state.dirty.remove(&handle);
        true
    }

    /// Cache a value pushed by the relay. Returns how many handles now need
    /// a refresh.
    pub fn apply_remote_update(&self, key: &str, value: &str) -> usize {
        self.lock().store(key, value)
    }

    /// Overwrite the cache with a full-state snapshot.
    pub fn apply_resync(&self, cells: &[CellState]) -> usize {
        let mut state = self.lock();
        cells.iter().map(|cell| state.store(&cell.key, &cell.value)).sum()
    }

    /// Take every pending refresh as one consistent batch.
    pub fn drain_refresh(&self) -> Vec<Refresh> {
        let mut state = self.lock();
        let dirty = std::mem::take(&mut state.dirty);
        let mut batch = Vec::with_capacity(dirty.len());

        for handle in dirty {
            let Some(key) = state.handle_to_key.get(&handle) else {
                continue;
            };
            let Some(value) = state.cache.get(key) else {
                continue;
            };
            batch.push(Refresh {
                handle,
                key: key.clone(),
                value: value.clone(),
            });
        }

        for refresh in &batch {
            let mark = state
                .echo_marks
                .entry(refresh.key.clone())
                .or_insert_with(|| EchoMark {
                    value: refresh.value.clone(),
                    remaining: 0,
                });
            if mark.value != refresh.value {
                mark.value = refresh.value.clone();
                mark.remaining = 0;
            }
            mark.remaining += 1;
        }
        batch
    }

    /// Drain pending refreshes into `sink`. The lock is released before the
    /// sink runs, so the sink may call back into the multiplexer.
    pub fn refresh_into(&self, sink: &mut dyn DisplaySink) -> usize {
        let batch = self.drain_refresh();
        for refresh in &batch {
            sink.deliver(refresh.handle, &refresh.key, &refresh.value);
        }
        batch.len()
    }

    /// Consume one echo count for `key`; true if the mark matches `value`.
    ///
    /// A different value clears the mark for the key, so a later local change
    /// back to the delivered value is published normally.
    pub fn take_echo(&self, key: &str, value: &str) -> bool {
        let mut state = self.lock();
        let Some(mark) = state.echo_marks.get_mut(key) else {
            return false;
        };
        if mark.value != value {
            state.echo_marks.remove(key);
            return false;
        }
        mark.remaining -= 1;
        if mark.remaining == 0 {
            state.echo_marks.remove(key);
        }
        true
    }

    pub fn cached(&self, key: &str) -> Option<String> {
        self.lock().cache.get(key).cloned()
    }

    pub fn key_for(&self, handle: TopicHandle) -> Option<String> {
        self.lock().handle_to_key.get(&handle).cloned()
    }

    pub fn handles_for(&self, key: &str) -> Vec<TopicHandle> {
        self.lock()
            .key_to_handles
            .get(key)
            .map(|handles| handles.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Keys with at least one live subscription.
    pub fn subscribed_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().key_to_handles.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().handle_to_key.len()
    }

    pub fn pending_refresh_count(&self) -> usize {
        self.lock().dirty.len()
    }
}
