//! Debounced publisher for local writes.
//!
//! Suppression policy, per key:
//! - a value byte-identical to the last *sent* value, arriving within
//!   `min_interval` of that send, is suppressed;
//! - a value that differs from the last sent value is always sent, however
//!   soon it follows the previous send.
//!
//! So `min_interval` only gates quick identical repeats (the usual shape of
//! a recomputation storm); it never throttles a run of distinct values.
//! Last-sent value and time are recorded on every send that is not
//! suppressed, including sends the session then drops while disconnected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::mux::SubscriptionMux;

/// What the transport did with one outbound update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Handed to the connection's writer
    Queued,
    /// Discarded: not connected, or the outbound buffer is full
    Dropped,
}

/// Anything that can take an outbound `(key, value)` without blocking.
pub trait UpdateSink: Send + Sync {
    fn send_update(&self, key: &str, value: &str) -> SendOutcome;
}

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct DebounceConfig {
    /// Window in which identical repeats are suppressed
    pub min_interval: Duration,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
        }
    }
}

/// Result of one `publish` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    Sent,
    /// Passed the debounce but the session dropped it
    Dropped,
    /// Identical repeat inside the window
    Suppressed,
    /// The value was just applied from the relay
    Echo,
}

struct LastSent {
    value: String,
    at: Instant,
}

/// Coalesces rapid identical local writes before they reach the session.
pub struct DebouncedPublisher {
    config: DebounceConfig,
    sink: Arc<dyn UpdateSink>,
    echo_filter: Option<Arc<SubscriptionMux>>,
    last_sent: Mutex<HashMap<String, LastSent>>,
    sent: AtomicU64,
    suppressed: AtomicU64,
    echoes: AtomicU64,
}

impl DebouncedPublisher {
    pub fn new(config: DebounceConfig, sink: Arc<dyn UpdateSink>) -> Self {
        Self {
            config,
            sink,
            echo_filter: None,
            last_sent: Mutex::new(HashMap::new()),
            sent: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            echoes: AtomicU64::new(0),
        }
    }

    /// Drop publishes that merely echo a value the multiplexer delivered.
    pub fn with_echo_filter(mut self, mux: Arc<SubscriptionMux>) -> Self {
        self.echo_filter = Some(mux);
        self
    }

    /// Publish a local change. Never blocks on the network.
    pub fn publish(&self, key: &str, value: &str) -> PublishOutcome {
        if let Some(mux) = &self.echo_filter {
            if mux.take_echo(key, value) {
                self.echoes.fetch_add(1, Ordering::Relaxed);
                log::trace!("Skipping echo of remote value for {key}");
                return PublishOutcome::Echo;
            }
        }

        // Held across the hand-off so sends for one key leave in decision order.
        let mut last_sent = self.lock_last_sent();

        if let Some(last) = last_sent.get(key) {
            if last.value == value && last.at.elapsed() < self.config.min_interval {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                return PublishOutcome::Suppressed;
            }
        }

        last_sent.insert(
            key.to_string(),
            LastSent {
                value: value.to_string(),
                at: Instant::now(),
            },
        );
        self.sent.fetch_add(1, Ordering::Relaxed);

        match self.sink.send_update(key, value) {
            SendOutcome::Queued => PublishOutcome::Sent,
            SendOutcome::Dropped => PublishOutcome::Dropped,
        }
    }

    /// Forget the last-sent record for `key`.
    pub fn forget(&self, key: &str) {
        self.lock_last_sent().remove(key);
    }

    fn lock_last_sent(&self) -> MutexGuard<'_, HashMap<String, LastSent>> {
        // A panicking sink leaves a plain map behind; keep using it.
        self.last_sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Sends handed to the sink (queued or dropped).
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn suppressed_count(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }

    pub fn echo_count(&self) -> u64 {
        self.echoes.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &DebounceConfig {
        &self.config
    }
}
