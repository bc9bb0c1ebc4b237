//! Process-wide sync context.
//!
//! Owns one [`Session`], its [`SubscriptionMux`] and a
//! [`DebouncedPublisher`] wired to both. Nothing here is a global: a host
//! creates one context at startup and passes it where it is needed.

use std::sync::Arc;

use crate::mux::{DisplaySink, SubscribeResult, SubscriptionError, SubscriptionMux, TopicHandle};
use crate::publisher::{DebounceConfig, DebouncedPublisher, PublishOutcome};
use crate::session::{Session, SessionConfig, SessionState};

pub struct SyncContext {
    session: Arc<Session>,
    mux: Arc<SubscriptionMux>,
    publisher: DebouncedPublisher,
}

impl SyncContext {
    pub fn new(session_config: SessionConfig, debounce: DebounceConfig) -> Self {
        let mux = Arc::new(SubscriptionMux::new());
        let session = Arc::new(Session::new(session_config, mux.clone()));
        let publisher =
            DebouncedPublisher::new(debounce, session.clone()).with_echo_filter(mux.clone());
        Self {
            session,
            mux,
            publisher,
        }
    }

    /// Begin connecting. Must be called inside a tokio runtime.
    pub fn start(&self) {
        self.session.connect();
    }

    /// Publish a local change through the debouncer.
    pub fn publish(&self, key: &str, value: &str) -> PublishOutcome {
        self.publisher.publish(key, value)
    }

    /// Subscribe a freshly allocated handle to `key`.
    pub fn subscribe(
        &self,
        key: &str,
    ) -> Result<(TopicHandle, SubscribeResult), SubscriptionError> {
        let handle = self.mux.allocate_handle();
        let result = self.mux.subscribe(handle, key)?;
        Ok((handle, result))
    }

    pub fn unsubscribe(&self, handle: TopicHandle) -> bool {
        self.mux.unsubscribe(handle)
    }

    /// Deliver pending refreshes to the display surface.
    pub fn refresh_into(&self, sink: &mut dyn DisplaySink) -> usize {
        self.mux.refresh_into(sink)
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn mux(&self) -> &Arc<SubscriptionMux> {
        &self.mux
    }

    pub fn publisher(&self) -> &DebouncedPublisher {
        &self.publisher
    }

    /// Tear the session down. The context stays usable for local reads.
    pub async fn shutdown(&self) {
        self.session.shutdown().await;
    }
}
