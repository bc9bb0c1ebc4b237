//! End-to-end tests: a real relay on an ephemeral port and real sessions.

use cellsync::{
    ConnectionPhase, DebounceConfig, PublishOutcome, Relay, RelayConfig, RelayHandle, SendOutcome,
    Session, SessionConfig, SessionEvent, StateStore, SubscribeResult, SubscriptionMux,
    SyncContext, TopicHandle,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

async fn start_relay() -> RelayHandle {
    start_relay_with_capacity(64).await
}

async fn start_relay_with_capacity(broadcast_capacity: usize) -> RelayHandle {
    let config = RelayConfig {
        bind_addr: "127.0.0.1:0".into(),
        broadcast_capacity,
        storage_path: None,
    };
    Relay::new(config).unwrap().bind().await.unwrap()
}

/// Poll the session's cache until `key` holds `expected`.
async fn wait_cached(session: &Session, key: &str, expected: &str) {
    timeout(WAIT, async {
        while session.mux().cached(key).as_deref() != Some(expected) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| {
        panic!(
            "{key} never reached {expected:?}, cached {:?}",
            session.mux().cached(key)
        )
    });
}

fn fast_config(url: &str, name: &str) -> SessionConfig {
    SessionConfig {
        peer_name: name.into(),
        backoff: vec![Duration::from_millis(50)],
        request_timeout: Duration::from_secs(2),
        ..SessionConfig::new(url)
    }
}

/// Wait for the next event matching `pred`, skipping others.
async fn next_matching<F>(rx: &mut mpsc::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_resynced(rx: &mut mpsc::Receiver<SessionEvent>) {
    next_matching(rx, |e| matches!(e, SessionEvent::Resynced { .. })).await;
}

/// Connected session whose initial resync has landed.
async fn connect_session(url: &str, name: &str) -> (Session, mpsc::Receiver<SessionEvent>) {
    let session = Session::new(fast_config(url, name), Arc::new(SubscriptionMux::new()));
    let mut events = session.take_event_rx().unwrap();
    session.connect();
    wait_resynced(&mut events).await;
    (session, events)
}

async fn next_remote_update(rx: &mut mpsc::Receiver<SessionEvent>) -> (String, String, uuid::Uuid) {
    match next_matching(rx, |e| matches!(e, SessionEvent::RemoteUpdate { .. })).await {
        SessionEvent::RemoteUpdate {
            key,
            value,
            sender_id,
            ..
        } => (key, value, sender_id),
        _ => unreachable!(),
    }
}

async fn assert_no_remote_update(rx: &mut mpsc::Receiver<SessionEvent>) {
    let got = timeout(QUIET, async {
        loop {
            match rx.recv().await {
                Some(SessionEvent::RemoteUpdate { key, value, .. }) => return (key, value),
                Some(_) => continue,
                None => std::future::pending::<()>().await,
            }
        }
    })
    .await;
    assert!(got.is_err(), "unexpected remote update: {got:?}");
}

#[tokio::test]
async fn test_session_connects_and_resyncs() {
    let relay = start_relay().await;
    let (session, _events) = connect_session(&relay.url(), "Alice").await;

    let state = session.state();
    assert_eq!(state.phase, ConnectionPhase::Connected);
    assert!(!state.pending_resync);
    assert_eq!(state.reconnect_attempt, 0);

    session.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_update_reaches_every_other_session() {
    let relay = start_relay().await;
    let url = relay.url();
    let (a, mut events_a) = connect_session(&url, "A").await;
    let (_b, mut events_b) = connect_session(&url, "B").await;
    let (_c, mut events_c) = connect_session(&url, "C").await;

    assert_eq!(a.send_update("price", "100"), SendOutcome::Queued);

    for events in [&mut events_b, &mut events_c] {
        let (key, value, sender) = next_remote_update(events).await;
        assert_eq!((key.as_str(), value.as_str()), ("price", "100"));
        assert_eq!(sender, a.peer_info().peer_id);
    }
    // The writer never hears its own update back
    assert_no_remote_update(&mut events_a).await;

    let cell = relay.relay().get_value("price").unwrap();
    assert_eq!(cell.value, "100");
    assert_eq!(cell.last_writer, Some(a.peer_info().peer_id));

    let stats = relay.stats().await;
    assert_eq!(stats.total_connections, 3);
    assert_eq!(stats.active_connections, 3);
}

#[tokio::test]
async fn test_remote_update_lands_in_mux() {
    let relay = start_relay().await;
    let url = relay.url();
    let (a, _events_a) = connect_session(&url, "A").await;
    let (b, mut events_b) = connect_session(&url, "B").await;

    let handle = TopicHandle(1);
    assert_eq!(b.mux().subscribe(handle, "temp").unwrap(), SubscribeResult::Pending);

    a.send_update("temp", "21.5");
    next_remote_update(&mut events_b).await;

    let batch = b.mux().drain_refresh();
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].handle, handle);
    assert_eq!(batch[0].value, "21.5");
}

#[tokio::test]
async fn test_last_writer_wins_convergence() {
    let relay = start_relay().await;
    let url = relay.url();
    let (a, _events_a) = connect_session(&url, "A").await;
    let (b, mut events_b) = connect_session(&url, "B").await;
    let (c, mut events_c) = connect_session(&url, "C").await;

    a.send_update("k", "1");
    next_remote_update(&mut events_b).await;
    b.send_update("k", "2");

    // C sees both, in relay order
    assert_eq!(next_remote_update(&mut events_c).await.1, "1");
    assert_eq!(next_remote_update(&mut events_c).await.1, "2");

    let cell = c.get_value("k").await.unwrap().unwrap();
    assert_eq!(cell.value, "2");
    assert_eq!(cell.last_writer, Some(b.peer_info().peer_id));

    let from_a = a.get_all_state().await.unwrap();
    let from_c = c.get_all_state().await.unwrap();
    assert_eq!(from_a, from_c);
    assert_eq!(c.mux().cached("k").as_deref(), Some("2"));
}

#[tokio::test]
async fn test_get_value_missing_key() {
    let relay = start_relay().await;
    let (session, _events) = connect_session(&relay.url(), "A").await;
    assert!(session.get_value("nope").await.unwrap().is_none());
}

#[tokio::test]
async fn test_status_counts_keys() {
    let relay = start_relay().await;
    let (session, _events) = connect_session(&relay.url(), "A").await;
    relay.relay().send_update(None, None, "a", "1").unwrap();
    relay.relay().send_update(None, None, "b", "2").unwrap();

    let status = session.get_status().await.unwrap();
    assert_eq!(status.tracked_key_count, 2);
    assert!(status.timestamp > 0);
}

#[tokio::test]
async fn test_resync_is_idempotent() {
    let relay = start_relay().await;
    relay.relay().send_update(None, None, "x", "1").unwrap();
    relay.relay().send_update(None, None, "y", "2").unwrap();

    let (session, _events) = connect_session(&relay.url(), "A").await;
    session.mux().subscribe(TopicHandle(1), "x").unwrap();
    session.mux().drain_refresh();

    assert_eq!(session.resync().await.unwrap(), 2);
    assert_eq!(session.resync().await.unwrap(), 2);

    // Unchanged values produce no refresh work
    assert!(session.mux().drain_refresh().is_empty());
    assert_eq!(session.mux().cached("y").as_deref(), Some("2"));
    assert!(!session.state().pending_resync);
}

#[tokio::test]
async fn test_reconnect_resyncs_missed_writes() {
    let store = Arc::new(StateStore::new());
    let port = free_port().await;
    let config = RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        ..RelayConfig::default()
    };

    let first = Relay::with_store(config.clone(), store.clone()).bind().await.unwrap();
    let (session, mut events) = connect_session(&first.url(), "A").await;
    session.mux().subscribe(TopicHandle(1), "k").unwrap();

    first.shutdown().await;
    next_matching(&mut events, |e| *e == SessionEvent::Disconnected).await;
    assert_ne!(session.state().phase, ConnectionPhase::Connected);

    // Writes made while disconnected are dropped, not queued
    assert_eq!(session.send_update("k", "lost"), SendOutcome::Dropped);
    // Meanwhile another writer changed the relay's state
    store.set_value("k", "missed", None);

    let second = Relay::with_store(config, store.clone()).bind().await.unwrap();
    wait_resynced(&mut events).await;

    assert_eq!(session.state().phase, ConnectionPhase::Connected);
    assert_eq!(session.mux().cached("k").as_deref(), Some("missed"));
    assert_eq!(store.get_value("k").unwrap().value, "missed");

    for cell in session.get_all_state().await.unwrap() {
        assert_eq!(session.mux().cached(&cell.key), Some(cell.value));
    }

    session.shutdown().await;
    second.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_pending_backoff() {
    let port = free_port().await;
    let config = SessionConfig {
        backoff: vec![Duration::from_secs(60)],
        ..SessionConfig::new(format!("ws://127.0.0.1:{port}"))
    };
    let session = Session::new(config, Arc::new(SubscriptionMux::new()));
    session.connect();

    timeout(WAIT, session.wait_for(|s| s.reconnect_attempt >= 1))
        .await
        .unwrap();

    // Must not wait out the 60s delay
    timeout(Duration::from_secs(2), session.shutdown())
        .await
        .expect("shutdown blocked on backoff");
    assert!(session.state().terminated);
    assert_eq!(session.state().phase, ConnectionPhase::Disconnected);
}

#[tokio::test]
async fn test_debounced_publish_over_network() {
    let relay = start_relay().await;
    let url = relay.url();

    let ctx = SyncContext::new(
        fast_config(&url, "writer"),
        DebounceConfig {
            min_interval: Duration::from_secs(60),
        },
    );
    let mut ctx_events = ctx.session().take_event_rx().unwrap();
    ctx.start();
    wait_resynced(&mut ctx_events).await;

    let (_observer, mut events) = connect_session(&url, "observer").await;

    assert_eq!(ctx.publish("k", "5"), PublishOutcome::Sent);
    assert_eq!(ctx.publish("k", "5"), PublishOutcome::Suppressed);
    assert_eq!(ctx.publish("k", "5"), PublishOutcome::Suppressed);
    assert_eq!(ctx.publish("k", "6"), PublishOutcome::Sent);

    assert_eq!(next_remote_update(&mut events).await.1, "5");
    assert_eq!(next_remote_update(&mut events).await.1, "6");
    assert_no_remote_update(&mut events).await;

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_displayed_remote_value_is_not_echoed() {
    let relay = start_relay().await;
    let url = relay.url();

    let ctx = SyncContext::new(fast_config(&url, "display"), DebounceConfig::default());
    let mut ctx_events = ctx.session().take_event_rx().unwrap();
    ctx.start();
    wait_resynced(&mut ctx_events).await;
    let (handle, _) = ctx.subscribe("price").unwrap();

    let (writer, mut writer_events) = connect_session(&url, "writer").await;
    writer.send_update("price", "100");
    next_remote_update(&mut ctx_events).await;

    let mut shown = Vec::new();
    ctx.refresh_into(&mut |h: TopicHandle, k: &str, v: &str| {
        shown.push((h, k.to_string(), v.to_string()))
    });
    assert_eq!(shown, vec![(handle, "price".to_string(), "100".to_string())]);

    // Host change detection reports the displayed value as a local change
    assert_eq!(ctx.publish("price", "100"), PublishOutcome::Echo);
    assert_no_remote_update(&mut writer_events).await;

    ctx.shutdown().await;
}

#[tokio::test]
async fn test_values_survive_writer_disconnect() {
    let relay = start_relay().await;
    let url = relay.url();
    let (a, _events) = connect_session(&url, "A").await;
    let (b, mut events_b) = connect_session(&url, "B").await;

    a.send_update("owned", "yes");
    next_remote_update(&mut events_b).await;
    let writer = a.peer_info().peer_id;
    a.shutdown().await;
    drop(a);

    let cell = b.get_value("owned").await.unwrap().unwrap();
    assert_eq!(cell.value, "yes");
    assert_eq!(cell.last_writer, Some(writer));
}

#[tokio::test]
async fn test_lagging_session_reconnects_and_catches_up() {
    let relay = start_relay_with_capacity(2).await;
    let (session, mut events) = connect_session(&relay.url(), "Slow").await;
    session.mux().subscribe(TopicHandle(1), "a").unwrap();

    // No await between writes: the session's relay task cannot drain in time.
    relay.relay().send_update(None, None, "a", "1").unwrap();
    for i in 0..50 {
        relay.relay().send_update(None, None, "b", &i.to_string()).unwrap();
    }

    next_matching(&mut events, |e| matches!(e, SessionEvent::Disconnected)).await;
    wait_resynced(&mut events).await;

    assert_eq!(session.mux().cached("a").as_deref(), Some("1"));
    assert_eq!(session.mux().cached("b").as_deref(), Some("49"));
    assert_eq!(session.state().phase, ConnectionPhase::Connected);
    assert!(relay.stats().await.lagged_disconnects >= 1);
    assert!(relay.relay().broadcast_group().stats().await.messages_dropped >= 49);

    session.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_unread_connection_does_not_stall_others() {
    let relay = start_relay().await;
    let url = relay.url();

    // Connected but never reads a frame.
    let (_silent, _) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();

    let (writer, _events_w) = connect_session(&url, "Writer").await;
    let (b, _events_b) = connect_session(&url, "B").await;
    let (c, _events_c) = connect_session(&url, "C").await;

    let padding = "x".repeat(32 * 1024);
    for i in 0..20 {
        writer.send_update("k", &format!("{i}:{padding}"));
    }

    let last = format!("19:{padding}");
    wait_cached(&b, "k", &last).await;
    wait_cached(&c, "k", &last).await;

    writer.shutdown().await;
    relay.shutdown().await;
}
