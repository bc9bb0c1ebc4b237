use cellsync::broadcast::{BroadcastGroup, ConnectionId, Envelope};
use cellsync::mux::{SubscriptionMux, TopicHandle};
use cellsync::protocol::{now_millis, CellState, PeerInfo, SyncMessage, UpdatePayload};
use cellsync::publisher::{DebounceConfig, DebouncedPublisher, SendOutcome, UpdateSink};
use cellsync::store::StateStore;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use uuid::Uuid;

fn bench_update_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();

    c.bench_function("send_update_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::send_update(
                black_box(peer),
                black_box("portfolio.price"),
                black_box("101.25"),
                black_box(1),
            )
            .unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let msg = SyncMessage::send_update(Uuid::new_v4(), "portfolio.price", "101.25", now_millis()).unwrap();
    let encoded = msg.encode().unwrap();

    c.bench_function("send_update_decode", |b| {
        b.iter(|| {
            let msg = SyncMessage::decode(black_box(&encoded)).unwrap();
            black_box(msg.update().unwrap());
        })
    });
}

fn bench_all_state_encode_1000(c: &mut Criterion) {
    let cells: Vec<CellState> = (0..1000)
        .map(|i| CellState::new(format!("key.{i}"), i.to_string(), Some(Uuid::new_v4())))
        .collect();

    c.bench_function("all_state_encode_1000_keys", |b| {
        b.iter(|| black_box(SyncMessage::all_state(1, black_box(&cells)).unwrap().encode().unwrap()))
    });
}

fn bench_store_set_value(c: &mut Criterion) {
    let store = StateStore::new();
    let writer = Some(Uuid::new_v4());
    let keys: Vec<String> = (0..64).map(|i| format!("key.{i}")).collect();
    let mut n = 0usize;

    c.bench_function("store_set_value_64_keys", |b| {
        b.iter(|| {
            n = n.wrapping_add(1);
            black_box(store.set_value(&keys[n % keys.len()], "v", writer));
        })
    });
}

fn bench_store_get_all_1000(c: &mut Criterion) {
    let store = StateStore::new();
    for i in 0..1000 {
        store.set_value(&format!("key.{i}"), "v", None);
    }

    c.bench_function("store_get_all_1000_keys", |b| {
        b.iter(|| black_box(store.get_all()))
    });
}

fn bench_broadcast_fan_out(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let group = BroadcastGroup::new(1024);
    let origin = ConnectionId::new();

    // 100 sessions, receivers kept alive
    let _receivers: Vec<_> = rt.block_on(async {
        let mut receivers = Vec::new();
        for i in 0..100 {
            receivers.push(group.add_session(ConnectionId::new(), PeerInfo::new(format!("S{i}"))).await);
        }
        receivers
    });

    let event = SyncMessage::receive_update(
        origin.0,
        &UpdatePayload {
            key: "portfolio.price".into(),
            value: "101.25".into(),
            timestamp: 1,
        },
    )
    .unwrap();
    let bytes = event.encode().unwrap();

    c.bench_function("broadcast_fan_out_100_sessions", |b| {
        b.iter(|| {
            let envelope = Arc::new(Envelope {
                origin: Some(origin),
                bytes: bytes.clone(),
            });
            black_box(group.broadcast_raw(black_box(envelope)));
        })
    });
}

fn bench_mux_remote_update_and_drain(c: &mut Criterion) {
    let mux = SubscriptionMux::new();
    for i in 0..100u64 {
        mux.subscribe(TopicHandle(i), &format!("key.{}", i % 10)).unwrap();
    }
    let mut n = 0u64;

    c.bench_function("mux_update_drain_100_handles", |b| {
        b.iter(|| {
            n += 1;
            for k in 0..10 {
                mux.apply_remote_update(&format!("key.{k}"), &n.to_string());
            }
            black_box(mux.drain_refresh());
        })
    });
}

struct NullSink;

impl UpdateSink for NullSink {
    fn send_update(&self, _key: &str, _value: &str) -> SendOutcome {
        SendOutcome::Queued
    }
}

fn bench_publisher_suppressed_repeat(c: &mut Criterion) {
    let publisher = DebouncedPublisher::new(DebounceConfig::default(), Arc::new(NullSink));
    publisher.publish("k", "5");

    c.bench_function("publisher_suppressed_repeat", |b| {
        b.iter(|| black_box(publisher.publish(black_box("k"), black_box("5"))))
    });
}

criterion_group!(
    benches,
    bench_update_encode,
    bench_update_decode,
    bench_all_state_encode_1000,
    bench_store_set_value,
    bench_store_get_all_1000,
    bench_broadcast_fan_out,
    bench_mux_remote_update_and_drain,
    bench_publisher_suppressed_repeat,
);
criterion_main!(benches);
