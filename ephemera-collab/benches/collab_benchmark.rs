use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use ephemera_collab::channels::{ChannelGroup, Outbound};
use ephemera_collab::document::DocumentKey;
use ephemera_collab::engine::TextEngine;
use ephemera_collab::id::DocumentId;
use ephemera_collab::protocol::SyncFrame;
use ephemera_collab::storage::{RocksStore, Storage, StoreConfig, STATE_KEY};

fn bench_update_encode(c: &mut Criterion) {
    let frame = SyncFrame::Update(vec![0u8; 64]);

    c.bench_function("update_encode_64B", |b| {
        b.iter(|| {
            black_box(black_box(&frame).encode());
        })
    });
}

fn bench_update_decode(c: &mut Criterion) {
    let encoded = SyncFrame::Update(vec![0u8; 64]).encode();

    c.bench_function("update_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncFrame::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_document_id_generate(c: &mut Criterion) {
    c.bench_function("document_id_generate", |b| {
        b.iter(|| {
            black_box(DocumentId::generate());
        })
    });
}

fn bench_engine_local_inserts(c: &mut Criterion) {
    c.bench_function("engine_1000_local_inserts", |b| {
        b.iter(|| {
            let engine = TextEngine::new();
            for i in 0..1000u32 {
                black_box(engine.insert(i, "x"));
            }
        })
    });
}

fn bench_engine_merge_remote(c: &mut Criterion) {
    let source = TextEngine::new();
    let updates: Vec<Vec<u8>> = (0..1000u32).map(|i| source.insert(i, "y")).collect();

    c.bench_function("engine_merge_1000_remote_updates", |b| {
        b.iter(|| {
            let replica = TextEngine::new();
            for update in &updates {
                replica.apply_update(black_box(update)).unwrap();
            }
        })
    });
}

fn bench_engine_full_state_reload(c: &mut Criterion) {
    let engine = TextEngine::new();
    for _ in 0..500 {
        engine.push("lorem ipsum dolor sit amet ");
    }
    let state = engine.encode_full_state();

    c.bench_function("engine_reload_13KB_document", |b| {
        b.iter(|| {
            black_box(TextEngine::from_state(black_box(&state)).unwrap());
        })
    });
}

fn bench_broadcast_100_channels(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_update_100_channels", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = ChannelGroup::new();
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.attach().await);
                }

                let frame = Arc::new(SyncFrame::Update(vec![0u8; 64]).encode());
                let origin = receivers[0].0;
                let sent = group.broadcast(Outbound::Binary(frame), Some(origin)).await;
                black_box(sent);
            });
        })
    });
}

fn bench_store_state(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = DocumentKey::from_id(&DocumentId::generate());
    let state = vec![42u8; 4096];

    c.bench_function("store_state_4KB", |b| {
        b.iter(|| {
            store
                .put(black_box(doc), &[(STATE_KEY, state.as_slice())])
                .unwrap();
        })
    });
}

fn bench_load_state(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = RocksStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
    let doc = DocumentKey::from_id(&DocumentId::generate());
    store.put(doc, &[(STATE_KEY, vec![7u8; 4096].as_slice())]).unwrap();

    c.bench_function("load_state_4KB", |b| {
        b.iter(|| {
            black_box(store.get(black_box(doc), STATE_KEY).unwrap());
        })
    });
}

criterion_group!(
    protocol_benches,
    bench_update_encode,
    bench_update_decode,
    bench_document_id_generate,
);

criterion_group!(
    engine_benches,
    bench_engine_local_inserts,
    bench_engine_merge_remote,
    bench_engine_full_state_reload,
);

criterion_group!(channel_benches, bench_broadcast_100_channels);

criterion_group!(storage_benches, bench_store_state, bench_load_state);

criterion_main!(protocol_benches, engine_benches, channel_benches, storage_benches);
