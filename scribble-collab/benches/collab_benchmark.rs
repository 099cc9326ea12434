use criterion::{criterion_group, criterion_main, Criterion};
use scribble_collab::awareness::{AwarenessChannel, AwarenessFields, CursorThrottle, UserProfile};
use scribble_collab::broadcast::{PeerChannels, PeerSet};
use scribble_collab::document::{Document, GroupToken, Operation, Origin, ReplicatedDocument, Stamp, Transaction};
use scribble_collab::element::{Element, Shape, Style, Vec2};
use scribble_collab::persistence::codec::{decode_document, encode_document};
use scribble_collab::persistence::{RocksBackend, SnapshotBackend, StoreConfig};
use scribble_collab::protocol::{ClientMessage, ServerMessage};
use scribble_collab::undo::{UndoConfig, UndoManager};
use scribble_collab::OfflineQueue;
use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

fn rect(i: usize) -> Element {
    Element::new(
        Shape::Rectangle { origin: Vec2::new(i as f32, i as f32), width: 40.0, height: 20.0 },
        Style::default(),
    )
}

fn freehand(points: usize) -> Element {
    let points = (0..points).map(|i| Vec2::new(i as f32, (i as f32).sin() * 10.0)).collect();
    Element::new(Shape::Freehand { points }, Style::new("#222222", 2.0))
}

/// A board with `n` rectangles and a few long strokes.
fn board(n: usize) -> Document {
    let mut replica = ReplicatedDocument::new(Uuid::new_v4());
    let mut ops: Vec<Operation> = (0..n).map(|i| Operation::insert(rect(i))).collect();
    ops.extend((0..10).map(|_| Operation::insert(freehand(200))));
    let tx = replica.transaction(Origin::Local, GroupToken::default(), ops);
    replica.apply(tx).unwrap();
    replica.snapshot()
}

fn bench_apply_local_insert(c: &mut Criterion) {
    c.bench_function("apply_local_insert", |b| {
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let mut i = 0;
        b.iter(|| {
            let tx = replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::insert(rect(i))]);
            black_box(replica.apply(tx).unwrap());
            i += 1;
        })
    });
}

fn bench_apply_remote_conflict(c: &mut Criterion) {
    let base = rect(0);
    let remote = Uuid::new_v4();

    c.bench_function("apply_remote_update_lww", |b| {
        let mut replica = ReplicatedDocument::new(Uuid::new_v4());
        let tx = replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::insert(base.clone())]);
        replica.apply(tx).unwrap();
        let mut clock = 1;
        b.iter(|| {
            clock += 1;
            let moved = base.translated(Vec2::new(clock as f32, 0.0));
            let tx = Transaction::new(
                Stamp::new(clock, remote),
                Origin::Remote,
                GroupToken::default(),
                vec![Operation::update(moved)],
            );
            black_box(replica.apply(black_box(tx)).unwrap());
        })
    });
}

fn bench_apply_stale_remote(c: &mut Criterion) {
    let base = rect(0);
    let mut replica = ReplicatedDocument::new(Uuid::new_v4());
    for _ in 0..100 {
        let tx = replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::update(base.clone())]);
        replica.apply(tx).unwrap();
    }
    let stale = Transaction::new(
        Stamp::new(1, Uuid::nil()),
        Origin::Remote,
        GroupToken::default(),
        vec![Operation::update(base.translated(Vec2::new(5.0, 5.0)))],
    );

    c.bench_function("apply_remote_stale", |b| {
        b.iter(|| black_box(replica.apply(black_box(stale.clone())).unwrap()))
    });
}

fn bench_undo_redo(c: &mut Criterion) {
    c.bench_function("undo_redo_100_frames", |b| {
        b.iter(|| {
            let mut replica = ReplicatedDocument::new(Uuid::new_v4());
            let mut undo = UndoManager::new(UndoConfig::default());
            for i in 0..100 {
                let tx = replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::insert(rect(i))]);
                undo.apply(&mut replica, tx).unwrap();
                undo.boundary();
            }
            while undo.undo(&mut replica).unwrap().is_some() {}
            while undo.redo(&mut replica).unwrap().is_some() {}
            black_box(replica.document().len());
        })
    });
}

fn bench_snapshot_encode(c: &mut Criterion) {
    let doc = board(1000);
    c.bench_function("snapshot_encode_1000_elements", |b| {
        b.iter(|| black_box(encode_document(black_box(&doc)).unwrap()))
    });
}

fn bench_snapshot_decode(c: &mut Criterion) {
    let blob = encode_document(&board(1000)).unwrap();
    c.bench_function("snapshot_decode_1000_elements", |b| {
        b.iter(|| black_box(decode_document("BENCH", black_box(&blob)).unwrap()))
    });
}

fn bench_transaction_frame(c: &mut Criterion) {
    let mut replica = ReplicatedDocument::new(Uuid::new_v4());
    let tx = replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::insert(freehand(100))]);

    c.bench_function("transaction_frame_encode", |b| {
        b.iter(|| black_box(ClientMessage::Transaction(black_box(tx.clone())).encode().unwrap()))
    });

    let frame = ServerMessage::Transaction(tx).encode().unwrap();
    c.bench_function("transaction_frame_decode", |b| {
        b.iter(|| black_box(ServerMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_fanout_100_peers(c: &mut Criterion) {
    c.bench_function("fanout_100_peers", |b| {
        let mut peers = PeerSet::new();
        let mut receivers = Vec::new();
        for i in 0..100 {
            let (channels, rx, close) = PeerChannels::new(1024);
            let profile = UserProfile::guest(Uuid::new_v4());
            peers.add(Uuid::new_v4(), format!("user{i}"), profile, channels);
            receivers.push((rx, close));
        }
        let frame = Arc::new(vec![0u8; 128]);

        b.iter(|| {
            black_box(peers.broadcast(frame.clone(), None));
            // Keep queues from filling up.
            for (rx, _) in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
        })
    });
}

fn bench_awareness_set_local(c: &mut Criterion) {
    let mut channel = AwarenessChannel::new();
    let me = Uuid::new_v4();
    channel.register(me, Some("bench".into()), UserProfile::guest(me));

    c.bench_function("awareness_set_local_cursor", |b| {
        let mut x = 0.0f32;
        b.iter(|| {
            x += 1.0;
            black_box(channel.set_local(me, AwarenessFields::cursor(Some(Vec2::new(x, x)))));
        })
    });
}

fn bench_cursor_throttle(c: &mut Criterion) {
    c.bench_function("cursor_throttle_offer", |b| {
        let mut throttle = CursorThrottle::new(Duration::from_millis(33));
        let start = Instant::now();
        let mut tick = 0u64;
        b.iter(|| {
            tick += 1;
            let now = start + Duration::from_millis(tick);
            black_box(throttle.offer(Some(Vec2::new(tick as f32, 0.0)), now));
        })
    });
}

fn bench_offline_queue(c: &mut Criterion) {
    let mut replica = ReplicatedDocument::new(Uuid::new_v4());
    let txs: Vec<Transaction> = (0..1000)
        .map(|i| replica.transaction(Origin::Local, GroupToken::default(), vec![Operation::insert(rect(i))]))
        .collect();

    c.bench_function("offline_queue_1000", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for tx in &txs {
                queue.enqueue(tx.clone());
            }
            black_box(queue.drain());
        })
    });
}

fn bench_rocks_put(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = std::env::temp_dir().join(format!("scribble_bench_put_{}", Uuid::new_v4()));
    let backend = RocksBackend::open(StoreConfig::for_testing(dir.clone())).unwrap();
    let blob = encode_document(&board(200)).unwrap();

    c.bench_function("rocks_put_snapshot_200_elements", |b| {
        b.iter(|| {
            rt.block_on(backend.put("BENCH", black_box(blob.clone()))).unwrap();
        })
    });

    c.bench_function("rocks_get_snapshot_200_elements", |b| {
        b.iter(|| black_box(rt.block_on(backend.get("BENCH")).unwrap()))
    });

    drop(backend);
    let _ = std::fs::remove_dir_all(&dir);
}

criterion_group!(
    benches,
    bench_apply_local_insert,
    bench_apply_remote_conflict,
    bench_apply_stale_remote,
    bench_undo_redo,
    bench_snapshot_encode,
    bench_snapshot_decode,
    bench_transaction_frame,
    bench_fanout_100_peers,
    bench_awareness_set_local,
    bench_cursor_throttle,
    bench_offline_queue,
    bench_rocks_put,
);
criterion_main!(benches);
