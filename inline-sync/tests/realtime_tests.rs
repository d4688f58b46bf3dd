mod common;

use common::*;
use inline_sync::transport::mock::{MockServer, MockTransport};
use inline_sync::{
    BucketReport, BucketStore, ConnectionState, DisconnectReason, MemoryBucketStore,
    MemoryMessageStore, RealtimeConfig, RealtimeHandle, SqliteBucketStore, TokenCell,
    create_realtime,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use tokio::sync::mpsc;

struct Engine {
    realtime: RealtimeHandle,
    reports: mpsc::UnboundedReceiver<BucketReport>,
    server: MockServer,
    messages: MemoryMessageStore,
}

fn make_engine(fake: &FakeServer, store: Arc<dyn BucketStore>) -> Engine {
    let (transport, server) = MockTransport::pair();
    fake.attach(&server);
    let messages = MemoryMessageStore::new();
    let mut config = RealtimeConfig::default();
    config.sync.get_updates_limit = 5;

    let mut realtime = create_realtime(
        config,
        Arc::new(transport),
        Arc::new(TokenCell::new(Some("token".into()))),
        store,
        Arc::new(messages.clone()),
    );
    let reports = realtime.take_bucket_reports().expect("reports taken once");
    Engine {
        realtime,
        reports,
        server,
        messages,
    }
}

fn seqs(from: u64, to: u64) -> Vec<u64> {
    (from..=to).collect()
}

#[tokio::test(start_paused = true)]
async fn connect_catches_up_every_announced_bucket() {
    let fake = FakeServer::new();
    fake.add((1..=8).map(|seq| message_update(1, seq)));
    fake.add((1..=3).map(|seq| member_update(2, seq)));
    let store = MemoryBucketStore::new();
    let mut engine = make_engine(&fake, Arc::new(store.clone()));

    engine.realtime.start().unwrap();
    wait_synced(&mut engine.reports, chat(1), 8).await;

    assert_eq!(engine.messages.applied_seqs(chat(1)), seqs(1, 8));
    wait_until(|| engine.messages.applied_seqs(space(2)) == seqs(1, 3)).await;
    assert_eq!(store.cursor(chat(1)).map(|c| c.seq), Some(8));
    assert_eq!(fake.state_probes().len(), 1);
    assert!(store.last_sync_date().is_some());
    assert!(engine.realtime.snapshot().state.is_open());
}

#[tokio::test(start_paused = true)]
async fn live_pushes_apply_after_catch_up() {
    let fake = FakeServer::new();
    fake.add((1..=4).map(|seq| message_update(1, seq)));
    let mut engine = make_engine(&fake, Arc::new(MemoryBucketStore::new()));
    engine.realtime.start().unwrap();
    wait_synced(&mut engine.reports, chat(1), 4).await;

    let live = message_update(1, 5);
    fake.add([live.clone()]);
    assert!(engine.server.push(push_message(vec![live])));
    wait_synced(&mut engine.reports, chat(1), 5).await;

    assert_eq!(engine.messages.applied_seqs(chat(1)), seqs(1, 5));
    assert_eq!(fake.get_updates_calls().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn reconnect_catches_up_missed_updates() {
    let fake = FakeServer::new();
    fake.add((1..=4).map(|seq| message_update(1, seq)));
    let mut engine = make_engine(&fake, Arc::new(MemoryBucketStore::new()));
    engine.realtime.start().unwrap();
    wait_synced(&mut engine.reports, chat(1), 4).await;

    engine.server.disconnect("deploy");
    fake.add((5..=12).map(|seq| message_update(1, seq)));
    wait_synced(&mut engine.reports, chat(1), 12).await;

    assert_eq!(engine.messages.applied_seqs(chat(1)), seqs(1, 12));
    assert_eq!(fake.state_probes().len(), 2);
    assert_eq!(engine.server.open_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_and_shutdown() {
    let fake = FakeServer::new();
    let engine = make_engine(&fake, Arc::new(MemoryBucketStore::new()));
    let mut snapshots = engine.realtime.subscribe();
    engine.realtime.start().unwrap();
    loop {
        let snapshot = snapshots.recv().await.unwrap();
        if snapshot.state.is_open() {
            break;
        }
    }

    engine.realtime.stop().unwrap();
    engine.realtime.shutdown().await.unwrap();

    let states: Vec<ConnectionState> = std::iter::from_fn(|| snapshots.try_recv())
        .map(|s| s.state)
        .collect();
    assert_eq!(
        states.last(),
        Some(&ConnectionState::Disconnected(DisconnectReason::Stopped))
    );
    assert!(!engine.server.is_connected());
}

#[tokio::test]
async fn persisted_cursors_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sync.db");
    let fake = FakeServer::new();
    fake.add((1..=5).map(|seq| message_update(1, seq)));

    {
        let store = SqliteBucketStore::open(&path).unwrap();
        let mut engine = make_engine(&fake, Arc::new(store));
        engine.realtime.start().unwrap();
        wait_synced(&mut engine.reports, chat(1), 5).await;
        engine.realtime.shutdown().await.unwrap();
    }

    fake.add((6..=7).map(|seq| message_update(1, seq)));
    let store = SqliteBucketStore::open(&path).unwrap();
    let mut engine = make_engine(&fake, Arc::new(store));
    engine.realtime.start().unwrap();
    wait_synced(&mut engine.reports, chat(1), 7).await;

    assert_eq!(engine.messages.applied_seqs(chat(1)), vec![6, 7]);
    assert_eq!(fake.get_updates_calls().last(), Some(&(chat(1), 5, None)));
    engine.realtime.shutdown().await.unwrap();
}
