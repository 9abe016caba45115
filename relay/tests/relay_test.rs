//! End-to-end tests: real replicas synchronizing through a live relay
//! over real sockets.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ferry_engine::{
    wire::{self, Frame},
    ChangeEntry, FieldMap, GlobalId, Replica, SyncOptions, SyncStatus, Synchronizer, TableDef,
    TableRegistry,
};
use ferry_relay::config::Config;
use ferry_relay::dataset::DatasetHub;
use ferry_relay::{app, AppState};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};

fn test_registry() -> TableRegistry {
    TableRegistry::new().with_table(TableDef::entity("notes"))
}

fn new_replica() -> Arc<Mutex<Replica>> {
    Arc::new(Mutex::new(
        Replica::open_in_memory(test_registry()).unwrap(),
    ))
}

fn lock(replica: &Arc<Mutex<Replica>>) -> MutexGuard<'_, Replica> {
    replica.lock().unwrap()
}

fn fields(value: serde_json::Value) -> FieldMap {
    value.as_object().unwrap().clone()
}

/// Start a relay on an ephemeral port; returns the sync endpoint URL.
async fn spawn_relay(auth_secret: Option<&str>) -> String {
    let config = Config {
        host: "127.0.0.1".to_string(),
        port: 0,
        data_dir: std::env::temp_dir(),
        auth_secret: auth_secret.map(String::from),
    };
    let state = AppState {
        config: Arc::new(config),
        hub: Arc::new(DatasetHub::in_memory()),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });

    format!("ws://{addr}/sync/ws")
}

/// Poll until `check` passes or a generous deadline expires.
async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn insert_replicates_through_relay_catch_up() {
    let endpoint = spawn_relay(None).await;

    // Replica A writes while "offline", then connects and uploads.
    let a = new_replica();
    let target = {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        let target = w.insert("notes", fields(json!({"value": 42})), 100.0).unwrap();
        w.commit().unwrap();
        target
    };
    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "inbox"));
    wait_for("relay ack for A's entry", || {
        lock(&a).unsynchronized().unwrap().is_empty()
    })
    .await;

    // Replica B connects fresh and catches up.
    let b = new_replica();
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "inbox"));
    wait_for("B to receive the record", || {
        lock(&b).get("notes", target).unwrap().is_some()
    })
    .await;

    let value = lock(&b).get("notes", target).unwrap().unwrap();
    assert_eq!(value, fields(json!({"value": 42})));

    sync_a.shutdown().await;
    sync_b.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_other_replicas_never_the_sender() {
    let endpoint = spawn_relay(None).await;

    let a = new_replica();
    let b = new_replica();
    let c = new_replica();

    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "team"));
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "team"));
    let sync_c = Synchronizer::spawn(c.clone(), SyncOptions::new(&endpoint, "team"));
    sync_a.wait_until(SyncStatus::Streaming).await;
    sync_b.wait_until(SyncStatus::Streaming).await;
    sync_c.wait_until(SyncStatus::Streaming).await;

    let mut c_stream = lock(&c).subscribe();

    // C originates an insert.
    let target = {
        let mut guard = lock(&c);
        let mut w = guard.begin_write().unwrap();
        let target = w.insert("notes", fields(json!({"from": "c"})), 100.0).unwrap();
        w.commit().unwrap();
        target
    };

    wait_for("A to receive C's insert", || {
        lock(&a).get("notes", target).unwrap().is_some()
    })
    .await;
    wait_for("B to receive C's insert", || {
        lock(&b).get("notes", target).unwrap().is_some()
    })
    .await;

    // C saw its own commit once, locally, and nothing echoed back.
    let first = c_stream.try_recv().expect("local commit notification");
    assert_eq!(first.entries.len(), 1);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(
        c_stream.try_recv().is_none(),
        "relay echoed the entry back to its sender"
    );
    assert_eq!(lock(&c).log_len().unwrap(), 1);

    sync_a.shutdown().await;
    sync_b.shutdown().await;
    sync_c.shutdown().await;
}

#[tokio::test]
async fn conflict_exchange_converges_to_newest_timestamp() {
    let endpoint = spawn_relay(None).await;

    let a = new_replica();
    let b = new_replica();

    // Seed both replicas with the record.
    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "docs"));
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "docs"));
    let target = {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        let target = w.insert("notes", fields(json!({"value": 42})), 100.0).unwrap();
        w.commit().unwrap();
        target
    };
    wait_for("B to receive the record", || {
        lock(&b).get("notes", target).unwrap().is_some()
    })
    .await;

    // Both go offline and edit concurrently.
    sync_a.shutdown().await;
    sync_b.shutdown().await;
    {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        w.update("notes", target, fields(json!({"value": 84})), 200.0).unwrap();
        w.commit().unwrap();
    }
    {
        let mut guard = lock(&b);
        let mut w = guard.begin_write().unwrap();
        w.update("notes", target, fields(json!({"value": 99})), 150.0).unwrap();
        w.commit().unwrap();
    }

    // Reconnect; both entries exchange and t=200 wins everywhere.
    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "docs"));
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "docs"));

    let converged = |replica: &Arc<Mutex<Replica>>| {
        lock(replica).get("notes", target).unwrap()
            == Some(fields(json!({"value": 84})))
    };
    wait_for("A to converge", || converged(&a)).await;
    wait_for("B to converge", || converged(&b)).await;

    sync_a.shutdown().await;
    sync_b.shutdown().await;
}

#[tokio::test]
async fn offline_delete_wins_on_reconnect() {
    let endpoint = spawn_relay(None).await;

    let a = new_replica();
    let b = new_replica();

    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "trash"));
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "trash"));
    let target = {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        let target = w.insert("notes", fields(json!({"value": 1})), 100.0).unwrap();
        w.commit().unwrap();
        target
    };
    wait_for("B to receive the record", || {
        lock(&b).get("notes", target).unwrap().is_some()
    })
    .await;

    // B edits offline; A deletes.
    sync_b.shutdown().await;
    {
        let mut guard = lock(&b);
        let mut w = guard.begin_write().unwrap();
        w.update("notes", target, fields(json!({"value": 7})), 250.0).unwrap();
        w.commit().unwrap();
    }
    {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        w.delete("notes", target, 300.0).unwrap();
        w.commit().unwrap();
    }
    wait_for("relay ack for the delete", || {
        lock(&a).unsynchronized().unwrap().is_empty()
    })
    .await;

    // B comes back online: its stale edit is acked but the record goes.
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "trash"));
    wait_for("B to apply the tombstone", || {
        lock(&b).get("notes", target).unwrap().is_none()
    })
    .await;
    wait_for("B's stale edit to be acked", || {
        lock(&b).unsynchronized().unwrap().is_empty()
    })
    .await;

    sync_a.shutdown().await;
    sync_b.shutdown().await;
}

#[tokio::test]
async fn redelivered_upload_is_acked_again_but_broadcast_once() {
    let endpoint = spawn_relay(None).await;

    // Two raw protocol clients against the same dataset.
    let (mut sender, _) = connect_async(format!("{endpoint}?dataset=raw")).await.unwrap();
    let (mut observer, _) = connect_async(format!("{endpoint}?dataset=raw")).await.unwrap();

    let entry = ChangeEntry::insert("notes", GlobalId::random(), fields(json!({"v": 1})), 100.0);
    let upload = wire::encode(&Frame::Changes(vec![entry.clone()]));

    // First delivery: sender gets an ack, observer gets the broadcast.
    sender.send(Message::Binary(upload.clone())).await.unwrap();

    let ack = expect_binary(&mut sender).await;
    assert_eq!(
        wire::decode(&ack).unwrap(),
        Frame::Ack(vec![entry.global_id])
    );
    let broadcast = expect_binary(&mut observer).await;
    let Frame::Changes(received) = wire::decode(&broadcast).unwrap() else {
        panic!("expected changes frame");
    };
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].global_id, entry.global_id);

    // Redelivery: acked again, but nothing is rebroadcast.
    sender.send(Message::Binary(upload)).await.unwrap();
    let ack = expect_binary(&mut sender).await;
    assert_eq!(
        wire::decode(&ack).unwrap(),
        Frame::Ack(vec![entry.global_id])
    );
    let silent = tokio::time::timeout(Duration::from_millis(300), observer.next()).await;
    assert!(silent.is_err(), "duplicate delivery must not be rebroadcast");
}

async fn expect_binary<S>(socket: &mut S) -> bytes::Bytes
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let message = tokio::time::timeout(Duration::from_secs(5), socket.next())
        .await
        .expect("timed out waiting for frame")
        .expect("socket closed")
        .expect("socket error");
    match message {
        Message::Binary(payload) => payload,
        other => panic!("expected binary frame, got {other:?}"),
    }
}

#[tokio::test]
async fn datasets_do_not_cross_talk() {
    let endpoint = spawn_relay(None).await;

    let a = new_replica();
    let b = new_replica();
    let sync_a = Synchronizer::spawn(a.clone(), SyncOptions::new(&endpoint, "alpha"));
    let sync_b = Synchronizer::spawn(b.clone(), SyncOptions::new(&endpoint, "beta"));
    sync_a.wait_until(SyncStatus::Streaming).await;
    sync_b.wait_until(SyncStatus::Streaming).await;

    {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        w.insert("notes", fields(json!({"value": 1})), 100.0).unwrap();
        w.commit().unwrap();
    }
    wait_for("alpha upload to be acked", || {
        lock(&a).unsynchronized().unwrap().is_empty()
    })
    .await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(lock(&b).count("notes").unwrap(), 0, "beta saw alpha's entry");

    sync_a.shutdown().await;
    sync_b.shutdown().await;
}

#[tokio::test]
async fn relay_requires_matching_token() {
    let endpoint = spawn_relay(Some("sekrit")).await;

    // Anonymous handshake is refused outright.
    assert!(
        connect_async(format!("{endpoint}?dataset=locked")).await.is_err(),
        "handshake should fail without a token"
    );

    // A replica presenting the secret connects and streams.
    let a = new_replica();
    let sync_a = Synchronizer::spawn(
        a.clone(),
        SyncOptions::new(&endpoint, "locked").with_token("sekrit"),
    );
    sync_a.wait_until(SyncStatus::Streaming).await;
    sync_a.shutdown().await;
}

#[tokio::test]
async fn local_writes_never_block_while_disconnected() {
    // Endpoint nobody listens on; the synchronizer stays in its
    // reconnect loop while local writes proceed and queue.
    let a = new_replica();
    let sync_a = Synchronizer::spawn(
        a.clone(),
        SyncOptions::new("ws://127.0.0.1:9/sync/ws", "offline"),
    );

    {
        let mut guard = lock(&a);
        let mut w = guard.begin_write().unwrap();
        w.insert("notes", fields(json!({"value": 1})), 100.0).unwrap();
        w.commit().unwrap();
    }

    assert_eq!(lock(&a).unsynchronized().unwrap().len(), 1);
    assert_ne!(*sync_a.status().borrow(), SyncStatus::Streaming);

    sync_a.shutdown().await;
}
