use redisque::message::{self, Payload};
use redisque::storage::{Batch, Store};
use redisque::{
    ErrorKind, MemoryStore, Priority, QueueManager, QueueOptions, ReclaimOptions, TransferRecord,
};
use serde_json::{Value, json};
use std::sync::Arc;

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("not an object"),
    }
}

fn setup() -> (MemoryStore, QueueManager) {
    let store = MemoryStore::new();
    let manager = QueueManager::new(Arc::new(store.clone()));
    (store, manager)
}

#[tokio::test]
async fn end_to_end_push_shift_confirm() {
    let (_, manager) = setup();
    let q = manager
        .new_queue(
            QueueOptions::new("Q")
                .priority(Priority::Normal)
                .expire(3600),
        )
        .await
        .unwrap();

    q.push(payload(json!({"a": 1})), 0).await.unwrap();
    q.push(payload(json!({"a": 2})), 0).await.unwrap();

    let msg = q.shift().await.unwrap().unwrap();
    assert_eq!(msg, payload(json!({"a": 1})));
    assert_eq!(manager.pending_len(Priority::Normal).await.unwrap(), 1);

    assert!(q.confirm(true, payload(json!({"a": 1}))).await.unwrap());
    assert_eq!(manager.pending_len(Priority::Normal).await.unwrap(), 0);
    assert_eq!(manager.len("Q").await.unwrap(), 1);
}

#[tokio::test]
async fn sorted_queue_orders_by_weight_then_insertion() {
    let (_, manager) = setup();
    let q = manager
        .new_queue(QueueOptions::new("ranked").sorted(true))
        .await
        .unwrap();

    let weights = [3, 70, 15, 70, 99, 0, 15];
    for (i, weight) in weights.iter().enumerate() {
        q.add(payload(json!({"i": i, "w": weight})), *weight)
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    while let Some(msg) = q.shift().await.unwrap() {
        seen.push((msg["w"].as_i64().unwrap(), msg["i"].as_i64().unwrap()));
    }

    let mut expected: Vec<(i64, i64)> = weights
        .iter()
        .enumerate()
        .map(|(i, w)| (*w, i as i64))
        .collect();
    expected.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn len_tracks_pushes_minus_pops() {
    let (_, manager) = setup();
    let q = manager.new_queue(QueueOptions::new("count")).await.unwrap();

    let mut pushes = 0u64;
    let mut pops = 0u64;
    for round in 0..10 {
        q.add(payload(json!({ "round": round })), 0).await.unwrap();
        pushes += 1;
        if round % 3 == 0 && q.pop().await.unwrap().is_some() {
            pops += 1;
        }
        assert_eq!(q.len().await.unwrap(), pushes - pops);
    }
}

#[tokio::test]
async fn failed_shift_never_loses_the_message() {
    let (store, manager) = setup();
    for sorted in [false, true] {
        let name = format!("safe-{}", sorted);
        let q = manager
            .new_queue(QueueOptions::new(&name).sorted(sorted))
            .await
            .unwrap();
        q.push(payload(json!({"keep": sorted})), 0).await.unwrap();

        store.fail_next_batches(1);
        let err = q.shift().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueMessageTransferFailed);
        assert_eq!(q.len().await.unwrap(), 1);

        let msg = q.shift().await.unwrap().unwrap();
        assert_eq!(msg["keep"], sorted);
        assert!(q.confirm(true, &msg).await.unwrap());
    }
}

#[tokio::test]
async fn failed_confirm_pushes_message_back() {
    let (store, manager) = setup();
    let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
    q.push(payload(json!({"a": 1})), 0).await.unwrap();
    q.push(payload(json!({"a": 2})), 0).await.unwrap();

    let msg = q.shift().await.unwrap().unwrap();
    let before = q.len().await.unwrap();

    store.fail_next_batches(1);
    let err = q.confirm(true, &msg).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::QueueMessageConfirmFailed);
    assert_eq!(q.len().await.unwrap(), before + 1);
}

#[tokio::test]
async fn concurrent_sweeps_exclude_each_other() {
    let (_, manager) = setup();
    let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
    for n in 0..5 {
        q.push(payload(json!({ "n": n })), 0).await.unwrap();
    }
    while q.shift().await.unwrap().is_some() {}

    let first = ReclaimOptions::new(Priority::Normal).with_machine_id("host-1");
    let second = ReclaimOptions::new(Priority::Normal).with_machine_id("host-2");

    // hold the lock the way a running sweep does
    let grant = manager
        .lock()
        .acquire_lock(
            redisque::RECLAIM_OPERATION,
            "0",
            redisque::machine_uid("host-1"),
            first.effective_window(),
        )
        .await
        .unwrap();
    assert!(grant.is_acquired());

    let err = manager.reclaim_pending(&second).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ClientLockFail);
    assert_eq!(q.len().await.unwrap(), 0);

    // the holder itself may proceed
    assert_eq!(manager.reclaim_pending(&first).await.unwrap(), 5);
    assert_eq!(q.len().await.unwrap(), 5);
    assert_eq!(q.pending_len().await.unwrap(), 0);
}

#[tokio::test]
async fn parallel_sweeps_reclaim_each_message_once() {
    let (_, manager) = setup();
    let q = manager.new_queue(QueueOptions::new("Q")).await.unwrap();
    for n in 0..8 {
        q.push(payload(json!({ "n": n })), 0).await.unwrap();
    }
    while q.shift().await.unwrap().is_some() {}

    let a = manager.clone();
    let b = manager.clone();
    let (ra, rb) = tokio::join!(
        async move {
            a.reclaim_pending(&ReclaimOptions::new(Priority::Normal).with_machine_id("host-1"))
                .await
        },
        async move {
            b.reclaim_pending(&ReclaimOptions::new(Priority::Normal).with_machine_id("host-2"))
                .await
        },
    );

    let total = ra.as_ref().map(|n| *n).unwrap_or(0) + rb.as_ref().map(|n| *n).unwrap_or(0);
    assert_eq!(total, 8);
    assert_eq!(q.len().await.unwrap(), 8);
    for result in [ra, rb] {
        if let Err(err) = result {
            assert_eq!(err.kind(), ErrorKind::ClientLockFail);
        }
    }
}

#[tokio::test]
async fn sweep_collects_expired_and_orphaned_entries() {
    let (store, manager) = setup();
    let live = manager.new_queue(QueueOptions::new("live")).await.unwrap();
    let doomed = manager.new_queue(QueueOptions::new("doomed")).await.unwrap();

    // expired while pending
    let mut envelope = message::wrap(payload(json!({"stale": true})), 0, 60);
    envelope.expire_at = 1;
    let record = TransferRecord::new("live", envelope);
    let mut batch = Batch::new();
    batch
        .zadd(manager.keys().transfer_queue(Priority::Normal), 1.0, record.fingerprint())
        .hset(
            manager.keys().transfer_table(Priority::Normal),
            record.fingerprint(),
            record.to_json(),
        );
    store.exec(&batch).await.unwrap();

    // pending on a queue that is then deleted
    doomed.push(payload(json!({"d": 1})), 0).await.unwrap();
    doomed.shift().await.unwrap().unwrap();
    assert!(doomed.delete().await.unwrap());

    // still valid
    live.push(payload(json!({"ok": 1})), 0).await.unwrap();
    live.shift().await.unwrap().unwrap();

    let reclaimed = manager
        .reclaim_pending(&ReclaimOptions::new(Priority::Normal).with_machine_id("host-1"))
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);
    assert_eq!(live.len().await.unwrap(), 1);
    assert_eq!(manager.pending_len(Priority::Normal).await.unwrap(), 0);
    assert!(!manager.queue_exists("doomed").await.unwrap());
}

#[tokio::test]
async fn wire_format_is_readable_by_other_tooling() {
    let (store, manager) = setup();
    let q = manager
        .new_queue(QueueOptions::new("wire").sorted(true))
        .await
        .unwrap();
    q.add(payload(json!({"x": "y"})), 42).await.unwrap();

    let (raw, score) = store.zfirst(q.key()).await.unwrap().unwrap();
    let value: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["queMsgItem"], json!({"x": "y"}));
    assert_eq!(value["queMsgWeight"].as_f64().unwrap(), score);
    assert_eq!(value["queMsgExpire"], 0);
    assert!(score >= 58e8 && score < 59e8);

    let registry = store
        .hgetall(&manager.keys().registry())
        .await
        .unwrap();
    assert_eq!(registry["wire"], "Redisque-RedisQueue|wire|issort|0");
}
