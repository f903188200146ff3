use super::*;

#[tokio::test]
async fn hash_set_get_roundtrip() {
    let store = Store::in_memory().await;

    store.hash_set("iad:a1", "state", "connected").await.unwrap();
    store.hash_set("iad:a1", "name", "Test").await.unwrap();

    let state = store.hash_get("iad:a1", "state").await.unwrap();
    assert_eq!(state.as_deref(), Some(b"connected".as_slice()));

    let all = store.hash_get_all("iad:a1").await.unwrap();
    assert_eq!(all.len(), 2);

    let removed = store.hash_del("iad:a1", &["state", "missing"]).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(store.hash_get("iad:a1", "state").await.unwrap(), None);
}

#[tokio::test]
async fn prefix_applies_to_all_keys() {
    let store = Store::open(Params {
        prefix: "mailsync".to_string(),
        snapshot_path: None,
    })
    .await
    .unwrap();

    store.set_add("accounts", "a1").await.unwrap();

    let keys = store.scan_keys().await.unwrap();
    assert_eq!(keys, vec![("mailsync:accounts".to_string(), "set")]);
}

#[tokio::test]
async fn sorted_set_pops_lowest_score_with_member_tie_break() {
    let store = Store::in_memory().await;

    store
        .with_txn(|txn| {
            txn.zset_add("pending", "job-b", 10);
            txn.zset_add("pending", "job-a", 10);
            txn.zset_add("pending", "job-c", 5);
            txn.zset_add("pending", "job-late", 1000);
        })
        .await
        .unwrap();

    let popped = store
        .with_txn(|txn| {
            let mut out = Vec::new();
            while let Some((member, _)) = txn.zset_pop_min_at_most("pending", 100) {
                out.push(member);
            }
            out
        })
        .await
        .unwrap();

    assert_eq!(popped, vec!["job-c", "job-a", "job-b"]);

    let remaining = store.with_txn(|txn| txn.zset_len("pending")).await.unwrap();
    assert_eq!(remaining, 1);
}

#[tokio::test]
async fn list_push_capped_keeps_newest_entries() {
    let store = Store::in_memory().await;

    for n in 0..5u8 {
        store
            .list_push_capped("iah:a1", vec![n], 3)
            .await
            .unwrap();
    }

    let entries = store.list_range("iah:a1").await.unwrap();
    assert_eq!(entries, vec![vec![4], vec![3], vec![2]]);
}

#[tokio::test]
async fn counters_are_monotonic() {
    let store = Store::in_memory().await;

    assert_eq!(store.incr("bull:notify:id").await.unwrap(), 1);
    assert_eq!(store.incr("bull:notify:id").await.unwrap(), 2);
    assert_eq!(store.incr("bull:submit:id").await.unwrap(), 1);
}

#[tokio::test]
async fn expired_keys_are_purged_on_access() {
    let store = Store::in_memory().await;

    store.hash_set("stats:old", "0000", "1").await.unwrap();
    store
        .expire_at("stats:old", chrono::Utc::now().timestamp_millis() - 1)
        .await
        .unwrap();

    assert_eq!(store.hash_get("stats:old", "0000").await.unwrap(), None);
    assert!(store.scan_keys().await.unwrap().is_empty());
}

#[tokio::test]
async fn snapshot_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.mp");

    {
        let store = Store::open(Params {
            prefix: String::new(),
            snapshot_path: Some(path.clone()),
        })
        .await
        .unwrap();
        store.hash_set("iad:a1", "state", "connected").await.unwrap();
        store.set_add("accounts", "a1").await.unwrap();
        store.incr("bull:notify:id").await.unwrap();
    }

    let reopened = Store::open(Params {
        prefix: String::new(),
        snapshot_path: Some(path),
    })
    .await
    .unwrap();

    let state = reopened.hash_get("iad:a1", "state").await.unwrap();
    assert_eq!(state.as_deref(), Some(b"connected".as_slice()));
    assert_eq!(reopened.set_members("accounts").await.unwrap(), vec!["a1"]);
    assert_eq!(reopened.incr("bull:notify:id").await.unwrap(), 2);
}

#[tokio::test]
async fn pubsub_delivers_to_subscribers() {
    let store = Store::in_memory().await;

    let mut rx = store.subscribe("control");
    store.publish("control", b"{\"cmd\":\"new\"}".to_vec());

    let payload = rx.recv().await.unwrap();
    assert_eq!(payload, b"{\"cmd\":\"new\"}".to_vec());
}
