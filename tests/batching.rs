use confman::model::ValueType;
use confman::test_utils::{TestCluster, TestClusterOptions};
use std::sync::Arc;
use std::time::Duration;

/// 100 concurrent writes with a widened batch window: every write
/// succeeds, per-key versions are contiguous in submission order, and the
/// log stays far shorter than one entry per write.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_coalesce_into_batches() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            batch_max_size: 50,
            batch_max_wait_ms: 20,
            ..TestClusterOptions::default()
        },
    )
    .await
    .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);
    let baseline = node.status().last_index;

    let mut tasks = Vec::new();
    for key_no in 0..10 {
        let node = Arc::clone(&node);
        tasks.push(tokio::spawn(async move {
            // Sequential writes within one task pin the per-key order.
            for seq in 1..=10u64 {
                node.put_config(
                    "load",
                    &format!("key-{key_no}"),
                    format!("value-{seq}").into_bytes(),
                    ValueType::String,
                    "writer",
                )
                .await
                .unwrap();
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    for key_no in 0..10 {
        let (entry, value, _) = node
            .get_config("load", &format!("key-{key_no}"))
            .await
            .unwrap();
        assert_eq!(entry.version, 10, "key-{key_no} missed writes");
        assert_eq!(value, b"value-10");
    }

    // 100 commands in well under 100 entries proves coalescing happened.
    let entries_used = node.status().last_index - baseline;
    assert!(
        entries_used < 100,
        "expected batching, got {entries_used} log entries for 100 writes"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_order_matches_enqueue_order_for_one_key() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            batch_max_wait_ms: 10,
            ..TestClusterOptions::default()
        },
    )
    .await
    .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    // A burst against one key. join_all polls the futures in creation
    // order, so the proposer's FIFO sees the writes in sequence while the
    // commits themselves still coalesce.
    let writes: Vec<_> = (1..=20u64)
        .map(|seq| {
            let node = Arc::clone(&node);
            async move {
                node.put_config(
                    "seq",
                    "counter",
                    format!("{seq}").into_bytes(),
                    ValueType::Integer,
                    "writer",
                )
                .await
            }
        })
        .collect();
    for result in futures::future::join_all(writes).await {
        result.unwrap();
    }

    let (entry, value, _) = node.get_config("seq", "counter").await.unwrap();
    assert_eq!(entry.version, 20);
    assert_eq!(value, b"20");
}
