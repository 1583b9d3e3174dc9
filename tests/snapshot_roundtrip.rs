use confman::model::ValueType;
use confman::test_utils::{TestCluster, TestClusterOptions};
use std::time::Duration;

/// Single-node cluster with aggressive snapshotting: stop it after many
/// writes and verify a restart rebuilds the identical materialized state
/// from snapshot plus log tail.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_recovers_from_snapshot_and_log_tail() {
    let root = tempfile::tempdir().unwrap();
    let options = TestClusterOptions {
        nodes: 1,
        snapshot_interval: 8,
        ..TestClusterOptions::default()
    };
    let mut cluster = TestCluster::start(root.path(), options).await.unwrap();
    cluster.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    let node = cluster.node(0);

    node.put_namespace("prod", "production", "platform", "init")
        .await
        .unwrap();
    for i in 0..30u64 {
        node.put_config(
            "prod",
            &format!("key-{}", i % 10),
            format!("value-{i}").into_bytes(),
            ValueType::String,
            "writer",
        )
        .await
        .unwrap();
    }
    let (audit_before, _) = node.list_audit("prod", 1000).await.unwrap();

    // Snapshots were taken (interval 8 over 31 commands), so the log was
    // compacted; the restart must restore through a snapshot.
    let snapshots = std::fs::read_dir(root.path().join("node-0").join("snapshots"))
        .unwrap()
        .count();
    assert!(snapshots >= 1, "expected at least one snapshot on disk");

    cluster.stop_node(0);
    cluster.start_node(0).await.unwrap();
    cluster.wait_for_leader(Duration::from_secs(3)).await.unwrap();
    let node = cluster.node(0);

    for i in 20..30u64 {
        let key = format!("key-{}", i % 10);
        let (entry, value, _) = node.get_config("prod", &key).await.unwrap();
        assert_eq!(value, format!("value-{i}").into_bytes());
        assert_eq!(entry.version, 3, "{key} lost writes across restart");
    }
    let (ns, _) = node.get_namespace("prod").await.unwrap();
    assert_eq!(ns.owner, "platform");

    // Audit ids are deterministic, so replay/restore dedupes to the same
    // set of events.
    let (audit_after, _) = node.list_audit("prod", 1000).await.unwrap();
    assert_eq!(audit_before.len(), audit_after.len());
    assert_eq!(audit_before, audit_after);
}

/// A follower that was down across a compaction cannot be caught up from
/// the log alone; the leader must install a snapshot, then stream the
/// tail.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn lagging_follower_catches_up_via_snapshot_install() {
    let root = tempfile::tempdir().unwrap();
    let options = TestClusterOptions {
        snapshot_interval: 10,
        ..TestClusterOptions::default()
    };
    let mut cluster = TestCluster::start(root.path(), options).await.unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let follower = (0..3).find(|i| *i != leader).unwrap();
    cluster.stop_node(follower);

    // Enough writes to force at least one snapshot + compaction on the
    // surviving majority.
    for i in 0..40u64 {
        cluster
            .node(leader)
            .put_config(
                "prod",
                &format!("k{i}"),
                format!("v{i}").into_bytes(),
                ValueType::String,
                "writer",
            )
            .await
            .unwrap();
    }

    cluster.start_node(follower).await.unwrap();

    // The restarted follower converges on the full state.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let caught_up = match cluster.node(follower).get_config("prod", "k39").await {
            Ok((_, value, _)) => value == b"v39",
            Err(_) => false,
        };
        if caught_up {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "follower never caught up through snapshot install"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for i in [0u64, 15, 25, 39] {
        let (_, value, _) = cluster
            .node(follower)
            .get_config("prod", &format!("k{i}"))
            .await
            .unwrap();
        assert_eq!(value, format!("v{i}").into_bytes());
    }
}
