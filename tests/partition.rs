use confman::model::ValueType;
use confman::raft::RoleKind;
use confman::test_utils::{TestCluster, TestClusterOptions};
use std::time::Duration;

/// Partition the leader away from both followers: the majority side keeps
/// making progress, the minority side stops acking writes, and after the
/// heal the old leader converges without keeping its uncommitted tail.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn minority_leader_loses_its_uncommitted_tail() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let old_leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    cluster
        .node(old_leader)
        .put_config("prod", "x", b"committed".to_vec(), ValueType::String, "a")
        .await
        .unwrap();

    cluster.isolate(old_leader);

    // A write against the cut-off leader cannot commit.
    let old_leader_node = cluster.node(old_leader);
    let stranded = old_leader_node.put_config(
        "prod",
        "x",
        b"stranded".to_vec(),
        ValueType::String,
        "a",
    );
    let stranded_result = tokio::time::timeout(Duration::from_secs(3), stranded)
        .await
        .expect("write should fail, not hang");
    assert!(stranded_result.is_err(), "minority write must not succeed");

    // The majority elects a replacement and accepts writes.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let found = cluster
            .running()
            .filter(|(i, n)| *i != old_leader && n.status().role == RoleKind::Leader)
            .map(|(i, _)| i)
            .next();
        if let Some(found) = found {
            break found;
        }
        assert!(tokio::time::Instant::now() < deadline, "no new leader");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    cluster
        .node(new_leader)
        .put_config("prod", "x", b"y".to_vec(), ValueType::String, "a")
        .await
        .unwrap();

    cluster.heal_all();

    // The old leader rejoins as a follower and reads the majority value.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let healed = cluster.node(old_leader);
        if let Ok((entry, value, _)) = healed.get_config("prod", "x").await {
            if value == b"y" {
                // Version 2: "committed" then "y"; the stranded write
                // never became an apply.
                assert_eq!(entry.version, 2);
                break;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "old leader never converged"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cluster_survives_loss_of_one_node() {
    let root = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    // Drop one follower; a 3-node cluster still has its majority.
    let follower = (0..3).find(|i| *i != leader).unwrap();
    cluster.stop_node(follower);

    cluster
        .node(leader)
        .put_config("prod", "k", b"v".to_vec(), ValueType::String, "a")
        .await
        .unwrap();
    let (_, value, _) = cluster.node(leader).get_config("prod", "k").await.unwrap();
    assert_eq!(value, b"v");
}
