use confman::raft::RoleKind;
use confman::test_utils::{TestCluster, TestClusterOptions};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_cluster_elects_exactly_one_leader() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();

    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let leaders = cluster
        .running()
        .filter(|(_, n)| n.status().role == RoleKind::Leader)
        .count();
    assert_eq!(leaders, 1);

    // Every node knows the leader, so every node reports ready.
    for (i, node) in cluster.running() {
        assert!(node.is_ready(), "node {i} not ready");
        assert_eq!(node.status().leader, Some(confman::NodeId(leader as u64)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killing_the_leader_triggers_a_new_election() {
    let root = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();

    let old_leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let old_term = cluster.node(old_leader).status().term;
    cluster.stop_node(old_leader);

    let new_leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();
    assert_ne!(new_leader, old_leader);
    assert!(cluster.node(new_leader).status().term > old_term);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn isolated_node_cannot_stay_leader() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();

    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    cluster.isolate(leader);

    // The two connected nodes elect among themselves.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_leader = loop {
        let found = cluster
            .running()
            .filter(|(i, n)| *i != leader && n.status().role == RoleKind::Leader)
            .map(|(i, _)| i)
            .next();
        if let Some(found) = found {
            break found;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "no replacement leader elected"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_ne!(new_leader, leader);

    // The old leader loses quorum contact and steps down on its own.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if cluster.node(leader).status().role != RoleKind::Leader {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "isolated leader never stepped down"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_cluster_leads_itself() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            nodes: 1,
            ..TestClusterOptions::default()
        },
    )
    .await
    .unwrap();
    let leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(leader, 0);
}
