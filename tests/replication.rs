use confman::model::{AuditVerb, ValueType};
use confman::test_utils::{TestCluster, TestClusterOptions};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn acknowledged_write_is_visible_on_every_node() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    cluster
        .node(leader)
        .put_config("prod", "timeout", b"5s".to_vec(), ValueType::String, "alice")
        .await
        .unwrap();

    // Barrier-gated reads on all three nodes see the committed value.
    for (i, node) in cluster.running() {
        let (entry, value, _) = node.get_config("prod", "timeout").await.unwrap();
        assert_eq!(value, b"5s", "node {i} returned the wrong value");
        assert_eq!(entry.version, 1, "node {i} returned the wrong version");
        assert_eq!(entry.updated_by, "alice");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn versions_increment_by_one_per_write() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    for i in 1..=5u64 {
        node.put_config(
            "prod",
            "retries",
            format!("{i}").into_bytes(),
            ValueType::Integer,
            "bob",
        )
        .await
        .unwrap();
        let (entry, value, _) = node.get_config("prod", "retries").await.unwrap();
        assert_eq!(entry.version, i);
        assert_eq!(value, format!("{i}").into_bytes());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn killed_leader_rejoins_and_catches_up() {
    let root = tempfile::tempdir().unwrap();
    let mut cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let first_leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    cluster
        .node(first_leader)
        .put_config("prod", "timeout", b"5s".to_vec(), ValueType::String, "alice")
        .await
        .unwrap();

    cluster.stop_node(first_leader);
    let second_leader = cluster
        .wait_for_leader(Duration::from_secs(3))
        .await
        .unwrap();

    cluster
        .node(second_leader)
        .put_config("prod", "timeout", b"10s".to_vec(), ValueType::String, "alice")
        .await
        .unwrap();
    let (entry, _, _) = cluster
        .node(second_leader)
        .get_config("prod", "timeout")
        .await
        .unwrap();
    assert_eq!(entry.version, 2);

    // The killed node restarts from its own log and converges.
    cluster.start_node(first_leader).await.unwrap();
    let restarted = cluster.node(first_leader);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        match restarted.get_config("prod", "timeout").await {
            Ok((entry, value, _)) if entry.version == 2 => {
                assert_eq!(value, b"10s");
                break;
            }
            _ => {
                assert!(
                    tokio::time::Instant::now() < deadline,
                    "restarted node never caught up"
                );
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn audit_trail_records_created_then_updated() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    node.put_config("prod", "flag", b"on".to_vec(), ValueType::String, "alice")
        .await
        .unwrap();
    node.put_config("prod", "flag", b"off".to_vec(), ValueType::String, "bob")
        .await
        .unwrap();
    node.delete_config("prod", "flag", "carol").await.unwrap();

    let (events, _) = node.list_audit("prod", 100).await.unwrap();
    assert_eq!(events.len(), 3);
    // Newest first.
    assert_eq!(events[0].action.verb, AuditVerb::Deleted);
    assert_eq!(events[0].actor, "carol");
    assert_eq!(events[1].action.verb, AuditVerb::Updated);
    assert_eq!(events[1].old_value.as_deref(), Some("on"));
    assert_eq!(events[1].new_value.as_deref(), Some("off"));
    assert_eq!(events[2].action.verb, AuditVerb::Created);
    assert_eq!(events[2].old_value, None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deleting_missing_key_is_a_silent_noop() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    node.delete_config("prod", "ghost", "alice").await.unwrap();
    let (events, _) = node.list_audit("prod", 100).await.unwrap();
    assert!(events.is_empty(), "no audit event for a no-op delete");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn namespace_lifecycle_round_trips() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    node.put_namespace("prod", "production configs", "platform", "alice")
        .await
        .unwrap();
    let (ns, _) = node.get_namespace("prod").await.unwrap();
    assert_eq!(ns.owner, "platform");
    let created_at = ns.created_at;

    node.put_namespace("prod", "production configuration", "platform", "bob")
        .await
        .unwrap();
    let (ns, _) = node.get_namespace("prod").await.unwrap();
    assert_eq!(ns.description, "production configuration");
    assert_eq!(ns.created_at, created_at);

    node.delete_namespace("prod", "carol").await.unwrap();
    assert!(node.get_namespace("prod").await.is_err());

    let (namespaces, _) = node.list_namespaces().await.unwrap();
    assert!(namespaces.is_empty());
}
