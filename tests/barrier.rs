use confman::barrier::ReadGuarantee;
use confman::config::BarrierFailureMode;
use confman::model::ValueType;
use confman::test_utils::{TestCluster, TestClusterOptions};
use confman::Error;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_reads_are_linearizable_after_a_write() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    // Sequential write-then-read pairs; each read goes to a follower and
    // must observe the acknowledged write.
    let follower = (0..3).find(|i| *i != leader).unwrap();
    for seq in 1..=10u64 {
        cluster
            .node(leader)
            .put_config(
                "lin",
                "counter",
                format!("{seq}").into_bytes(),
                ValueType::Integer,
                "w",
            )
            .await
            .unwrap();
        let (entry, value, guarantee) = cluster
            .node(follower)
            .get_config("lin", "counter")
            .await
            .unwrap();
        assert_eq!(guarantee, ReadGuarantee::Linearizable);
        assert_eq!(value, format!("{seq}").into_bytes());
        assert_eq!(entry.version, seq);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reject_mode_refuses_reads_without_quorum() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            barrier_mode: BarrierFailureMode::Reject,
            ..TestClusterOptions::default()
        },
    )
    .await
    .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    cluster
        .node(leader)
        .put_config("prod", "k", b"v".to_vec(), ValueType::String, "a")
        .await
        .unwrap();

    let follower = (0..3).find(|i| *i != leader).unwrap();
    cluster.isolate(follower);

    let err = cluster
        .node(follower)
        .get_config("prod", "k")
        .await
        .unwrap_err();
    assert!(
        matches!(err, Error::BarrierTimeout { .. }),
        "expected a barrier timeout, got {err}"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stale_mode_serves_with_a_warning_instead() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            barrier_mode: BarrierFailureMode::Stale,
            ..TestClusterOptions::default()
        },
    )
    .await
    .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    cluster
        .node(leader)
        .put_config("prod", "k", b"v".to_vec(), ValueType::String, "a")
        .await
        .unwrap();

    // Wait until the follower has applied the write, then cut it off.
    let follower = (0..3).find(|i| *i != leader).unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        if let Ok((_, value, _)) = cluster.node(follower).get_config("prod", "k").await {
            if value == b"v" {
                break;
            }
        }
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cluster.isolate(follower);

    let (_, value, guarantee) = cluster
        .node(follower)
        .get_config("prod", "k")
        .await
        .unwrap();
    assert_eq!(value, b"v");
    assert_eq!(guarantee, ReadGuarantee::Stale);
}
