use confman::model::ValueType;
use confman::test_utils::{TestCluster, TestClusterOptions};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;

fn blob_path(root: &std::path::Path, node: usize, blob_id: &str) -> PathBuf {
    root.join(format!("node-{node}"))
        .join("blobs")
        .join(&blob_id[..2])
        .join(blob_id)
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn large_value_travels_through_the_blob_side_channel() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    let value = random_bytes(1024 * 1024);
    let blob_id = hex::encode(Sha256::digest(&value));

    node.put_config("big", "blob", value.clone(), ValueType::Binary, "alice")
        .await
        .unwrap();

    // Durable-blob-first: by the time the write acks, a quorum of nodes
    // holds the blob file.
    let present = (0..3)
        .filter(|i| blob_path(root.path(), *i, &blob_id).exists())
        .count();
    assert!(present >= 2, "blob on {present} of 3 nodes at ack time");

    // The entry in the log is a pointer, not the bytes.
    let (entry, read_back, _) = node.get_config("big", "blob").await.unwrap();
    assert_eq!(entry.blob_id.as_deref(), Some(blob_id.as_str()));
    assert!(entry.value.is_none());
    assert_eq!(read_back, value);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn inline_threshold_boundary_is_exact() {
    let root = tempfile::tempdir().unwrap();
    let threshold = 4096u64;
    let cluster = TestCluster::start(
        root.path(),
        TestClusterOptions {
            inline_threshold_bytes: threshold,
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

    // Exactly at the threshold: blob path.
    node.put_config(
        "edge",
        "at",
        random_bytes(threshold as usize),
        ValueType::Binary,
        "a",
    )
    .await
    .unwrap();
    let (entry, _, _) = node.get_config("edge", "at").await.unwrap();
    assert!(entry.is_blob_backed(), "value at threshold must use a blob");

    // One byte less: inline path.
    node.put_config(
        "edge",
        "under",
        random_bytes(threshold as usize - 1),
        ValueType::Binary,
        "a",
    )
    .await
    .unwrap();
    let (entry, _, _) = node.get_config("edge", "under").await.unwrap();
    assert!(!entry.is_blob_backed(), "value under threshold stays inline");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_repairs_a_deleted_blob_from_peers() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();

    let value = random_bytes(256 * 1024);
    let blob_id = hex::encode(Sha256::digest(&value));
    cluster
        .node(leader)
        .put_config("big", "repair", value.clone(), ValueType::Binary, "a")
        .await
        .unwrap();

    // Pick a follower, make sure the blob landed there, then delete it.
    let follower = (0..3).find(|i| *i != leader).unwrap();
    let path = blob_path(root.path(), follower, &blob_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !path.exists() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "blob never replicated to the follower"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    std::fs::remove_file(&path).unwrap();

    // A read on that follower pulls the blob back from a peer.
    let (_, read_back, _) = cluster
        .node(follower)
        .get_config("big", "repair")
        .await
        .unwrap();
    assert_eq!(read_back, value);
    assert!(path.exists(), "repair should restore the local blob file");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn identical_concurrent_writes_share_one_blob() {
    let root = tempfile::tempdir().unwrap();
    let cluster = TestCluster::start(root.path(), TestClusterOptions::default())
        .await
        .unwrap();
    let leader = cluster
        .wait_for_stable_leader(Duration::from_secs(5))
        .await
        .unwrap();
    let node = cluster.node(leader);

    let value = random_bytes(128 * 1024);
    let blob_id = hex::encode(Sha256::digest(&value));

    let a = node.put_config("dup", "one", value.clone(), ValueType::Binary, "a");
    let b = node.put_config("dup", "two", value.clone(), ValueType::Binary, "b");
    let (ra, rb) = tokio::join!(a, b);
    ra.unwrap();
    rb.unwrap();

    let (entry_a, _, _) = node.get_config("dup", "one").await.unwrap();
    let (entry_b, _, _) = node.get_config("dup", "two").await.unwrap();
    assert_eq!(entry_a.blob_id.as_deref(), Some(blob_id.as_str()));
    assert_eq!(entry_b.blob_id.as_deref(), Some(blob_id.as_str()));

    // Content addressing deduplicates: one file on the leader.
    let shard = root
        .path()
        .join(format!("node-{leader}"))
        .join("blobs")
        .join(&blob_id[..2]);
    assert_eq!(std::fs::read_dir(shard).unwrap().count(), 1);
}
