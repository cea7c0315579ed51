//! End-to-end tests for the partition ring: lifecycler, KV store and
//! watcher working together.

use shardring::common::hash_key;
use shardring::kv::MemoryKvStore;
use shardring::partition::{
    PartitionInstanceLifecycler, PartitionRingDesc, PartitionRingWatcher, PartitionState,
};
use shardring::KvStore;
use std::sync::Arc;
use std::time::Duration;

fn config(partition_id: i32, instance_id: &str) -> shardring::common::PartitionLifecyclerConfig {
    shardring::common::PartitionLifecyclerConfig {
        key: "partition-ring".to_string(),
        partition_id,
        instance_id: instance_id.to_string(),
        poll_interval_secs: 1,
        wait_owners_count_on_pending: 1,
        wait_owners_duration_on_pending_secs: 0,
        delete_inactive_partition_after_secs: 0,
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test]
async fn test_partition_lifecycle_through_watcher() {
    let store: Arc<MemoryKvStore<PartitionRingDesc>> = Arc::new(MemoryKvStore::new());

    let watcher = PartitionRingWatcher::new("partition-ring");
    let watch = watcher.start_watching(store.clone());

    let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
    let runner = tokio::spawn(lc.clone().run());

    // The partition shows up Pending, then gets promoted once the owner
    // is considered stable (no wait configured here).
    let w = watcher.clone();
    eventually(move || w.ring().active_partitions_count() == 1).await;

    let ring = watcher.ring();
    let partition = ring.active_partition_for_key(hash_key("series-1")).unwrap();
    assert_eq!(partition.id, 1);
    assert_eq!(ring.descriptor().partition_owners(1), vec!["i-1"]);

    lc.stop().await;
    runner.await.unwrap().unwrap();

    // The partition outlives its owner.
    let w = watcher.clone();
    eventually(move || w.ring().descriptor().partition_owners(1).is_empty()).await;
    assert_eq!(watcher.ring().active_partitions_count(), 1);
    watch.abort();
}

#[tokio::test]
async fn test_multiple_partitions_share_the_keyspace() {
    let store: Arc<MemoryKvStore<PartitionRingDesc>> = Arc::new(MemoryKvStore::new());

    let mut lcs = Vec::new();
    let mut runners = Vec::new();
    for (partition_id, instance_id) in [(0, "i-0"), (1, "i-1"), (2, "i-2")] {
        let lc = PartitionInstanceLifecycler::new(config(partition_id, instance_id), store.clone());
        runners.push(tokio::spawn(lc.clone().run()));
        lcs.push(lc);
    }

    let watcher = PartitionRingWatcher::new("partition-ring");
    let watch = watcher.start_watching(store.clone());
    let w = watcher.clone();
    eventually(move || w.ring().active_partitions_count() == 3).await;

    // Keys spread over all three partitions.
    let ring = watcher.ring();
    let mut seen = std::collections::BTreeSet::new();
    for i in 0..64u32 {
        let key = hash_key(&format!("key-{}", i));
        seen.insert(ring.active_partition_for_key(key).unwrap().id);
    }
    assert_eq!(seen.len(), 3);

    // Shuffle shards are deterministic subsets.
    let shard = ring.shuffle_shard("tenant-a", 2).unwrap();
    assert_eq!(shard.active_partitions_count(), 2);
    let again = ring.shuffle_shard("tenant-a", 2).unwrap();
    assert_eq!(
        shard.descriptor().partitions.keys().collect::<Vec<_>>(),
        again.descriptor().partitions.keys().collect::<Vec<_>>()
    );

    for lc in &lcs {
        lc.stop().await;
    }
    for runner in runners {
        runner.await.unwrap().unwrap();
    }
    watch.abort();
}

#[tokio::test]
async fn test_deactivated_partition_stops_taking_keys() {
    let store: Arc<MemoryKvStore<PartitionRingDesc>> = Arc::new(MemoryKvStore::new());

    let lc_a = PartitionInstanceLifecycler::new(config(0, "i-0"), store.clone());
    let lc_b = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
    let runner_a = tokio::spawn(lc_a.clone().run());
    let runner_b = tokio::spawn(lc_b.clone().run());

    let watcher = PartitionRingWatcher::new("partition-ring");
    let watch = watcher.start_watching(store.clone());
    let w = watcher.clone();
    eventually(move || w.ring().active_partitions_count() == 2).await;

    lc_b.change_partition_state(PartitionState::Inactive)
        .await
        .unwrap();
    let w = watcher.clone();
    eventually(move || w.ring().active_partitions_count() == 1).await;

    // Every key now routes to the remaining active partition.
    let ring = watcher.ring();
    for i in 0..32u32 {
        let key = hash_key(&format!("key-{}", i));
        assert_eq!(ring.active_partition_for_key(key).unwrap().id, 0);
    }

    lc_a.stop().await;
    lc_b.stop().await;
    runner_a.await.unwrap().unwrap();
    runner_b.await.unwrap().unwrap();
    watch.abort();
}
