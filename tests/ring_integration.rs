//! End-to-end tests: lifecyclers writing through the KV store, rings
//! reading back through the watch loop.

use shardring::common::{hash_key, RingConfig};
use shardring::kv::MemoryKvStore;
use shardring::lifecycler::{BasicLifecycler, DefaultDelegate, TokensPersistencyDelegate};
use shardring::ring::model::RingDesc;
use shardring::ring::{InstanceState, Ring, WRITE};
use shardring::token::RandomTokenGenerator;
use shardring::KvStore;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn lifecycler_config(id: &str) -> shardring::common::LifecyclerConfig {
    shardring::common::LifecyclerConfig {
        id: id.to_string(),
        addr: format!("{}:9000", id),
        zone: String::new(),
        num_tokens: 64,
        heartbeat_period_secs: 1,
        tokens_observe_period_secs: 0,
        tokens_reverify_period_secs: 0,
        keep_instance_in_ring_on_shutdown: false,
        tokens_file_path: None,
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
async fn test_lifecycler_to_ring_propagation() {
    let store: Arc<MemoryKvStore<RingDesc>> = Arc::new(MemoryKvStore::new());

    let ring = Arc::new(Ring::new(RingConfig {
        replication_factor: 1,
        ..RingConfig::default()
    }));
    let watch = ring.start_watching(store.clone());

    let lc = BasicLifecycler::new(
        lifecycler_config("i-1"),
        "ring",
        store.clone(),
        Arc::new(DefaultDelegate),
        Arc::new(RandomTokenGenerator::new()),
    )
    .unwrap();
    let runner = tokio::spawn(lc.clone().run());

    let ring_check = ring.clone();
    eventually(move || ring_check.instances_count() == 1).await;

    let set = ring.get(hash_key("some-key"), WRITE).unwrap();
    assert_eq!(set.instances.len(), 1);
    assert_eq!(set.instances[0].id, "i-1");
    assert_eq!(set.instances[0].state, InstanceState::Active);

    lc.stop().await;
    runner.await.unwrap().unwrap();

    let ring_check = ring.clone();
    eventually(move || ring_check.instances_count() == 0).await;
    watch.abort();
}

#[tokio::test]
async fn test_three_instances_replicate_writes() {
    let store: Arc<MemoryKvStore<RingDesc>> = Arc::new(MemoryKvStore::new());

    let ring = Arc::new(Ring::new(RingConfig::default()));
    let watch = ring.start_watching(store.clone());

    let mut lcs = Vec::new();
    let mut runners = Vec::new();
    for id in ["i-1", "i-2", "i-3"] {
        let lc = BasicLifecycler::new(
            lifecycler_config(id),
            "ring",
            store.clone(),
            Arc::new(DefaultDelegate),
            Arc::new(RandomTokenGenerator::new()),
        )
        .unwrap();
        runners.push(tokio::spawn(lc.clone().run()));
        lcs.push(lc);
    }

    let ring_check = ring.clone();
    eventually(move || ring_check.instances_count() == 3).await;

    // RF=3 over 3 healthy instances: every key lands on all of them.
    let set = ring.get(hash_key("object/1"), WRITE).unwrap();
    let mut ids = set.instance_ids();
    ids.sort();
    assert_eq!(ids, vec!["i-1", "i-2", "i-3"]);
    assert_eq!(set.max_errors, 1);

    for lc in &lcs {
        lc.stop().await;
    }
    for runner in runners {
        runner.await.unwrap().unwrap();
    }
    watch.abort();
}

#[tokio::test]
async fn test_tokens_restored_from_file_after_ring_loss() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.json");
    let store: Arc<MemoryKvStore<RingDesc>> = Arc::new(MemoryKvStore::new());

    let mut cfg = lifecycler_config("i-1");
    cfg.keep_instance_in_ring_on_shutdown = true;
    cfg.tokens_file_path = Some(path.clone());

    let delegate = Arc::new(TokensPersistencyDelegate::new(
        &path,
        Arc::new(DefaultDelegate),
    ));

    let lc = BasicLifecycler::new(
        cfg.clone(),
        "ring",
        store.clone(),
        delegate.clone(),
        Arc::new(RandomTokenGenerator::new()),
    )
    .unwrap();
    let runner = tokio::spawn(lc.clone().run());
    let lc_check = lc.clone();
    eventually(move || lc_check.is_registered()).await;

    let original_tokens = lc.instance().unwrap().tokens;
    assert_eq!(original_tokens.len(), 64);
    lc.stop().await;
    runner.await.unwrap().unwrap();
    assert!(path.exists());

    // Simulate a ring wipe: the KV store forgets the instance entirely.
    store
        .cas("ring", Box::new(|_| Ok(Some(RingDesc::new()))))
        .await
        .unwrap();

    // A fresh lifecycler restores the exact token set from the file.
    let lc = BasicLifecycler::new(
        cfg,
        "ring",
        store.clone(),
        delegate,
        Arc::new(RandomTokenGenerator::new()),
    )
    .unwrap();
    let runner = tokio::spawn(lc.clone().run());
    let lc_check = lc.clone();
    eventually(move || lc_check.is_registered()).await;

    assert_eq!(lc.instance().unwrap().tokens, original_tokens);
    lc.stop().await;
    runner.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_heartbeat_keeps_instance_healthy() {
    let store: Arc<MemoryKvStore<RingDesc>> = Arc::new(MemoryKvStore::new());
    let ring = Arc::new(Ring::new(RingConfig {
        replication_factor: 1,
        heartbeat_timeout_secs: 3,
        ..RingConfig::default()
    }));
    let watch = ring.start_watching(store.clone());

    let lc = BasicLifecycler::new(
        lifecycler_config("i-1"),
        "ring",
        store.clone(),
        Arc::new(DefaultDelegate),
        Arc::new(RandomTokenGenerator::new()),
    )
    .unwrap();
    let runner = tokio::spawn(lc.clone().run());

    let ring_check = ring.clone();
    eventually(move || ring_check.instances_count() == 1).await;

    // Well past the first heartbeat period the instance is still routable.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(ring.get(12345, WRITE).is_ok());

    lc.stop().await;
    runner.await.unwrap().unwrap();
    watch.abort();
}
