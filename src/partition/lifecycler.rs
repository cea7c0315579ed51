//! Partition instance lifecycler
//!
//! Manages the N:1 relationship between an instance and its partition:
//! registers the instance as an owner (creating the partition row on
//! first registration), promotes the partition from Pending to Active
//! once enough owners have been stable for long enough, and reaps
//! Inactive partitions nobody owns anymore. It never reaps its own
//! partition.

use crate::common::{timestamp_now, Error, PartitionLifecyclerConfig, Result};
use crate::kv::KvStore;
use crate::partition::model::{PartitionRingDesc, PartitionState};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{info, warn};

enum Command {
    ChangeState(PartitionState, oneshot::Sender<Result<()>>),
    Stop(oneshot::Sender<()>),
}

pub struct PartitionInstanceLifecycler {
    cfg: PartitionLifecyclerConfig,
    store: Arc<dyn KvStore<PartitionRingDesc>>,
    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: Mutex<Option<mpsc::Receiver<Command>>>,
}

impl PartitionInstanceLifecycler {
    pub fn new(
        cfg: PartitionLifecyclerConfig,
        store: Arc<dyn KvStore<PartitionRingDesc>>,
    ) -> Arc<Self> {
        let (cmd_tx, cmd_rx) = mpsc::channel(16);
        Arc::new(Self {
            cfg,
            store,
            cmd_tx,
            cmd_rx: Mutex::new(Some(cmd_rx)),
        })
    }

    pub fn partition_id(&self) -> i32 {
        self.cfg.partition_id
    }

    /// Request an explicit partition state change (e.g. Active → Inactive
    /// when the partition should stop taking new data).
    pub async fn change_partition_state(&self, state: PartitionState) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ChangeState(state, tx))
            .await
            .map_err(|_| Error::Cancelled)?;
        rx.await.map_err(|_| Error::Cancelled)?
    }

    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// The actor loop: register, then reconcile on every poll tick until
    /// stopped.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut cmd_rx = self
            .cmd_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::Other("partition lifecycler already running".into()))?;

        self.register().await?;
        info!(
            partition = self.cfg.partition_id,
            owner = %self.cfg.instance_id,
            "partition lifecycler running"
        );

        let mut poll = tokio::time::interval(self.cfg.poll_interval());
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await;

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    if let Err(e) = self.reconcile().await {
                        warn!(
                            partition = self.cfg.partition_id,
                            error = %e,
                            "partition reconciliation failed, will retry"
                        );
                    }
                }
                Some(cmd) = cmd_rx.recv() => match cmd {
                    Command::ChangeState(state, ack) => {
                        let _ = ack.send(self.do_change_state(state).await);
                    }
                    Command::Stop(ack) => {
                        if let Err(e) = self.unregister_owner().await {
                            warn!(
                                partition = self.cfg.partition_id,
                                error = %e,
                                "failed to remove owner on shutdown"
                            );
                        }
                        let _ = ack.send(());
                        break;
                    }
                },
            }
        }
        Ok(())
    }

    /// Create the partition row if this is the first owner, and register
    /// ourselves as an owner.
    async fn register(&self) -> Result<()> {
        self.store
            .cas(
                &self.cfg.key,
                Box::new(move |desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let now = timestamp_now();
                    let mut changed =
                        desc.add_partition(self.cfg.partition_id, PartitionState::Pending, now)?;
                    if desc.add_or_update_owner(
                        &self.cfg.instance_id,
                        self.cfg.partition_id,
                        now,
                    ) {
                        changed = true;
                    }
                    Ok(changed.then_some(desc))
                }),
            )
            .await
    }

    /// One reconciliation pass: promote our Pending partition when the
    /// owner set has been stable long enough, and reap Inactive partitions
    /// without owners past the grace period.
    async fn reconcile(&self) -> Result<()> {
        self.store
            .cas(
                &self.cfg.key,
                Box::new(move |desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let now = timestamp_now();
                    let mut changed = false;

                    if self.try_promote(&mut desc, now)? {
                        changed = true;
                    }
                    if self.reap_abandoned(&mut desc, now) {
                        changed = true;
                    }
                    Ok(changed.then_some(desc))
                }),
            )
            .await
    }

    fn try_promote(&self, desc: &mut PartitionRingDesc, now: u64) -> Result<bool> {
        let Some(partition) = desc.partitions.get(&self.cfg.partition_id) else {
            return Ok(false);
        };
        if partition.state != PartitionState::Pending || partition.state_change_locked {
            return Ok(false);
        }

        let owners = desc.partition_owners(self.cfg.partition_id);
        if owners.len() < self.cfg.wait_owners_count_on_pending {
            return Ok(false);
        }
        // Stability: every owner's registration must be older than the
        // wait duration, so a churning owner set does not activate early.
        let stable_since = now.saturating_sub(self.cfg.wait_owners_duration_on_pending_secs);
        let all_stable = owners
            .iter()
            .all(|id| desc.owners[*id].updated_timestamp <= stable_since);
        if !all_stable {
            return Ok(false);
        }

        desc.set_partition_state(self.cfg.partition_id, PartitionState::Active, now)?;
        info!(partition = self.cfg.partition_id, "partition promoted to ACTIVE");
        Ok(true)
    }

    fn reap_abandoned(&self, desc: &mut PartitionRingDesc, now: u64) -> bool {
        let Some(grace) = self.cfg.delete_inactive_partition_after() else {
            return false;
        };
        let cutoff = now.saturating_sub(grace.as_secs());
        let doomed: Vec<i32> = desc
            .partitions
            .values()
            .filter(|p| {
                p.id != self.cfg.partition_id
                    && p.state == PartitionState::Inactive
                    && !p.state_change_locked
                    && p.state_timestamp < cutoff
                    && desc.partition_owners(p.id).is_empty()
            })
            .map(|p| p.id)
            .collect();

        for id in &doomed {
            info!(partition = id, "reaping abandoned inactive partition");
            desc.remove_partition(*id);
        }
        !doomed.is_empty()
    }

    async fn do_change_state(&self, state: PartitionState) -> Result<()> {
        let mut result = Ok(false);
        self.store
            .cas(&self.cfg.key, {
                let result = &mut result;
                Box::new(move |desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    match desc.set_partition_state(self.cfg.partition_id, state, timestamp_now())
                    {
                        Ok(changed) => {
                            *result = Ok(changed);
                            Ok(changed.then_some(desc))
                        }
                        Err(e) => Err(e),
                    }
                })
            })
            .await?;
        result.map(|_| ())
    }

    async fn unregister_owner(&self) -> Result<()> {
        self.store
            .cas(
                &self.cfg.key,
                Box::new(move |desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let changed = desc.remove_owner(&self.cfg.instance_id);
                    Ok(changed.then_some(desc))
                }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;
    use std::time::Duration;

    fn config(partition_id: i32, instance_id: &str) -> PartitionLifecyclerConfig {
        PartitionLifecyclerConfig {
            key: "partition-ring".to_string(),
            partition_id,
            instance_id: instance_id.to_string(),
            poll_interval_secs: 1,
            wait_owners_count_on_pending: 1,
            wait_owners_duration_on_pending_secs: 2,
            delete_inactive_partition_after_secs: 60,
        }
    }

    async fn get_desc(store: &MemoryKvStore<PartitionRingDesc>) -> PartitionRingDesc {
        store.get("partition-ring").await.unwrap().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_creates_partition_and_owner() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        let desc = get_desc(&store).await;
        assert_eq!(desc.partitions[&1].state, PartitionState::Pending);
        assert_eq!(desc.partition_owners(1), vec!["i-1"]);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotes_after_stable_owner_period() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        // The owner just registered: not yet stable, partition stays Pending
        // across several reconcile ticks.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(get_desc(&store).await.partitions[&1].state, PartitionState::Pending);

        // Backdate the registration past the wait duration; the next pass
        // promotes.
        store
            .cas(
                "partition-ring",
                Box::new(|desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    desc.owners.get_mut("i-1").unwrap().updated_timestamp =
                        timestamp_now().saturating_sub(60);
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(get_desc(&store).await.partitions[&1].state, PartitionState::Active);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reaps_abandoned_inactive_partition() {
        let store = Arc::new(MemoryKvStore::new());

        // A leftover partition: inactive long ago, no owners.
        store
            .cas(
                "partition-ring",
                Box::new(|_| {
                    let mut desc = PartitionRingDesc::new();
                    let now = timestamp_now();
                    desc.add_partition(9, PartitionState::Pending, now - 7200)?;
                    desc.set_partition_state(9, PartitionState::Inactive, now - 3600)?;
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();

        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_secs(3)).await;
        let desc = get_desc(&store).await;
        assert!(!desc.has_partition(9));
        assert!(desc.has_partition(1));

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_reaps_own_partition() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());
        tokio::time::sleep(Duration::from_secs(5)).await;

        // Force our own partition inactive far in the past with no owners.
        store
            .cas(
                "partition-ring",
                Box::new(|desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let partition = desc.partitions.get_mut(&1).unwrap();
                    partition.state = PartitionState::Inactive;
                    partition.state_timestamp = timestamp_now().saturating_sub(3600);
                    desc.remove_owner("i-1");
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(get_desc(&store).await.has_partition(1));

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reap_respects_grace_period() {
        let store = Arc::new(MemoryKvStore::new());
        store
            .cas(
                "partition-ring",
                Box::new(|_| {
                    let mut desc = PartitionRingDesc::new();
                    let now = timestamp_now();
                    desc.add_partition(9, PartitionState::Pending, now - 100)?;
                    // Went inactive only just now: inside the grace period.
                    desc.set_partition_state(9, PartitionState::Inactive, now)?;
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();

        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(get_desc(&store).await.has_partition(9));

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_partition_state() {
        let store = Arc::new(MemoryKvStore::new());
        let mut cfg = config(1, "i-1");
        // No stability requirement: first reconcile pass promotes.
        cfg.wait_owners_duration_on_pending_secs = 0;
        let lc = PartitionInstanceLifecycler::new(cfg, store.clone());
        let runner = tokio::spawn(lc.clone().run());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(get_desc(&store).await.partitions[&1].state, PartitionState::Active);

        lc.change_partition_state(PartitionState::Inactive)
            .await
            .unwrap();
        assert_eq!(
            get_desc(&store).await.partitions[&1].state,
            PartitionState::Inactive
        );

        // Pending is never a legal target again.
        let err = lc
            .change_partition_state(PartitionState::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_removes_owner_not_partition() {
        let store = Arc::new(MemoryKvStore::new());
        let lc = PartitionInstanceLifecycler::new(config(1, "i-1"), store.clone());
        let runner = tokio::spawn(lc.clone().run());
        tokio::time::sleep(Duration::from_millis(100)).await;

        lc.stop().await;
        runner.await.unwrap().unwrap();

        let desc = get_desc(&store).await;
        assert!(desc.has_partition(1));
        assert!(desc.partition_owners(1).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_owner_count() {
        let store = Arc::new(MemoryKvStore::new());
        let mut cfg = config(1, "i-1");
        cfg.wait_owners_count_on_pending = 2;
        let lc = PartitionInstanceLifecycler::new(cfg, store.clone());
        let runner = tokio::spawn(lc.clone().run());

        // One owner is not enough.
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(get_desc(&store).await.partitions[&1].state, PartitionState::Pending);

        // A second stable owner unlocks the promotion (both registrations
        // backdated past the wait duration).
        store
            .cas(
                "partition-ring",
                Box::new(|desc: Option<PartitionRingDesc>| {
                    let mut desc = desc.unwrap_or_default();
                    let stable = timestamp_now().saturating_sub(60);
                    desc.add_or_update_owner("i-2", 1, stable);
                    desc.owners.get_mut("i-1").unwrap().updated_timestamp = stable;
                    Ok(Some(desc))
                }),
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(get_desc(&store).await.partitions[&1].state, PartitionState::Active);

        lc.stop().await;
        runner.await.unwrap().unwrap();
    }
}
